//! Tuning constants, gathered in one place the way the rest of the tree
//! gathers them (originally `NCPU`/`NPROC`/`NBUF` in a flat module).

/// Fixed block size for the cache, the storage contract and KTFS. A power
/// of two; the backing device's own block size must match it.
pub const BLOCK_SIZE: usize = 512;

/// Number of slots in the fixed-size block cache.
pub const CACHE_SLOTS: usize = 64;

/// Direct block pointers held inline in a KTFS inode.
pub const KTFS_NUM_DIRECT_DATA_BLOCKS: usize = 4;

/// Double-indirect block pointers held inline in a KTFS inode. Sized so a
/// whole inode is 32 bytes (4 + 4*4 + 4 + 4*2), matching on-disk images
/// that pack exactly 16 inodes per 512-byte block. Only the first slot is
/// exercised by any known image, but the format allows more than one.
pub const KTFS_NUM_DINDIRECT_BLOCKS: usize = 2;

/// Longest filename KTFS can store, not counting the terminator.
pub const KTFS_MAX_FILENAME_LEN: usize = 11;

/// Upper bound the VirtIO driver will accept for a negotiated queue
/// length, regardless of what the device advertises.
pub const VIRTQ_MAX_QUEUE_LEN: usize = 128;

/// Ceiling on live VirtIO tickets, standing in for the heap-safe cap the
/// source derives from `HEAP_ALLOC_MAX / sizeof(ticket)`. A hosted crate
/// has no fixed heap budget to divide by, so this is a constant upper
/// bound instead of a computed one.
pub const VIRTQ_TICKET_BUDGET: usize = 1024;
