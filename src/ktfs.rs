//! KTFS: the read-only hierarchical filesystem.
//!
//! Generalizes `ktfs.c`. The on-disk layout, block-mapping descent and
//! root-directory scan are kept exactly as the source describes; the
//! vtable (`struct ktfs`/`struct ktfs_file`) becomes owned Rust structs
//! registered with the mount table as a trait object.
//!
//! The source's inode record is commented "512/16" (16 bytes, 32 per
//! block), but its own test fixtures pack exactly 16 inodes into one
//! block and lay out an inode with four direct block numbers, one
//! indirect, a double-indirect slot and a size field: 32 bytes, not 16.
//! Only the directory entry is genuinely 16 bytes (a 4-byte inode number
//! plus a 12-byte name field, holding `KTFS_MAX_FILENAME_LEN` characters
//! plus a terminator). This reader sizes `Inode` to its real field layout
//! and computes inodes-per-block at mount time instead of hardcoding 32.

use std::sync::{Arc, Weak};

use bytemuck::{Pod, Zeroable};
use log::{debug, trace};

use crate::cache::Cache;
use crate::error::{KernelError, Result};
use crate::io::{Control, ControlValue, Handle, IoHandle};
use crate::mount::{self, FileSystem};
use crate::param::{
    BLOCK_SIZE, KTFS_MAX_FILENAME_LEN, KTFS_NUM_DINDIRECT_BLOCKS, KTFS_NUM_DIRECT_DATA_BLOCKS,
};

const ENTRIES_PER_INDIRECT: usize = BLOCK_SIZE / size_of::<u32>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Superblock {
    block_count: u32,
    inode_bitmap_block_count: u32,
    bitmap_block_count: u32,
    inode_block_count: u32,
    root_directory_inode: u32,
}

/// An on-disk inode: byte size plus direct, single-indirect and
/// double-indirect block numbers. A block number of 0 means "unallocated
/// hole".
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Inode {
    pub size: u32,
    pub block: [u32; KTFS_NUM_DIRECT_DATA_BLOCKS],
    pub indirect: u32,
    pub dindirect: [u32; KTFS_NUM_DINDIRECT_BLOCKS],
}

/// A 16-byte directory entry: an inode number plus a bounded filename.
/// An inode number of 0 means "empty slot".
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DirEntry {
    pub inode: u32,
    name: [u8; KTFS_MAX_FILENAME_LEN + 1],
}

impl DirEntry {
    fn name_matches(&self, target: &str) -> bool {
        let bytes = target.as_bytes();
        if bytes.len() > KTFS_MAX_FILENAME_LEN {
            return false;
        }
        let stored_len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..stored_len] == bytes
    }
}

/// Mount context: a cache, the cached superblock, derived region bases
/// and per-block entry counts.
pub struct Ktfs {
    cache: Arc<Cache>,
    super_block: Superblock,
    inode_table_start: u64,
    /// Kept for parity with the source's region layout even though no
    /// operation here indexes through it directly; block numbers in
    /// inodes are already absolute.
    #[allow(dead_code)]
    data_block_start: u64,
    inodes_per_block: usize,
    dirents_per_block: usize,
    total_inodes: u64,
    /// Back-reference so `open` can hand a `KtfsFile` its own strong
    /// reference to the mount context without the mount table having to
    /// pass an `Arc<Self>` through the `FileSystem` trait's `&self` call.
    self_ref: Weak<Ktfs>,
}

/// Binds `name` in the mount table to a freshly mounted KTFS image.
pub fn mount_ktfs(name: &str, cache: Arc<Cache>) -> Result<()> {
    let block = cache.get_block(0)?;
    let super_block: Superblock = *bytemuck::from_bytes(&block.as_slice()[..size_of::<Superblock>()]);
    cache.release(block, false);

    let inode_bitmap_start = 1u64;
    let block_bitmap_start = inode_bitmap_start + super_block.inode_bitmap_block_count as u64;
    let inode_table_start = block_bitmap_start + super_block.bitmap_block_count as u64;
    let data_block_start = inode_table_start + super_block.inode_block_count as u64;

    let inodes_per_block = BLOCK_SIZE / size_of::<Inode>();
    let dirents_per_block = BLOCK_SIZE / size_of::<DirEntry>();
    let total_inodes = super_block.inode_block_count as u64 * inodes_per_block as u64;

    debug!(
        target: "ktfs",
        "mounting {name}: {} inodes over {} inode-table blocks, data starts at block {data_block_start}",
        total_inodes, super_block.inode_block_count
    );

    let ktfs = Arc::new_cyclic(|self_ref| Ktfs {
        cache,
        super_block,
        inode_table_start,
        data_block_start,
        inodes_per_block,
        dirents_per_block,
        total_inodes,
        self_ref: self_ref.clone(),
    });

    mount::table().mount(name, ktfs);
    Ok(())
}

impl Ktfs {
    fn read_inode(&self, ino: u32) -> Result<Inode> {
        if ino as u64 >= self.total_inodes {
            return Err(KernelError::NotFound);
        }

        let block_idx = self.inode_table_start + ino as u64 / self.inodes_per_block as u64;
        let offset = ino as usize % self.inodes_per_block;

        let block = self.cache.get_block(block_idx * BLOCK_SIZE as u64)?;
        let start = offset * size_of::<Inode>();
        let inode: Inode = *bytemuck::from_bytes(&block.as_slice()[start..start + size_of::<Inode>()]);
        self.cache.release(block, false);
        Ok(inode)
    }

    fn read_block_entry(&self, block_no: u32, index: usize) -> Result<u32> {
        if block_no == 0 {
            return Err(KernelError::NotFound);
        }
        if index >= ENTRIES_PER_INDIRECT {
            return Err(KernelError::Inval);
        }

        let block = self.cache.get_block(block_no as u64 * BLOCK_SIZE as u64)?;
        let start = index * size_of::<u32>();
        let value = u32::from_le_bytes(block.as_slice()[start..start + 4].try_into().unwrap());
        self.cache.release(block, false);
        Ok(value)
    }

    /// Translates a logical block index within a file to a physical block
    /// number, descending through direct, single-indirect and
    /// double-indirect levels.
    fn block_map(&self, inode: &Inode, logical_index: usize) -> Result<u32> {
        if logical_index < KTFS_NUM_DIRECT_DATA_BLOCKS {
            let block = inode.block[logical_index];
            return if block == 0 {
                Err(KernelError::NotFound)
            } else {
                Ok(block)
            };
        }

        let mut remainder = logical_index - KTFS_NUM_DIRECT_DATA_BLOCKS;

        if remainder < ENTRIES_PER_INDIRECT {
            let block = self.read_block_entry(inode.indirect, remainder)?;
            return if block == 0 {
                Err(KernelError::NotFound)
            } else {
                Ok(block)
            };
        }
        remainder -= ENTRIES_PER_INDIRECT;

        let span = ENTRIES_PER_INDIRECT * ENTRIES_PER_INDIRECT;
        for &dindirect_block in inode.dindirect.iter() {
            if remainder < span {
                let l2_block = self.read_block_entry(dindirect_block, remainder / ENTRIES_PER_INDIRECT)?;
                let block = self.read_block_entry(l2_block, remainder % ENTRIES_PER_INDIRECT)?;
                return if block == 0 {
                    Err(KernelError::NotFound)
                } else {
                    Ok(block)
                };
            }
            remainder -= span;
        }

        Err(KernelError::Inval)
    }

    fn search_directory(&self, dir_inode: &Inode, name: &str) -> Result<(DirEntry, Inode)> {
        let count = dir_inode.size as usize / size_of::<DirEntry>();

        for i in 0..count {
            let logical_block = i / self.dirents_per_block;
            let offset_in_block = i % self.dirents_per_block;

            let physical = self.block_map(dir_inode, logical_block)?;
            let block = self.cache.get_block(physical as u64 * BLOCK_SIZE as u64)?;
            let start = offset_in_block * size_of::<DirEntry>();
            let entry: DirEntry =
                *bytemuck::from_bytes(&block.as_slice()[start..start + size_of::<DirEntry>()]);
            self.cache.release(block, false);

            if entry.inode != 0 && entry.name_matches(name) {
                let inode = self.read_inode(entry.inode)?;
                return Ok((entry, inode));
            }
        }

        Err(KernelError::NotFound)
    }

    fn find(&self, name: &str) -> Result<(DirEntry, Inode)> {
        let root_inode = self.read_inode(self.super_block.root_directory_inode)?;
        self.search_directory(&root_inode, name)
    }
}

impl FileSystem for Ktfs {
    fn open(&self, name: &str) -> Result<Handle> {
        if name.is_empty() || name == "/" {
            return Err(KernelError::NotSup);
        }
        if name.contains('/') {
            return Err(KernelError::NotSup);
        }

        let (directory, inode) = self.find(name)?;
        trace!(target: "ktfs", "opened {name} (inode size {} bytes)", inode.size);

        let ktfs = self
            .self_ref
            .upgrade()
            .expect("ktfs mount context dropped while still mounted");

        Ok(Arc::new(KtfsFile {
            ktfs,
            directory,
            inode,
            size: inode.size as u64,
            cursor: std::sync::Mutex::new(0),
        }))
    }

    fn flush(&self) -> Result<()> {
        self.cache.flush()
    }
}

/// An open KTFS file: a directory entry and inode snapshot from open
/// time, plus a byte cursor.
struct KtfsFile {
    ktfs: Arc<Ktfs>,
    #[allow(dead_code)]
    directory: DirEntry,
    inode: Inode,
    size: u64,
    cursor: std::sync::Mutex<u64>,
}

impl IoHandle for KtfsFile {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cursor = self.cursor.lock().unwrap();
        if *cursor >= self.size {
            return Ok(0);
        }

        let remaining = self.size - *cursor;
        let want = std::cmp::min(buf.len() as u64, remaining) as usize;
        let mut done = 0usize;

        while done < want {
            let pos = *cursor + done as u64;
            let logical_block = (pos / BLOCK_SIZE as u64) as usize;
            let offset = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = std::cmp::min(want - done, BLOCK_SIZE - offset);

            let physical = match self.ktfs.block_map(&self.inode, logical_block) {
                Ok(p) => p,
                Err(e) => {
                    if done > 0 {
                        break;
                    }
                    return Err(e);
                }
            };

            let block = match self.ktfs.cache.get_block(physical as u64 * BLOCK_SIZE as u64) {
                Ok(b) => b,
                Err(e) => {
                    if done > 0 {
                        break;
                    }
                    return Err(e);
                }
            };

            buf[done..done + chunk].copy_from_slice(&block.as_slice()[offset..offset + chunk]);
            self.ktfs.cache.release(block, false);
            done += chunk;
        }

        *cursor += done as u64;
        Ok(done)
    }

    fn control(&self, op: Control) -> Result<ControlValue> {
        match op {
            Control::GetEnd => Ok(ControlValue::Pos(self.size)),
            Control::GetPos => Ok(ControlValue::Pos(*self.cursor.lock().unwrap())),
            Control::SetPos(pos) => {
                if pos > self.size {
                    return Err(KernelError::Inval);
                }
                *self.cursor.lock().unwrap() = pos;
                Ok(ControlValue::None)
            }
            Control::SetEnd(_) => Err(KernelError::NotSup),
        }
    }
}
