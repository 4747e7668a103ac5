//! Uniform I/O handle.
//!
//! A C-style `struct uio` vtable with a hand-rolled refcount and a `void*`
//! control argument shared by every op becomes a trait object plus an
//! `Arc`: `add_ref` is `Arc::clone`, `close` is a drop, and the vtable's
//! `close` callback is whatever `Drop` impl the concrete handle provides.
//! The control op's `void* arg` becomes a typed payload on the `Control`
//! enum instead of an out-pointer.

use std::sync::Arc;

use crate::error::{KernelError, Result};

/// A control operation, matching the fixed set the source's `uio_cntl`
/// dispatches on. Unsupported operations return `NotSup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Read the current end-of-stream position.
    GetEnd,
    /// Set the end-of-stream position.
    SetEnd(u64),
    /// Read the byte cursor.
    GetPos,
    /// Set the byte cursor. Implementations reject a value past the
    /// current end with `Inval`.
    SetPos(u64),
}

/// Result of a control operation that reads back a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlValue {
    None,
    Pos(u64),
}

/// Operations every I/O handle exposes. Concrete handles (a KTFS open
/// file, a raw storage device) implement only what they support; the
/// defaults here return `NotSup`, standing in for a vtable slot left null.
pub trait IoHandle: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(KernelError::NotSup)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(KernelError::NotSup)
    }

    fn control(&self, _op: Control) -> Result<ControlValue> {
        Err(KernelError::NotSup)
    }
}

/// A shared, reference-counted I/O handle. Lifetime is the longest holder:
/// the handle's `Drop` impl (whatever it does to release device-specific
/// resources) runs only when the last `Handle` is dropped.
pub type Handle = Arc<dyn IoHandle>;

/// Bumps the reference count and returns a new handle to the same
/// underlying object.
pub fn add_ref(handle: &Handle) -> Handle {
    Arc::clone(handle)
}

/// Drops this reference. When it was the last one, the underlying
/// handle's own `Drop` impl runs and releases its resources.
pub fn close(handle: Handle) {
    drop(handle);
}
