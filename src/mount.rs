//! Mount table: a flat string-keyed name → filesystem binding.
//!
//! The source models this as shared global state (a fixed-size array of
//! `(name, filesystem*)` pairs) written once at attach and read many times
//! at open. Here it's a process-wide singleton guarded by a lock,
//! append-only after boot: nothing in this core ever unmounts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{KernelError, Result};
use crate::io::Handle;

/// Operations a mounted filesystem exposes to the mount/open layer.
pub trait FileSystem: Send + Sync {
    fn open(&self, name: &str) -> Result<Handle>;

    fn create(&self, _name: &str) -> Result<()> {
        Err(KernelError::NotSup)
    }

    fn delete(&self, _name: &str) -> Result<()> {
        Err(KernelError::NotSup)
    }

    /// Propagates to whatever cache backs this filesystem.
    fn flush(&self) -> Result<()>;
}

pub struct MountTable {
    mounts: Mutex<HashMap<String, Arc<dyn FileSystem>>>,
}

impl MountTable {
    fn new() -> Self {
        MountTable {
            mounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn mount(&self, name: &str, fs: Arc<dyn FileSystem>) {
        self.mounts.lock().unwrap().insert(name.to_string(), fs);
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn FileSystem>> {
        self.mounts
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(KernelError::NotFound)
    }

    pub fn open(&self, mount_name: &str, file_name: &str) -> Result<Handle> {
        self.lookup(mount_name)?.open(file_name)
    }

    pub fn flush(&self, mount_name: &str) -> Result<()> {
        self.lookup(mount_name)?.flush()
    }
}

static TABLE: OnceLock<MountTable> = OnceLock::new();

/// The process-wide mount table singleton.
pub fn table() -> &'static MountTable {
    TABLE.get_or_init(MountTable::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoHandle;

    struct Stub;
    impl IoHandle for Stub {}
    struct StubFs;
    impl FileSystem for StubFs {
        fn open(&self, name: &str) -> Result<Handle> {
            if name == "present" {
                Ok(Arc::new(Stub))
            } else {
                Err(KernelError::NotFound)
            }
        }
        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unknown_mount_name_is_not_found() {
        let table = MountTable::new();
        assert_eq!(
            table.open("nothere", "x").err(),
            Some(KernelError::NotFound)
        );
    }

    #[test]
    fn mounted_filesystem_services_open() {
        let table = MountTable::new();
        table.mount("fs", Arc::new(StubFs));
        assert!(table.open("fs", "present").is_ok());
        assert_eq!(
            table.open("fs", "missing").err(),
            Some(KernelError::NotFound)
        );
    }
}
