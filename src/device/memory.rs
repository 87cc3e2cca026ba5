//! RAM/ROM byte storage device.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;

use crate::cpu::{FaultKind, MemAccess, MemResponse};
use crate::device::{Device, DeviceKind, SyncState};

/// Fixed-size byte storage, zero-initialized. ROM variants reject writes.
///
/// Accesses are little-endian and 1/2/4/8 bytes wide; anything outside the
/// storage range, or a partial overlap with its end, is an access fault.
pub struct MemoryDevice {
    storage: Mutex<Vec<u8>>,
    read_only: bool,
    sync: SyncState,
}

fn access_valid(storage_len: usize, access: &MemAccess) -> bool {
    if !matches!(access.size, 1 | 2 | 4 | 8) {
        return false;
    }
    let len = storage_len as u64;
    if access.address >= len {
        return false;
    }
    u64::from(access.size) <= len - access.address
}

impl MemoryDevice {
    pub fn new(size: u64, read_only: bool) -> Self {
        Self {
            storage: Mutex::new(vec![0u8; size as usize]),
            read_only,
            sync: SyncState::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.storage.lock().unwrap().len() as u64
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Fill storage from a raw binary image starting at `offset`, truncating
    /// at the storage boundary. Returns the number of bytes copied.
    pub fn load_image(&self, path: impl AsRef<Path>, offset: u64) -> Result<usize> {
        let path = path.as_ref();
        let mut storage = self.storage.lock().unwrap();
        let offset = offset as usize;
        if offset >= storage.len() {
            anyhow::bail!("image offset 0x{:x} is outside storage", offset);
        }
        let file = File::open(path).with_context(|| format!("open image {}", path.display()))?;
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("map image {}", path.display()))?;
        let count = map.len().min(storage.len() - offset);
        storage[offset..offset + count].copy_from_slice(&map[..count]);
        log::info!("loaded {} bytes from {} at offset 0x{:x}", count, path.display(), offset);
        Ok(count)
    }
}

impl Device for MemoryDevice {
    fn kind(&self) -> DeviceKind {
        if self.read_only {
            DeviceKind::Rom
        } else {
            DeviceKind::Ram
        }
    }

    fn read(&self, access: &MemAccess) -> MemResponse {
        let storage = self.storage.lock().unwrap();
        if !access_valid(storage.len(), access) {
            return MemResponse::fault(FaultKind::AccessFault, access);
        }
        let start = access.address as usize;
        let value = LittleEndian::read_uint(&storage[start..], access.size as usize);
        MemResponse::success(value)
    }

    fn write(&self, access: &MemAccess) -> MemResponse {
        let mut storage = self.storage.lock().unwrap();
        if !access_valid(storage.len(), access) || self.read_only {
            return MemResponse::fault(FaultKind::AccessFault, access);
        }
        let start = access.address as usize;
        LittleEndian::write_uint(&mut storage[start..], access.data, access.size as usize);
        MemResponse::success(0)
    }

    fn sync_state(&self) -> &SyncState {
        &self.sync
    }
}
