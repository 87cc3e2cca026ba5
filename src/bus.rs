//! Address-routed memory bus.
//!
//! The bus owns an ordered list of device mappings, routes reads and writes
//! by address with base-relative translation, and dispatches periodic device
//! synchronization. Mappings are immutable once the host finishes wiring, so
//! routing itself needs no lock; only the one-slot last-hit cache is shared
//! mutable state.
//!
//! Overlap checking is deliberately not done at registration time: the host
//! validates its address plan with [`validate_regions`] before the bus starts
//! serving, and a bus handed overlapping mappings shadows by registration
//! order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::cpu::{FaultKind, MemAccess, MemResponse};
use crate::device::Device;

/// A named address range in the host's address plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub name: String,
    pub base: u64,
    pub size: u64,
}

impl MemoryRegion {
    pub fn new(name: impl Into<String>, base: u64, size: u64) -> Self {
        Self { name: name.into(), base, size }
    }
}

/// Address-plan validation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressPlanError {
    /// Zero-sized region or `base + size` overflow.
    #[error("invalid region '{0}': zero size or address overflow")]
    InvalidRegion(String),
    /// Two regions share at least one address.
    #[error("overlapping regions '{0}' and '{1}'")]
    Overlap(String, String),
}

/// Exclusive end of a region, or `None` on zero size / overflow.
pub fn region_end(base: u64, size: u64) -> Option<u64> {
    if size == 0 {
        return None;
    }
    base.checked_add(size)
}

/// True when the two regions share at least one address. Malformed regions
/// count as overlapping so validation rejects them.
pub fn regions_overlap(a: &MemoryRegion, b: &MemoryRegion) -> bool {
    match (region_end(a.base, a.size), region_end(b.base, b.size)) {
        (Some(end_a), Some(end_b)) => a.base < end_b && b.base < end_a,
        _ => true,
    }
}

/// Host-level precondition check: every region well-formed, no two overlap.
pub fn validate_regions(regions: &[MemoryRegion]) -> Result<(), AddressPlanError> {
    for region in regions {
        if region_end(region.base, region.size).is_none() {
            return Err(AddressPlanError::InvalidRegion(region.name.clone()));
        }
    }
    for (i, a) in regions.iter().enumerate() {
        for b in &regions[i + 1..] {
            if regions_overlap(a, b) {
                return Err(AddressPlanError::Overlap(a.name.clone(), b.name.clone()));
            }
        }
    }
    Ok(())
}

/// One device bound to an address range.
pub struct DeviceMapping {
    pub name: String,
    pub device: Arc<dyn Device>,
    pub base: u64,
    pub size: u64,
    pub end: u64,
}

const NO_HIT: usize = usize::MAX;

/// The address router.
pub struct MemoryBus {
    mappings: Vec<DeviceMapping>,
    /// Each distinct device once, in first-registration order; drives sync.
    devices: Vec<Arc<dyn Device>>,
    /// Index of the mapping that served the last lookup. Monotonic fetch
    /// streams hit this slot and skip the scan.
    last_hit: AtomicUsize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self { mappings: Vec::new(), devices: Vec::new(), last_hit: AtomicUsize::new(NO_HIT) }
    }

    /// Appends a mapping. Re-registering the same (device, base, size)
    /// triple is idempotent. The first registration of a device adds it to
    /// the unique-devices list used by [`MemoryBus::sync_all`].
    pub fn register(&mut self, device: Arc<dyn Device>, base: u64, size: u64, name: impl Into<String>) {
        let name = name.into();
        let duplicate = self.mappings.iter().any(|m| {
            Arc::ptr_eq(&m.device, &device) && m.base == base && m.size == size
        });
        if duplicate {
            return;
        }
        if !self.devices.iter().any(|d| Arc::ptr_eq(d, &device)) {
            self.devices.push(Arc::clone(&device));
        }
        let end = base.wrapping_add(size);
        log::debug!("bus: map '{}' at 0x{:x}..0x{:x}", name, base, end);
        self.mappings.push(DeviceMapping { name, device, base, size, end });
        self.last_hit.store(NO_HIT, Ordering::Relaxed);
    }

    /// Mapping whose `[base, end)` range contains `addr`, if any.
    pub fn find_by_address(&self, addr: u64) -> Option<&DeviceMapping> {
        let cached = self.last_hit.load(Ordering::Relaxed);
        if let Some(mapping) = self.mappings.get(cached) {
            if addr >= mapping.base && addr < mapping.end {
                return Some(mapping);
            }
        }
        for (index, mapping) in self.mappings.iter().enumerate() {
            if addr >= mapping.base && addr < mapping.end {
                self.last_hit.store(index, Ordering::Relaxed);
                return Some(mapping);
            }
        }
        None
    }

    /// Linear scan by mapping name.
    pub fn find_by_name(&self, name: &str) -> Option<&DeviceMapping> {
        self.mappings.iter().find(|m| m.name == name)
    }

    pub fn read(&self, access: &MemAccess) -> MemResponse {
        match self.find_by_address(access.address) {
            Some(mapping) => {
                let mut relative = *access;
                relative.address = access.address - mapping.base;
                mapping.device.read(&relative)
            }
            None => MemResponse::fault(FaultKind::AccessFault, access),
        }
    }

    pub fn write(&self, access: &MemAccess) -> MemResponse {
        match self.find_by_address(access.address) {
            Some(mapping) => {
                let mut relative = *access;
                relative.address = access.address - mapping.base;
                mapping.device.write(&relative)
            }
            None => MemResponse::fault(FaultKind::AccessFault, access),
        }
    }

    /// Offer a sync opportunity to every unique device.
    pub fn sync_all(&self, current_cycle: u64) {
        for device in &self.devices {
            device.sync(current_cycle);
        }
    }

    /// Unique registered devices in first-registration order.
    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn mappings(&self) -> &[DeviceMapping] {
        &self.mappings
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn bus_with_two_rams() -> (MemoryBus, Arc<MemoryDevice>, Arc<MemoryDevice>) {
        let low = Arc::new(MemoryDevice::new(0x100, false));
        let high = Arc::new(MemoryDevice::new(0x100, false));
        let mut bus = MemoryBus::new();
        bus.register(Arc::clone(&low) as Arc<dyn Device>, 0x0, 0x100, "low");
        bus.register(Arc::clone(&high) as Arc<dyn Device>, 0x1000, 0x100, "high");
        (bus, low, high)
    }

    #[test]
    fn routes_by_address_with_translation() {
        let (bus, _, _) = bus_with_two_rams();
        let resp = bus.write(&MemAccess::write(0x1004, 4, 0xcafe_f00d));
        assert!(resp.ok);
        let resp = bus.read(&MemAccess::read(0x1004, 4));
        assert!(resp.ok);
        assert_eq!(resp.data, 0xcafe_f00d);
        // The low device at the same relative offset is untouched.
        let resp = bus.read(&MemAccess::read(0x4, 4));
        assert_eq!(resp.data, 0);
    }

    #[test]
    fn unmapped_access_faults_with_original_address() {
        let (bus, _, _) = bus_with_two_rams();
        let resp = bus.read(&MemAccess::read(0x2000, 4));
        assert!(!resp.ok);
        assert_eq!(resp.error.kind, FaultKind::AccessFault);
        assert_eq!(resp.error.address, 0x2000);
        let resp = bus.write(&MemAccess::write(0x500, 1, 0));
        assert_eq!(resp.error.kind, FaultKind::AccessFault);
        assert_eq!(resp.error.address, 0x500);
    }

    #[test]
    fn registration_is_idempotent_per_triple() {
        let ram = Arc::new(MemoryDevice::new(0x100, false));
        let mut bus = MemoryBus::new();
        bus.register(Arc::clone(&ram) as Arc<dyn Device>, 0, 0x100, "ram");
        bus.register(Arc::clone(&ram) as Arc<dyn Device>, 0, 0x100, "ram-again");
        assert_eq!(bus.mappings().len(), 1);
        assert_eq!(bus.devices().len(), 1);

        // Same device at a second window is a new mapping, not a new device.
        bus.register(Arc::clone(&ram) as Arc<dyn Device>, 0x1000, 0x100, "alias");
        assert_eq!(bus.mappings().len(), 2);
        assert_eq!(bus.devices().len(), 1);
    }

    #[test]
    fn find_by_name_scans_mappings() {
        let (bus, _, _) = bus_with_two_rams();
        assert_eq!(bus.find_by_name("high").map(|m| m.base), Some(0x1000));
        assert!(bus.find_by_name("uart").is_none());
    }

    #[test]
    fn last_hit_cache_matches_cacheless_routing() {
        let (bus, _, _) = bus_with_two_rams();
        for offset in (0..0x100u64).step_by(4) {
            bus.write(&MemAccess::write(offset, 4, offset));
            bus.write(&MemAccess::write(0x1000 + offset, 4, !offset));
        }
        // Alternate between the regions so the cache misses half the time.
        for offset in (0..0x100u64).step_by(4) {
            assert_eq!(bus.read(&MemAccess::read(offset, 4)).data, offset & 0xffff_ffff);
            assert_eq!(bus.read(&MemAccess::read(0x1000 + offset, 4)).data, (!offset) & 0xffff_ffff);
            assert!(!bus.read(&MemAccess::read(0x8000 + offset, 4)).ok);
        }
    }

    #[test]
    fn region_end_rejects_overflow_and_zero() {
        assert_eq!(region_end(0, 0x100), Some(0x100));
        assert_eq!(region_end(0, 0), None);
        assert_eq!(region_end(u64::MAX, 2), None);
        assert_eq!(region_end(u64::MAX - 1, 1), Some(u64::MAX));
    }

    #[test]
    fn validate_regions_flags_overlap() {
        let plan = vec![
            MemoryRegion::new("rom", 0, 0x1000),
            MemoryRegion::new("ram", 0x8000, 0x1000),
        ];
        assert_eq!(validate_regions(&plan), Ok(()));

        let plan = vec![
            MemoryRegion::new("rom", 0, 0x1000),
            MemoryRegion::new("ram", 0xfff, 0x1000),
        ];
        assert_eq!(
            validate_regions(&plan),
            Err(AddressPlanError::Overlap("rom".into(), "ram".into()))
        );

        let plan = vec![MemoryRegion::new("bad", u64::MAX, 2)];
        assert_eq!(
            validate_regions(&plan),
            Err(AddressPlanError::InvalidRegion("bad".into()))
        );
    }
}
