//! Conversion between hypervisor virtual and physical addresses

use crate::mem::{PAddr, VAddr};

/// Description of an area of hypervisor memory that is linearly mapped.
///
/// The hypervisor image and its page pool are reachable at `virt_start` while the hardware (e.g. a translation table
/// walker) knows them under `phys_start`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PhysMapping {
    pub virt_start: VAddr,
    pub phys_start: PAddr,
    pub size: u64,
}

impl PhysMapping {
    /// Return the mapping which describes addresses being identity-mapped.
    /// That is, physical addresses can be loaded from their value directly and do not need to be mapped.
    pub const fn identity() -> Self {
        Self {
            virt_start: 0,
            phys_start: 0,
            size: u64::MAX,
        }
    }

    /// Create a new instance describing the `size` bytes of physical memory at `phys_start` being accessible at
    /// `virt_start`.
    pub const fn new(virt_start: VAddr, phys_start: PAddr, size: u64) -> Self {
        Self {
            virt_start,
            phys_start,
            size,
        }
    }

    pub fn contains_virt(&self, addr: VAddr) -> bool {
        addr.wrapping_sub(self.virt_start) < self.size
    }

    pub fn contains_phys(&self, addr: PAddr) -> bool {
        addr.wrapping_sub(self.phys_start) < self.size
    }

    /// Resolve the given physical address into its loadable mapped variant.
    ///
    /// This method is intended to be used when the input is an address that is understood by the memory management
    /// unit while the output is an address that is loadable by the CPU right now.
    pub fn phys_to_virt(&self, addr: PAddr) -> VAddr {
        assert!(
            self.contains_phys(addr),
            "{addr:#x} is not part of the mapped physical memory"
        );
        addr - self.phys_start + self.virt_start
    }

    /// Reverse-resolve the given mapped address to its actual hardware address.
    ///
    /// This method is intended to be used when the input is an address that is loadable by the CPU right now while
    /// the output is one that is understood by the memory management unit.
    pub fn virt_to_phys(&self, addr: VAddr) -> PAddr {
        assert!(
            self.contains_virt(addr),
            "{addr:#x} is not part of the mapped hypervisor memory"
        );
        addr - self.virt_start + self.phys_start
    }

    /// The value that has to be added to a physical address to get its virtual alias
    pub fn phys2virt_offset(&self) -> u64 {
        self.virt_start.wrapping_sub(self.phys_start)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_conversion_is_symmetric() {
        let map = PhysMapping::new(0xffff_c000_0000, 0x7c00_0000, 0x400_0000);
        assert_eq!(map.virt_to_phys(0xffff_c000_1234), 0x7c00_1234);
        assert_eq!(map.phys_to_virt(0x7c00_1234), 0xffff_c000_1234);
        assert_eq!(
            0x7c00_1234u64.wrapping_add(map.phys2virt_offset()),
            0xffff_c000_1234
        );
    }

    #[test]
    fn test_range_checks() {
        let map = PhysMapping::new(0x1000_0000, 0x7c00_0000, 0x1000);
        assert!(map.contains_phys(0x7c00_0fff));
        assert!(!map.contains_phys(0x7c00_1000));
        assert!(!map.contains_virt(0x0fff_ffff));
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_translation_panics() {
        PhysMapping::new(0x1000_0000, 0x7c00_0000, 0x1000).virt_to_phys(0x2000_0000);
    }
}
