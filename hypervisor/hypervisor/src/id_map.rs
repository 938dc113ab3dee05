//! Temporary identity mappings used while the MMU of EL2 is switched on or off
//!
//! Two regions have to be reachable at their physical address during such a switch: the trampoline code and the
//! stack of the switching core.
//! An identity mapping may already exist at one of those addresses.
//! It is then left as it is and neither checked for sufficient access rights nor restored afterwards; releasing
//! such a slot reports [`IdMapRelease::PreexistingNotRestored`].

use crate::errors::Error;
use allocators::PageAllocator;
use arm::mem::{is_page_aligned, Coherency, PAddr, PagingStructures, Stage1Flags, PAGESIZE};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IdMapSlot {
    /// The `.trampoline` section
    Trampoline = 0,
    /// The stack page of the switching core
    Stack = 1,
}

impl IdMapSlot {
    pub const ALL: [IdMapSlot; 2] = [IdMapSlot::Trampoline, IdMapSlot::Stack];
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IdMapEntry {
    pub address: PAddr,
    /// Stage-1 attributes the mapping is created with
    pub flags: u64,
    /// Whether a mapping already existed at `address` when the slot was committed
    pub conflict: bool,
}

/// What [`IdMaps::release()`] did
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IdMapRelease {
    Removed,
    /// The slot hit an existing mapping which was left in place
    PreexistingNotRestored,
}

/// The identity map table of one core
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct IdMaps {
    entries: [Option<IdMapEntry>; 2],
}

impl IdMaps {
    pub const fn new() -> Self {
        Self {
            entries: [None, None],
        }
    }

    pub fn entry(&self, slot: IdMapSlot) -> Option<&IdMapEntry> {
        self.entries[slot as usize].as_ref()
    }

    /// Prepare `slot` for identity mapping the `size` bytes at `address`.
    ///
    /// The region has to start at a page boundary and fit into that single page.
    pub fn register(&mut self, slot: IdMapSlot, address: PAddr, size: u64) -> Result<(), Error> {
        if !is_page_aligned(address) || size == 0 || size > PAGESIZE as u64 {
            log::error!("unable to identity map more than one page at a time ({size:#x} bytes at {address:#x})");
            return Err(Error::RegionTooLarge {
                addr: address,
                size,
            });
        }

        self.entries[slot as usize] = Some(IdMapEntry {
            address,
            flags: Stage1Flags::DEFAULT.bits(),
            conflict: false,
        });
        Ok(())
    }

    /// Whether something is already mapped at the address of `slot`
    pub fn probe_conflict(&self, slot: IdMapSlot, paging: &PagingStructures) -> bool {
        paging.lookup(self.registered(slot).address).is_some()
    }

    /// Create the identity mapping of `slot` unless something is mapped there already
    pub fn commit(
        &mut self,
        slot: IdMapSlot,
        paging: &mut PagingStructures,
        pool: &impl PageAllocator,
    ) -> Result<(), Error> {
        let conflict = self.probe_conflict(slot, paging);
        let entry = self.registered_mut(slot);
        entry.conflict = conflict;

        if conflict {
            log::debug!(
                "{:#x} is already mapped, not creating an identity mapping for {slot:?}",
                entry.address
            );
            return Ok(());
        }
        paging.create(
            pool,
            entry.address,
            PAGESIZE as u64,
            entry.address,
            entry.flags,
            Coherency::NonCoherent,
        )?;
        Ok(())
    }

    /// Remove the identity mapping created by [`commit()`](IdMaps::commit)
    pub fn release(
        &mut self,
        slot: IdMapSlot,
        paging: &mut PagingStructures,
        pool: &impl PageAllocator,
    ) -> Result<IdMapRelease, Error> {
        let entry = *self.registered(slot);
        if entry.conflict {
            // TODO: restore the original attributes once the paging primitive can report and rewrite them
            return Ok(IdMapRelease::PreexistingNotRestored);
        }
        paging.destroy(pool, entry.address, PAGESIZE as u64, Coherency::NonCoherent)?;
        Ok(IdMapRelease::Removed)
    }

    fn registered(&self, slot: IdMapSlot) -> &IdMapEntry {
        self.entries[slot as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("identity map slot {slot:?} is not registered"))
    }

    fn registered_mut(&mut self, slot: IdMapSlot) -> &mut IdMapEntry {
        self.entries[slot as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("identity map slot {slot:?} is not registered"))
    }
}
