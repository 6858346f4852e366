//! Guest virtual to host-visible address translation.
//!
//! The guest's physical memory is one contiguous window of the monitor
//! process starting at [`KM_USER_MEM_BASE`]. The guest sees it twice: once
//! at its physical addresses and once mirrored below the top of the 47-bit
//! address space. A third, optional range backs the vdso/vvar pages with a
//! slot of its own.
//!
//! ```text
//!   guest va                                     host va
//!   [GUEST_MEM_START_VA, GUEST_MAX_PHYS_MEM) -> KM_USER_MEM_BASE + va
//!   [GUEST_VA_OFFSET, GUEST_MEM_TOP_VA)      -> KM_USER_MEM_BASE + (va - GUEST_VA_OFFSET)
//!   [VVAR_VDSO_BASE_VA, + slot size)         -> slot base + (va - VVAR_VDSO_BASE_VA)
//! ```
use crate::{
    addressing::{Gva, Hva},
    KxError,
};

pub const MIB: u64 = 0x10_0000;
pub const GIB: u64 = 0x4000_0000;
pub const TIB: u64 = 0x100_0000_0000;

/// Lowest guest physical address backed by memory.
pub const GUEST_MEM_START_VA: u64 = 2 * MIB;
/// Largest guest physical memory.
pub const GUEST_MAX_PHYS_MEM: u64 = 512 * GIB;
/// Top of the mirrored high window.
pub const GUEST_MEM_TOP_VA: u64 = 128 * TIB - 2 * MIB;
/// Distance between the high window and guest physical addresses.
pub const GUEST_VA_OFFSET: u64 = GUEST_MEM_TOP_VA - (GUEST_MAX_PHYS_MEM - 2 * MIB);
/// Host-visible base of guest physical memory in the monitor.
pub const KM_USER_MEM_BASE: u64 = 0x1000_0000_0000;
/// Slot reserved for the vdso/vvar pages.
pub const RSRV_VDSO_SLOT: usize = 41;
/// Guest address of the vdso/vvar pages.
pub const VVAR_VDSO_BASE_VA: u64 = GUEST_MEM_TOP_VA + MIB;
/// Number of memory slots of a kontainer.
pub const MAX_MEM_SLOTS: usize = 64;

/// A region of guest memory backed by monitor memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemSlot {
    pub used: bool,
    /// Host-visible base.
    pub userspace_addr: u64,
    pub memory_size: u64,
}

/// Memory slots of a guest.
#[derive(Clone, Debug)]
pub struct MemSlots {
    slots: [MemSlot; MAX_MEM_SLOTS],
}

impl Default for MemSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl MemSlots {
    pub const fn new() -> Self {
        Self {
            slots: [MemSlot {
                used: false,
                userspace_addr: 0,
                memory_size: 0,
            }; MAX_MEM_SLOTS],
        }
    }

    pub fn get(&self, slot: usize) -> Option<&MemSlot> {
        self.slots.get(slot)
    }

    /// Mark `slot` as backed by `size` bytes at `userspace_addr`.
    pub fn set(&mut self, slot: usize, userspace_addr: u64, size: u64) -> Result<(), KxError> {
        let s = self.slots.get_mut(slot).ok_or(KxError::InvalidSlot(slot))?;
        *s = MemSlot {
            used: true,
            userspace_addr,
            memory_size: size,
        };
        Ok(())
    }

    pub fn clear(&mut self, slot: usize) -> Result<(), KxError> {
        let s = self.slots.get_mut(slot).ok_or(KxError::InvalidSlot(slot))?;
        *s = MemSlot::default();
        Ok(())
    }

    /// Translate a guest virtual address into the monitor's address space.
    ///
    /// Ranges are checked in order: guest physical window, high mirror, vdso
    /// slot. Anything else has no backing and fails with
    /// [`KxError::BadAddress`].
    pub fn translate(&self, gva: Gva) -> Result<Hva, KxError> {
        let va = gva.as_u64();
        if (GUEST_MEM_START_VA..GUEST_MAX_PHYS_MEM).contains(&va) {
            return Ok(Hva::new(KM_USER_MEM_BASE + va));
        }
        if (GUEST_VA_OFFSET..GUEST_MEM_TOP_VA).contains(&va) {
            return Ok(Hva::new(KM_USER_MEM_BASE + (va - GUEST_VA_OFFSET)));
        }
        let vdso = &self.slots[RSRV_VDSO_SLOT];
        if vdso.used && va >= VVAR_VDSO_BASE_VA && va - VVAR_VDSO_BASE_VA < vdso.memory_size {
            return Ok(Hva::new(va - VVAR_VDSO_BASE_VA + vdso.userspace_addr));
        }
        log::warn!("translate: no host backing for {}", gva);
        Err(KxError::BadAddress(gva))
    }
}
