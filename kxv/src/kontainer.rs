//! Resources shared by every kontext of a guest.
use crate::{
    addressing::{Gva, Hva, Pa},
    platform::{Pages, Platform},
    translate::MemSlots,
    KxError,
};
use spin::RwLock;

/// A guest instance: the two address space roots and the guest memory map.
///
/// The roots are fixed for the lifetime of the kontainer. The page tables
/// below them are managed by the platform.
pub struct Kontainer {
    guest_kernel: Pages,
    guest_payload: Pages,
    guest_kernel_root: Pa,
    guest_payload_root: Pa,
    mem_slots: RwLock<MemSlots>,
}

impl Kontainer {
    pub fn new(platform: &'static dyn Platform) -> Result<Self, KxError> {
        let guest_kernel = Pages::new(platform, 1).map_err(|e| {
            log::warn!("kontainer: no memory for the guest kernel page table");
            e
        })?;
        let guest_payload = Pages::new(platform, 1).map_err(|e| {
            log::warn!("kontainer: no memory for the guest payload page table");
            e
        })?;
        let guest_kernel_root = guest_kernel.pa(0);
        let guest_payload_root = guest_payload.pa(0);
        log::info!(
            "kontainer: guest kernel root {} guest payload root {}",
            guest_kernel_root,
            guest_payload_root
        );
        Ok(Self {
            guest_kernel,
            guest_payload,
            guest_kernel_root,
            guest_payload_root,
            mem_slots: RwLock::new(MemSlots::new()),
        })
    }

    /// Address space root of the guest kernel domain.
    #[inline]
    pub fn guest_kernel_root(&self) -> Pa {
        self.guest_kernel_root
    }

    /// Address space root of the guest payload domain.
    #[inline]
    pub fn guest_payload_root(&self) -> Pa {
        self.guest_payload_root
    }

    /// Top level page table of the guest kernel domain.
    pub fn guest_kernel_table(&self) -> &Pages {
        &self.guest_kernel
    }

    /// Top level page table of the guest payload domain.
    pub fn guest_payload_table(&self) -> &Pages {
        &self.guest_payload
    }

    /// Back `slot` with `size` bytes of monitor memory at `userspace_addr`.
    pub fn set_memory_region(
        &self,
        slot: usize,
        userspace_addr: u64,
        size: u64,
    ) -> Result<(), KxError> {
        self.mem_slots.write().set(slot, userspace_addr, size)?;
        log::debug!(
            "kontainer: slot {} -> {:#x}+{:#x}",
            slot,
            userspace_addr,
            size
        );
        Ok(())
    }

    pub fn clear_memory_region(&self, slot: usize) -> Result<(), KxError> {
        self.mem_slots.write().clear(slot)
    }

    /// See [`MemSlots::translate`].
    pub fn translate(&self, gva: Gva) -> Result<Hva, KxError> {
        self.mem_slots.read().translate(gva)
    }
}
