//! The redirection table: the interrupt descriptor table loaded while a
//! guest domain runs.
//!
//! It is installed once, in four pages that every core maps at the same
//! place of its kx window:
//!
//! ```text
//!   idt_va                      256 interrupt gates
//!   idt_va + IDT_SIZE           interrupt entry code  (KX_INTR_CODE_SIZE)
//!                               guest entry code      (KX_ENTRY_CODE_SIZE)
//!   idt_va + IDT_SIZE + 2 pages global page, redirect pointer at offset 0
//! ```
use crate::{
    platform::{Pages, Platform, TrampolineImage},
    relocate, KxError, MAX_CPU,
};
use core::{
    mem::size_of,
    sync::atomic::{AtomicU64, Ordering},
};
use crossbeam_utils::CachePadded;
use kxarch::{
    x86_64::{
        interrupt::{ExceptionVector, GateDescriptor, GateType, IDT_ENTRIES},
        segmentation::Segment,
        table::DescriptorTablePointer,
        PrivilegeLevel,
    },
    PAGE_SIZE,
};

pub const IDT_SIZE: usize = IDT_ENTRIES * size_of::<GateDescriptor>();
/// Room for the interrupt entry code.
pub const KX_INTR_CODE_SIZE: usize = 2048;
/// Room for the guest entry code.
pub const KX_ENTRY_CODE_SIZE: usize = 2048;
/// Offset of the redirect pointer in the global page.
pub const KX_REDIRECT_OFFSET: usize = 0;

const TEXT_SIZE: usize = 2 * PAGE_SIZE;
const REDIRECT_PAGES: usize = IDT_SIZE / PAGE_SIZE + TEXT_SIZE / PAGE_SIZE + 1;
const INVALID_ID: u64 = u64::MAX;

const _: () = assert!(KX_INTR_CODE_SIZE + KX_ENTRY_CODE_SIZE <= TEXT_SIZE);

/// The installed redirection table.
pub struct RedirectTable {
    pages: Pages,
    native: DescriptorTablePointer,
    guest: DescriptorTablePointer,
    syscall_entry: u64,
    last_id: [CachePadded<AtomicU64>; MAX_CPU],
}

/// Link address of the entry stub of `vector`.
fn entry_stub(image: &TrampolineImage<'_>, vector: usize) -> u64 {
    let s = &image.special_stubs;
    match ExceptionVector::new(vector as u64) {
        Some(ExceptionVector::DoubleFault) => s.double_fault,
        Some(ExceptionVector::InvalidTss) => s.invalid_tss,
        Some(ExceptionVector::SegmentNotPresent) => s.segment_not_present,
        Some(ExceptionVector::StackSegmentFault) => s.stack_segment,
        Some(ExceptionVector::GeneralProtection) => s.general_protection,
        Some(ExceptionVector::PageFault) => s.page_fault,
        Some(ExceptionVector::AlignmentCheck) => s.alignment_check,
        Some(ExceptionVector::SecurityException) => s.security_exception,
        _ => image.vector_stubs[vector],
    }
}

/// Offset of the link address `addr` inside the interrupt entry code.
fn code_offset(image: &TrampolineImage<'_>, addr: u64, what: &'static str) -> Result<u64, KxError> {
    addr.checked_sub(image.intr_origin)
        .filter(|o| *o < image.intr_code.len() as u64)
        .ok_or(KxError::InvalidImage(what))
}

impl RedirectTable {
    /// Build the table from the platform's trampoline image. `redirect` is
    /// the address the no-context trap path jumps to.
    ///
    /// The kx window is left untouched until [`RedirectTable::publish`]. On
    /// failure nothing stays allocated.
    pub fn install(platform: &'static dyn Platform, redirect: u64) -> Result<Self, KxError> {
        let image = platform.image();
        if image.intr_code.len() > KX_INTR_CODE_SIZE {
            return Err(KxError::InvalidImage("interrupt entry code is too large"));
        }
        if image.entry_code.len() > KX_ENTRY_CODE_SIZE {
            return Err(KxError::InvalidImage("guest entry code is too large"));
        }

        let pages = Pages::new(platform, REDIRECT_PAGES)?;
        let idt_va = platform.idt_va();
        let code_va = idt_va + IDT_SIZE as u64;

        let native = platform.store_idt();
        if native.size as usize != IDT_SIZE - 1 {
            let size = native.size;
            log::warn!("redirect: native idt size {:#x}", size);
        }

        let base = pages.as_mut_ptr::<u8>();
        // Safety: the three regions are disjoint and owned by `pages`.
        let (idt, text, global) = unsafe {
            (
                &mut *(base as *mut [GateDescriptor; IDT_ENTRIES]),
                core::slice::from_raw_parts_mut(base.add(IDT_SIZE), TEXT_SIZE),
                core::slice::from_raw_parts_mut(base.add(IDT_SIZE + TEXT_SIZE), PAGE_SIZE),
            )
        };

        for (vector, gate) in idt.iter_mut().enumerate() {
            let offset = code_offset(
                &image,
                entry_stub(&image, vector),
                "entry stub outside of the interrupt entry code",
            )?;
            let dpl = match ExceptionVector::new(vector as u64) {
                Some(ExceptionVector::Breakpoint | ExceptionVector::Overflow) => {
                    PrivilegeLevel::Ring3
                }
                _ => PrivilegeLevel::Ring0,
            };
            *gate = GateDescriptor::new(
                code_va + offset,
                Segment::KernelCode.into_selector(),
                GateType::Interrupt,
                dpl,
                0,
            );
        }

        relocate::materialize(
            image.intr_code,
            image.intr_origin,
            image.relocations,
            &mut text[..KX_INTR_CODE_SIZE],
        )?;
        text[KX_INTR_CODE_SIZE..KX_INTR_CODE_SIZE + image.entry_code.len()]
            .copy_from_slice(image.entry_code);

        global[KX_REDIRECT_OFFSET..KX_REDIRECT_OFFSET + 8].copy_from_slice(&redirect.to_le_bytes());

        let syscall_entry = code_va
            + code_offset(
                &image,
                image.syscall_entry,
                "syscall entry outside of the interrupt entry code",
            )?;

        let guest = DescriptorTablePointer::new(idt_va, native.size);
        log::info!(
            "redirect: built for {:#x}, native {:?}, syscall entry {:#x}",
            idt_va,
            native,
            syscall_entry
        );
        Ok(Self {
            pages,
            native,
            guest,
            syscall_entry,
            last_id: core::array::from_fn(|_| CachePadded::new(AtomicU64::new(INVALID_ID))),
        })
    }

    /// Back the kx window of every core with this table.
    ///
    /// # Safety
    /// The table must outlive every guest domain entered afterwards, and no
    /// other table may be published.
    pub unsafe fn publish(&self, platform: &dyn Platform) {
        platform.set_kx_global_info(
            self.pages.pa(0),
            self.pages.pa(IDT_SIZE / PAGE_SIZE),
            self.pages.pa(IDT_SIZE / PAGE_SIZE + 1),
            self.pages.pa(REDIRECT_PAGES - 1),
        );
        let idt_va = self.guest.address;
        log::info!("redirect: installed at {:#x}", idt_va);
    }

    /// Native and guest descriptors.
    #[inline]
    pub fn descriptors(&self) -> (DescriptorTablePointer, DescriptorTablePointer) {
        (self.native, self.guest)
    }

    /// Payload `syscall` target inside the kx window.
    #[inline]
    pub fn syscall_entry(&self) -> u64 {
        self.syscall_entry
    }

    #[inline]
    pub fn gate(&self, vector: u8) -> GateDescriptor {
        unsafe { (*self.pages.as_mut_ptr::<[GateDescriptor; IDT_ENTRIES]>())[vector as usize] }
    }

    /// Installed code, as laid out in the kx window.
    pub fn text(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(self.pages.as_mut_ptr::<u8>().add(IDT_SIZE), TEXT_SIZE)
        }
    }

    /// The value the trampolines find at [`KX_REDIRECT_OFFSET`].
    pub fn redirect_pointer(&self) -> u64 {
        let mut b = [0; 8];
        unsafe {
            let global = self.pages.as_mut_ptr::<u8>().add(IDT_SIZE + TEXT_SIZE);
            core::ptr::copy_nonoverlapping(global.add(KX_REDIRECT_OFFSET), b.as_mut_ptr(), 8);
        }
        u64::from_le_bytes(b)
    }

    /// Record the last vector taken on `cpu`.
    pub fn set_last_id(&self, cpu: usize, id: u64) -> Result<(), KxError> {
        self.last_id
            .get(cpu)
            .ok_or(KxError::CpuOutOfRange(cpu))?
            .store(id, Ordering::Relaxed);
        Ok(())
    }

    /// Last vector taken on `cpu`, if any.
    pub fn last_id(&self, cpu: usize) -> Option<u64> {
        self.last_id
            .get(cpu)
            .map(|id| id.load(Ordering::Relaxed))
            .filter(|id| *id != INVALID_ID)
    }
}

impl Drop for RedirectTable {
    fn drop(&mut self) {
        log::info!("redirect: teardown");
    }
}
