//! The guest area: per-kontext state block shared with the trampolines.
//!
//! ```text
//!  +---------------------+  base
//!  | GuestState          |  registers, saved host pointers, back-pointers
//!  +---------------------+
//!  | redzone_top         |
//!  +---------------------+
//!  | stack               |  guest-kernel stack, then trap entry stack
//!  |         ...         |
//!  | trap_info           |  frame pushed by the CPU on a trap
//!  +---------------------+  <- sp0 while the payload runs
//!  | redzone_bottom      |
//!  +---------------------+  base + GUEST_AREA_SIZE
//! ```
//!
//! The area is mapped twice: at its kernel address, and through the per-core
//! kx window at a fixed address shared by every kontext. The trampolines only
//! know the latter, so the area records its owner and its kernel address
//! inside itself.
use crate::{kontext::Kontext, KxError};
use core::mem::size_of;
use kxarch::{x86_64::table::DescriptorTablePointer, PAGE_SIZE};

pub const GUEST_AREA_PAGES: usize = 2;
pub const GUEST_AREA_SIZE: usize = GUEST_AREA_PAGES * PAGE_SIZE;

const REDZONE_WORDS: usize = 8;
const REDZONE_MAGIC: u64 = 0x6b78_7265_647a_6f6e;

/// General purpose registers, instruction pointer and flags of the guest.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentState {
    pub base: u64,
    pub selector: u16,
    _pad: [u16; 3],
}

/// Segment and control registers of the guest.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentRegisters {
    pub cs: SegmentState,
    pub ds: SegmentState,
    pub es: SegmentState,
    pub fs: SegmentState,
    pub gs: SegmentState,
    pub ss: SegmentState,
    pub cr0: u64,
    /// Faulting address of the last page fault.
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

/// Frame pushed by the CPU on a trap, with the error code (or a zero pushed
/// by the entry stub) at the lowest address.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapInfo {
    pub error: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Architectural state of a kontext.
#[repr(C)]
pub struct GuestState {
    /// Owning kontext.
    kontext: *const Kontext,
    /// Kernel address of this area.
    base: u64,
    pub regs: GuestRegisters,
    pub sregs: SegmentRegisters,
    pub debug: [u64; 8],
    pub native_idt_desc: DescriptorTablePointer,
    pub guest_idt_desc: DescriptorTablePointer,
    _idt_pad: [u8; 4],
    /// Host sp0, sp1 and sp2 while a guest domain runs.
    pub native_tss_stacks: [u64; 3],
    /// Host stack pointer at the switch to the guest kernel.
    pub native_kernel_stack: u64,
    pub guest_kernel_cr3: u64,
    pub guest_kernel_cr4: u64,
    pub guest_payload_cr3: u64,
    pub guest_payload_cs: u64,
    pub guest_payload_ss: u64,
    /// Vector of the last trap. `u64::MAX` until a trap fires.
    pub intr_no: u64,
    /// Scratch buffer for single byte probes of guest memory.
    pub instruction_decode: [u8; 16],
}

const REDZONE_BYTES: usize = REDZONE_WORDS * size_of::<u64>();
const STACK_SIZE: usize =
    GUEST_AREA_SIZE - size_of::<GuestState>() - 2 * REDZONE_BYTES - size_of::<TrapInfo>();

#[repr(C, align(4096))]
pub struct GuestArea {
    pub state: GuestState,
    redzone_top: [u64; REDZONE_WORDS],
    _stack: [u8; STACK_SIZE],
    pub trap_info: TrapInfo,
    redzone_bottom: [u64; REDZONE_WORDS],
}

const _: () = assert!(size_of::<GuestArea>() == GUEST_AREA_SIZE);

impl GuestArea {
    /// Initialize the area at `ga` for `kontext`.
    ///
    /// # Safety
    /// `ga` must point to [`GUEST_AREA_SIZE`] writable bytes aligned to a page.
    pub unsafe fn init(ga: *mut GuestArea, kontext: *const Kontext) {
        core::ptr::write_bytes(ga, 0, 1);
        let area = &mut *ga;
        area.redzone_top = [REDZONE_MAGIC; REDZONE_WORDS];
        area.redzone_bottom = [REDZONE_MAGIC; REDZONE_WORDS];
        area.state.kontext = kontext;
        area.state.base = ga as u64;
        area.state.intr_no = u64::MAX;
    }

    /// Check both redzones.
    pub fn verify_redzone(&self) -> Result<(), KxError> {
        let intact = |z: &[u64; REDZONE_WORDS]| z.iter().all(|w| *w == REDZONE_MAGIC);
        if intact(&self.redzone_top) && intact(&self.redzone_bottom) {
            Ok(())
        } else {
            Err(KxError::RedzoneCorrupted)
        }
    }

    /// Top of the in-area stack, as addressed through the current mapping.
    #[inline]
    pub fn stack_top(&self) -> u64 {
        core::ptr::addr_of!(self.redzone_bottom) as u64
    }

    /// Kontext owning this area.
    #[inline]
    pub fn owner(&self) -> *const Kontext {
        self.state.kontext
    }

    /// The kernel mapping of this area, whichever mapping `self` came from.
    #[inline]
    pub fn self_locate(&self) -> *mut GuestArea {
        self.state.base as *mut GuestArea
    }

    /// Record the host stack pointer to return to.
    #[inline]
    pub fn set_native_kernel_stack(&mut self, sp: u64) {
        self.state.native_kernel_stack = sp;
    }

    #[cfg(test)]
    pub(crate) fn rebase(&mut self, base: u64) {
        self.state.base = base;
    }

    #[cfg(test)]
    pub(crate) fn redzones_mut(
        &mut self,
    ) -> (&mut [u64; REDZONE_WORDS], &mut [u64; REDZONE_WORDS]) {
        (&mut self.redzone_top, &mut self.redzone_bottom)
    }
}
