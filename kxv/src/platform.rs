//! Seams to the embedding kernel.
//!
//! The engine never allocates memory, maps pages, touches user memory or runs
//! the domain-entry assembly by itself. These are provided by the kernel that
//! embeds it through the traits below; [`Platform`] bundles them.
use crate::{
    addressing::{Hva, Pa},
    engine::Kx,
    guest_area::GuestArea,
    relocate::Relocation,
    KxError,
};
use kxarch::{
    x86_64::{
        interrupt::IDT_ENTRIES,
        msr,
        segmentation::{SegmentRegister, SegmentSelector},
        table::DescriptorTablePointer,
    },
    PAGE_SIZE,
};

/// Privileged operations on the executing core.
pub trait Cpu {
    /// Logical index of the executing core.
    ///
    /// Indexes the per-core tables of the engine and must be below
    /// [`crate::MAX_CPU`]. Kernels hand out their own dense cpu numbers here,
    /// not APIC ids.
    fn id(&self) -> usize;
    fn read_cr3(&self) -> u64;
    /// # Safety
    /// The executing code and stack must be mapped in `root`.
    unsafe fn write_cr3(&self, root: u64);
    fn read_cr4(&self) -> u64;
    fn read_segment(&self, reg: SegmentRegister) -> SegmentSelector;
    /// Load a data segment register. Loading fs or gs clobbers the matching
    /// base, callers rewrite the base MSRs afterwards.
    ///
    /// # Safety
    /// `sel` must be valid for `reg`.
    unsafe fn load_segment(&self, reg: SegmentRegister, sel: SegmentSelector);
    fn read_msr(&self, reg: msr::Register) -> u64;
    /// # Safety
    /// See [`msr::Register::write`].
    unsafe fn write_msr(&self, reg: msr::Register, v: u64);
    fn save_debug_registers(&self, regs: &mut [u64; 8]);
    /// # Safety
    /// Armed breakpoints fire on the code that runs next.
    unsafe fn restore_debug_registers(&self, regs: &[u64; 8]);
    fn disable_interrupts(&self);
    /// # Safety
    /// The core must be in a state that tolerates interrupt handlers.
    unsafe fn enable_interrupts(&self);
    fn store_idt(&self) -> DescriptorTablePointer;
    /// # Safety
    /// Every vector that can fire must be routed by `idt`.
    unsafe fn load_idt(&self, idt: &DescriptorTablePointer);
    /// Privileged stack pointers sp0, sp1 and sp2 of the task state segment.
    fn tss_stacks(&self) -> [u64; 3];
    /// # Safety
    /// The next privilege change will switch to `stacks[0]`.
    unsafe fn set_tss_stacks(&self, stacks: [u64; 3]);
}

/// Pages and the per-core kx window.
pub trait Mmu {
    /// Allocate `count` zeroed, physically contiguous pages. Returns the
    /// kernel virtual address of the first page.
    fn allocate_pages(&self, count: usize) -> Option<usize>;
    /// # Safety
    /// `va` must come from [`Mmu::allocate_pages`] with the same `count` and
    /// must not be used afterwards.
    unsafe fn free_pages(&self, va: usize, count: usize);
    fn virt_to_phys(&self, va: usize) -> Pa;
    /// Back the kx window of this core with the two guest area pages and up
    /// to two extra pages.
    fn set_guest_area(&self, pa0: Pa, pa1: Pa, pa2: Option<Pa>, pa3: Option<Pa>);
    /// The guest area of this core, as seen through the kx window.
    fn cur_cpu_guest_area(&self) -> *mut GuestArea;
    /// Fixed address of the redirection table inside the kx window. The two
    /// trampoline text pages and the global page follow it.
    fn idt_va(&self) -> u64;
    /// Back the redirection table, trampoline text and global pages of the
    /// kx window on every core.
    fn set_kx_global_info(&self, idt: Pa, text0: Pa, text1: Pa, global: Pa);
}

/// Access to the monitor process memory.
pub trait UserAccess {
    /// `copy_from_user`. May sleep to fault the page in.
    fn copy_from_user(&self, dst: &mut [u8], src: Hva) -> Result<(), KxError>;
    /// `copy_to_user`. May sleep to fault the page in.
    fn copy_to_user(&self, dst: Hva, src: &[u8]) -> Result<(), KxError>;
}

/// Entry-stub addresses of the vectors that need a dedicated prologue.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpecialStubs {
    pub double_fault: u64,
    pub invalid_tss: u64,
    pub segment_not_present: u64,
    pub stack_segment: u64,
    pub general_protection: u64,
    pub page_fault: u64,
    pub alignment_check: u64,
    pub security_exception: u64,
}

/// Link-time description of the assembly trampolines.
///
/// All addresses are the ones the code was linked at. The code is copied
/// into the kx window, so only offsets from [`TrampolineImage::intr_origin`]
/// survive.
#[derive(Clone, Copy)]
pub struct TrampolineImage<'a> {
    /// Interrupt entry code, starting at the stub of vector 0.
    pub intr_code: &'a [u8],
    /// Link address of `intr_code[0]`.
    pub intr_origin: u64,
    /// Guest domain entry code.
    pub entry_code: &'a [u8],
    /// Generic entry stub of each vector.
    pub vector_stubs: &'a [u64; IDT_ENTRIES],
    pub special_stubs: SpecialStubs,
    /// Link address of the payload `syscall` entry.
    pub syscall_entry: u64,
    /// Instruction-pointer relative operands to rewrite.
    pub relocations: &'a [Relocation],
}

/// Where the host resumes after [`Trampolines::switch_to_host_kernel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostReturn {
    pub cr3: u64,
    pub stack: u64,
}

/// Call contract of the assembly trampolines.
pub trait Trampolines {
    fn image(&self) -> TrampolineImage<'_>;

    /// Save the host stack into [`GuestArea::set_native_kernel_stack`],
    /// switch to `stack` and call the guest kernel entry, which ends in
    /// [`Kx::enter_payload`]. Returns once [`Kx::return_to_host`] has put the
    /// host back.
    ///
    /// # Safety
    /// `ga` must be the guest area of the current kontext of this core.
    unsafe fn switch_to_guest_kernel(&self, kx: &Kx, ga: *mut GuestArea, stack: u64);

    /// Load the payload registers from `ga` and `iretq` into the payload.
    ///
    /// # Safety
    /// `ga` must be fully staged by [`Kx::stage_payload_entry`].
    unsafe fn switch_to_guest_payload(&self, ga: *mut GuestArea) -> !;

    /// Switch to `ret.cr3` and `ret.stack` and return from
    /// [`Trampolines::switch_to_guest_kernel`].
    ///
    /// # Safety
    /// `ret` must come from [`Kx::stage_host_return`].
    unsafe fn switch_to_host_kernel(&self, ret: HostReturn) -> !;
}

/// Everything the engine needs from the embedding kernel.
pub trait Platform: Cpu + Mmu + UserAccess + Trampolines + Sync {}

impl<T: Cpu + Mmu + UserAccess + Trampolines + Sync> Platform for T {}

/// Contiguous pages owned by the engine. Freed on drop.
pub struct Pages {
    platform: &'static dyn Platform,
    va: usize,
    count: usize,
}

impl Pages {
    pub fn new(platform: &'static dyn Platform, count: usize) -> Result<Self, KxError> {
        let va = platform.allocate_pages(count).ok_or(KxError::OutOfMemory)?;
        Ok(Self {
            platform,
            va,
            count,
        })
    }

    #[inline]
    pub fn va(&self) -> usize {
        self.va
    }

    /// Physical address of the `n`th page.
    #[inline]
    pub fn pa(&self, n: usize) -> Pa {
        debug_assert!(n < self.count);
        self.platform.virt_to_phys(self.va + n * PAGE_SIZE)
    }

    #[inline]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.va as *mut T
    }
}

impl Drop for Pages {
    fn drop(&mut self) {
        unsafe { self.platform.free_pages(self.va, self.count) }
    }
}

/// [`Cpu`] of the core this code runs on.
///
/// [`Cpu::id`] is the initial APIC id, which is only a valid index on hosts
/// whose APIC ids are dense. Other kernels wrap this type and report their
/// own cpu number.
pub struct NativeCpu;

impl Cpu for NativeCpu {
    fn id(&self) -> usize {
        kxarch::x86_64::intrinsics::cpuid()
    }

    fn read_cr3(&self) -> u64 {
        kxarch::x86_64::intrinsics::read_cr3()
    }

    unsafe fn write_cr3(&self, root: u64) {
        kxarch::x86_64::intrinsics::write_cr3(root)
    }

    fn read_cr4(&self) -> u64 {
        kxarch::x86_64::Cr4::current().bits()
    }

    fn read_segment(&self, reg: SegmentRegister) -> SegmentSelector {
        reg.read()
    }

    unsafe fn load_segment(&self, reg: SegmentRegister, sel: SegmentSelector) {
        reg.load(sel)
    }

    fn read_msr(&self, reg: msr::Register) -> u64 {
        reg.read()
    }

    unsafe fn write_msr(&self, reg: msr::Register, v: u64) {
        reg.write(v)
    }

    fn save_debug_registers(&self, regs: &mut [u64; 8]) {
        kxarch::x86_64::intrinsics::read_debug_registers(regs)
    }

    unsafe fn restore_debug_registers(&self, regs: &[u64; 8]) {
        kxarch::x86_64::intrinsics::write_debug_registers(regs)
    }

    fn disable_interrupts(&self) {
        unsafe { kxarch::x86_64::intrinsics::cli() }
    }

    unsafe fn enable_interrupts(&self) {
        kxarch::x86_64::intrinsics::sti()
    }

    fn store_idt(&self) -> DescriptorTablePointer {
        kxarch::x86_64::table::InterruptDescriptorTable::current()
    }

    unsafe fn load_idt(&self, idt: &DescriptorTablePointer) {
        kxarch::x86_64::table::InterruptDescriptorTable::load(idt)
    }

    fn tss_stacks(&self) -> [u64; 3] {
        unsafe { kxarch::x86_64::tss::TaskStateSegment::current().stacks() }
    }

    unsafe fn set_tss_stacks(&self, stacks: [u64; 3]) {
        kxarch::x86_64::tss::TaskStateSegment::current().set_stacks(stacks)
    }
}
