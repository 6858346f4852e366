//! Kontext: one guest execution session, entered on one core at a time.
use crate::{
    addressing::{Gva, Hva, Pa},
    guest_area::{GuestArea, GuestRegisters, SegmentRegisters, GUEST_AREA_PAGES},
    kontainer::Kontainer,
    platform::{Cpu, Pages, Platform},
    run::RunArea,
    KxError,
};
use alloc::{boxed::Box, sync::Arc};
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicUsize, Ordering},
};
use kxarch::x86_64::{
    msr,
    segmentation::{SegmentRegister, SegmentSelector},
};

const NO_CPU: usize = usize::MAX;

/// Host kernel state saved while a guest domain runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NativeState {
    pub cr3: u64,
    pub cr4: u64,
    pub ds: SegmentSelector,
    pub es: SegmentSelector,
    pub fs: SegmentSelector,
    pub fs_base: u64,
    pub gs: SegmentSelector,
    pub gs_base: u64,
    pub kernel_gs_base: u64,
    pub ss: SegmentSelector,
    /// Host `syscall` target.
    pub lstar: u64,
    pub debug: [u64; 8],
}

impl NativeState {
    /// Snapshot segments, their bases, the syscall target and the debug
    /// registers of `cpu`.
    pub fn save<C: Cpu + ?Sized>(&mut self, cpu: &C) {
        self.ds = cpu.read_segment(SegmentRegister::Ds);
        self.es = cpu.read_segment(SegmentRegister::Es);
        self.fs = cpu.read_segment(SegmentRegister::Fs);
        self.fs_base = cpu.read_msr(msr::Register::FsBase);
        self.gs = cpu.read_segment(SegmentRegister::Gs);
        self.gs_base = cpu.read_msr(msr::Register::GsBase);
        self.kernel_gs_base = cpu.read_msr(msr::Register::KernelGsBase);
        self.ss = cpu.read_segment(SegmentRegister::Ss);
        self.lstar = cpu.read_msr(msr::Register::Lstar);
        cpu.save_debug_registers(&mut self.debug);
    }

    /// Put back the syscall target, segments and bases saved by
    /// [`NativeState::save`].
    ///
    /// # Safety
    /// `self` must have been saved on this core.
    pub unsafe fn restore<C: Cpu + ?Sized>(&self, cpu: &C) {
        cpu.write_msr(msr::Register::Lstar, self.lstar);
        cpu.load_segment(SegmentRegister::Ds, self.ds);
        cpu.load_segment(SegmentRegister::Es, self.es);
        cpu.load_segment(SegmentRegister::Fs, self.fs);
        cpu.write_msr(msr::Register::FsBase, self.fs_base);
        cpu.load_segment(SegmentRegister::Gs, self.gs);
        cpu.write_msr(msr::Register::GsBase, self.gs_base);
        cpu.write_msr(msr::Register::KernelGsBase, self.kernel_gs_base);
        cpu.load_segment(SegmentRegister::Ss, self.ss);
    }
}

/// A guest execution session.
pub struct Kontext {
    kontainer: Arc<Kontainer>,
    guest_area: Pages,
    guest_area_pa: [Pa; GUEST_AREA_PAGES],
    run: RunArea,
    native: UnsafeCell<NativeState>,
    active_cpu: AtomicUsize,
}

// Native state and guest area are only touched by the core the kontext is
// active on.
unsafe impl Sync for Kontext {}

impl Kontext {
    /// Allocate the guest area and the exit record of a new session.
    ///
    /// The kontext is boxed, the guest area points back at it.
    pub fn new(
        platform: &'static dyn Platform,
        kontainer: Arc<Kontainer>,
    ) -> Result<Box<Self>, KxError> {
        let guest_area = Pages::new(platform, GUEST_AREA_PAGES).map_err(|e| {
            log::warn!("kontext: no memory for the guest area");
            e
        })?;
        let run = RunArea::new(platform)?;
        let guest_area_pa = [guest_area.pa(0), guest_area.pa(1)];

        let kontext = Box::new(Self {
            kontainer,
            guest_area,
            guest_area_pa,
            run,
            native: UnsafeCell::new(NativeState::default()),
            active_cpu: AtomicUsize::new(NO_CPU),
        });
        unsafe { GuestArea::init(kontext.guest_area(), &*kontext) };
        log::info!(
            "kontext: guest area va {:#x} pa0 {} pa1 {}",
            kontext.guest_area.va(),
            guest_area_pa[0],
            guest_area_pa[1]
        );
        Ok(kontext)
    }

    #[inline]
    pub fn kontainer(&self) -> &Arc<Kontainer> {
        &self.kontainer
    }

    /// Guest area, at its kernel address.
    #[inline]
    pub fn guest_area(&self) -> *mut GuestArea {
        self.guest_area.as_mut_ptr()
    }

    /// Physical addresses of the two guest area pages.
    #[inline]
    pub fn guest_area_pa(&self) -> [Pa; GUEST_AREA_PAGES] {
        self.guest_area_pa
    }

    #[inline]
    pub fn run(&self) -> &RunArea {
        &self.run
    }

    /// Translate a guest address through the kontainer's memory map.
    #[inline]
    pub fn translate(&self, gva: Gva) -> Result<Hva, KxError> {
        self.kontainer.translate(gva)
    }

    /// Host state saved by the last entry.
    pub fn native_state(&self) -> NativeState {
        unsafe { *self.native.get() }
    }

    #[inline]
    pub(crate) fn native_mut(&self) -> *mut NativeState {
        self.native.get()
    }

    /// Core the kontext is active on.
    pub fn active_cpu(&self) -> Option<usize> {
        match self.active_cpu.load(Ordering::Acquire) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn try_activate(&self, cpu: usize) -> Result<(), KxError> {
        self.active_cpu
            .compare_exchange(NO_CPU, cpu, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| KxError::KontextBusy)
    }

    /// Record that the active kontext now runs on `cpu`.
    pub(crate) fn migrate(&self, cpu: usize) {
        self.active_cpu.store(cpu, Ordering::Release);
    }

    pub(crate) fn deactivate(&self) {
        self.active_cpu.store(NO_CPU, Ordering::Release);
    }

    fn with_area<R>(&self, f: impl FnOnce(&mut GuestArea) -> R) -> Result<R, KxError> {
        if self.active_cpu().is_some() {
            return Err(KxError::KontextBusy);
        }
        Ok(f(unsafe { &mut *self.guest_area() }))
    }

    /// Guest general purpose registers.
    pub fn regs(&self) -> Result<GuestRegisters, KxError> {
        self.with_area(|ga| ga.state.regs)
    }

    pub fn set_regs(&self, regs: &GuestRegisters) -> Result<(), KxError> {
        self.with_area(|ga| ga.state.regs = *regs)
    }

    /// Guest segment and control registers.
    pub fn sregs(&self) -> Result<SegmentRegisters, KxError> {
        self.with_area(|ga| ga.state.sregs)
    }

    pub fn set_sregs(&self, sregs: &SegmentRegisters) -> Result<(), KxError> {
        self.with_area(|ga| ga.state.sregs = *sregs)
    }
}
