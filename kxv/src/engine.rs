//! The domain-switch engine.
//!
//! ```text
//!  host kernel                     guest kernel              guest payload
//!  -----------                     ------------              -------------
//!  enter_guest
//!    save native state
//!    cr3 <- guest kernel root
//!    switch_to_guest_kernel ------> kx_guest_kernel_start_payload
//!                                     stage_payload_entry
//!                                     switch_to_guest_payload ---> runs
//!                                                                   | trap
//!                                  kx_switch_to_host_kernel <-------+
//!                                     stage_host_return
//!    <----------------------------- switch_to_host_kernel
//!    dispatch
//!    Resume: loop, Done: return
//! ```
//!
//! The two entry points of the trampolines run without a caller the engine
//! could return to. They find the engine through [`Kx::global`] and the
//! kontext through the per-core current slot.
use crate::{
    config::{Config, PayloadInterrupts},
    emulate::{gp::GeneralProtection, pf::PageFault, FaultController, TrapState},
    guest_area::GuestArea,
    kontext::Kontext,
    platform::{HostReturn, Platform},
    probe::KontextProbe,
    redirect::RedirectTable,
    run::ExitReason,
    KxError, MAX_CPU,
};
use alloc::boxed::Box;
use core::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};
use crossbeam_utils::CachePadded;
use kxarch::x86_64::{
    msr,
    segmentation::{Segment, SegmentRegister, SegmentSelector},
    table::DescriptorTablePointer,
    Rflags,
};

/// Outcome of a handled trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Re-enter the guest payload.
    Resume,
    /// Return to the caller of [`Kx::enter_guest`].
    Done,
}

type Controllers = (GeneralProtection, (PageFault, ()));

static KX: AtomicPtr<Kx> = AtomicPtr::new(ptr::null_mut());

/// The engine.
pub struct Kx {
    platform: &'static dyn Platform,
    config: Config,
    redirect: RedirectTable,
    current: [CachePadded<AtomicPtr<Kontext>>; MAX_CPU],
    faults: Controllers,
}

/// Marks a kontext active for the duration of [`Kx::enter_guest`].
struct Active<'a>(&'a Kontext);

impl<'a> Active<'a> {
    fn new(kontext: &'a Kontext, cpu: usize) -> Result<Self, KxError> {
        kontext.try_activate(cpu)?;
        Ok(Self(kontext))
    }
}

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.deactivate();
    }
}

/// Flags the payload is entered with.
fn payload_rflags(raw: u64, policy: PayloadInterrupts) -> u64 {
    let mut flags = Rflags::from_bits_truncate(raw);
    flags.set(Rflags::IF, policy == PayloadInterrupts::Enabled);
    flags.remove(Rflags::IOPL);
    flags.insert(Rflags::RF);
    flags.bits()
}

impl Kx {
    /// Build the engine and its redirection table.
    ///
    /// The table reaches the kx window once the engine is registered.
    pub fn new(platform: &'static dyn Platform, config: Config) -> Result<Self, KxError> {
        let redirect = RedirectTable::install(
            platform,
            kx_switch_to_host_kernel as *const () as usize as u64,
        )?;
        log::info!("kx: ready, {:?}", config);
        Ok(Self {
            platform,
            config,
            redirect,
            current: core::array::from_fn(|_| CachePadded::new(AtomicPtr::new(ptr::null_mut()))),
            faults: (GeneralProtection::new(config.gp_mismatch), (PageFault, ())),
        })
    }

    /// Publish the engine to the trampoline entry points and its table to
    /// the kx window.
    ///
    /// A rejected engine is dropped without touching the kx window.
    pub fn register(self) -> Result<&'static Kx, KxError> {
        let kx = Box::into_raw(Box::new(self));
        match KX.compare_exchange(ptr::null_mut(), kx, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                // Safety: registered engines live until unregister.
                let kx = unsafe { &*kx };
                unsafe { kx.redirect.publish(kx.platform) };
                Ok(kx)
            }
            Err(_) => {
                drop(unsafe { Box::from_raw(kx) });
                Err(KxError::AlreadyInstalled)
            }
        }
    }

    /// Tear down the registered engine, if any.
    ///
    /// # Safety
    /// No kontext may be inside [`Kx::enter_guest`], and no reference
    /// obtained from [`Kx::register`] or [`Kx::global`] may be used
    /// afterwards.
    pub unsafe fn unregister() {
        let kx = KX.swap(ptr::null_mut(), Ordering::AcqRel);
        if kx.is_null() {
            return;
        }
        let kx = Box::from_raw(kx);
        if kx
            .current
            .iter()
            .any(|slot| !slot.load(Ordering::Acquire).is_null())
        {
            log::warn!("kx: unregistered while a kontext is current");
        }
        drop(kx);
    }

    /// The registered engine.
    pub fn global() -> Option<&'static Kx> {
        unsafe { KX.load(Ordering::Acquire).as_ref() }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn platform(&self) -> &'static dyn Platform {
        self.platform
    }

    #[inline]
    pub fn redirect_table(&self) -> &RedirectTable {
        &self.redirect
    }

    /// Kontext active on `cpu`.
    pub(crate) fn current(&self, cpu: usize) -> Result<&Kontext, KxError> {
        let slot = self.current.get(cpu).ok_or(KxError::CpuOutOfRange(cpu))?;
        unsafe { slot.load(Ordering::Acquire).as_ref() }
            .ok_or(KxError::NoCurrentKontext)
    }

    /// Run `kontext` until a trap needs the monitor.
    ///
    /// Traps the engine resolves by itself are handled without returning.
    /// Returns [`FaultOutcome::Done`] once the exit record of the kontext
    /// tells the monitor what happened.
    pub fn enter_guest(&self, kontext: &Kontext) -> Result<FaultOutcome, KxError> {
        let p = self.platform;
        let [pa0, pa1] = kontext.guest_area_pa();
        let (native_idt, guest_idt) = self.redirect.descriptors();
        let _active = Active::new(kontext, p.id())?;

        loop {
            p.disable_interrupts();
            let cpu = p.id();
            let slot = match self.current.get(cpu) {
                Some(slot) => slot,
                None => {
                    unsafe { p.enable_interrupts() };
                    return Err(KxError::CpuOutOfRange(cpu));
                }
            };
            p.set_guest_area(pa0, pa1, None, None);
            kontext.migrate(cpu);
            slot.store(kontext as *const Kontext as *mut Kontext, Ordering::Release);

            unsafe {
                self.switch_to_guest(kontext, native_idt, guest_idt);
            }

            slot.store(ptr::null_mut(), Ordering::Release);
            unsafe { p.enable_interrupts() };

            match self.dispatch(kontext)? {
                FaultOutcome::Resume => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Save the host, enter the guest kernel and come back once a trap has
    /// restored the host.
    unsafe fn switch_to_guest(
        &self,
        kontext: &Kontext,
        native_idt: DescriptorTablePointer,
        guest_idt: DescriptorTablePointer,
    ) {
        let p = self.platform;
        {
            let native = &mut *kontext.native_mut();
            native.cr3 = p.read_cr3();
            native.cr4 = p.read_cr4();
            native.save(p);

            let kontainer = kontext.kontainer();
            let state = &mut (*kontext.guest_area()).state;
            state.native_idt_desc = native_idt;
            state.guest_idt_desc = guest_idt;
            state.guest_kernel_cr3 = kontainer.guest_kernel_root().as_u64();
            state.guest_kernel_cr4 = native.cr4;
            state.guest_payload_cr3 = kontainer.guest_payload_root().as_u64();
            state.intr_no = u64::MAX;
        }

        let window = p.cur_cpu_guest_area();
        let stack = (*window).stack_top();
        p.write_cr3(kontext.kontainer().guest_kernel_root().as_u64());
        p.switch_to_guest_kernel(self, window, stack);

        p.restore_debug_registers(&(*kontext.native_mut()).debug);
    }

    /// Prepare the guest area and the core for the payload.
    ///
    /// Runs in the guest kernel domain on the guest area stack. The area is
    /// found again through the kx window.
    ///
    /// # Safety
    /// Must be called by the guest kernel entry of the current kontext of
    /// this core, with interrupts disabled.
    pub unsafe fn stage_payload_entry(&self) -> Result<*mut GuestArea, KxError> {
        let p = self.platform;
        let kontext = self.current(p.id())?;
        let ga = p.cur_cpu_guest_area();
        let area = &mut *ga;
        let kernel = area.self_locate();
        if area.owner() != kontext as *const Kontext || kernel != kontext.guest_area() {
            log::error!("kx: kx window does not hold the current kontext");
            return Err(KxError::NoCurrentKontext);
        }

        p.load_segment(SegmentRegister::Ds, SegmentSelector::NULL);
        p.load_segment(SegmentRegister::Es, SegmentSelector::NULL);
        p.load_segment(SegmentRegister::Fs, SegmentSelector::NULL);
        p.write_msr(msr::Register::FsBase, area.state.sregs.fs.base);
        p.write_msr(msr::Register::Lstar, self.redirect.syscall_entry());

        let state = &mut area.state;
        // Never trust the selectors of the guest.
        state.guest_payload_cs = Segment::UserCode.into_selector().pack() as u64;
        state.guest_payload_ss = Segment::UserData.into_selector().pack() as u64;
        state.regs.rflags = payload_rflags(state.regs.rflags, self.config.payload_interrupts);
        p.restore_debug_registers(&state.debug);

        area.verify_redzone()?;

        let stacks = p.tss_stacks();
        area.state.native_tss_stacks = stacks;
        p.set_tss_stacks([area.stack_top(), stacks[1], stacks[2]]);
        p.load_idt(&area.state.guest_idt_desc);
        Ok(ga)
    }

    /// Enter the payload of the current kontext.
    ///
    /// # Safety
    /// See [`Kx::stage_payload_entry`].
    ///
    /// # Panics
    /// There is no caller to report a failure to: a corrupted guest area or
    /// a missing kontext panics.
    pub unsafe fn enter_payload(&self) -> ! {
        match self.stage_payload_entry() {
            Ok(ga) => self.platform.switch_to_guest_payload(ga),
            Err(e) => panic!("kx: cannot enter the payload: {}", e),
        }
    }

    /// Put the host state back after a trap.
    ///
    /// # Safety
    /// Must be called by the trap entry code of this core while its current
    /// kontext runs in a guest domain.
    pub unsafe fn stage_host_return(&self) -> Result<HostReturn, KxError> {
        let p = self.platform;
        let cpu = p.id();
        let kontext = self.current(cpu)?;
        let area = &mut *kontext.guest_area();

        area.state.regs.rip = area.trap_info.rip;
        area.state.regs.rflags = area.trap_info.rflags;
        self.redirect.set_last_id(cpu, area.state.intr_no)?;
        p.save_debug_registers(&mut area.state.debug);

        p.set_tss_stacks(area.state.native_tss_stacks);
        p.load_idt(&area.state.native_idt_desc);
        let native = &*kontext.native_mut();
        native.restore(p);

        Ok(HostReturn {
            cr3: native.cr3,
            stack: area.state.native_kernel_stack,
        })
    }

    /// Return to the host kernel after a trap.
    ///
    /// # Safety
    /// See [`Kx::stage_host_return`].
    ///
    /// # Panics
    /// Panics when the core has no current kontext.
    pub unsafe fn return_to_host(&self) -> ! {
        match self.stage_host_return() {
            Ok(ret) => self.platform.switch_to_host_kernel(ret),
            Err(e) => panic!("kx: cannot return to the host: {}", e),
        }
    }

    /// Hand the last trap of `kontext` to the fault controllers.
    pub fn dispatch(&self, kontext: &Kontext) -> Result<FaultOutcome, KxError> {
        // Safety: the kontext is not running, its areas are ours.
        let area = unsafe { &mut *kontext.guest_area() };
        let (run, data) = unsafe { kontext.run().split_mut() };
        run.set_reason(ExitReason::Unknown);

        let vector = area.state.intr_no;
        let ti = &area.trap_info;
        log::debug!(
            "kx: trap {:#x} error {:#x} rip {:#x} cs {:#x} rflags {:#x} rsp {:#x} ss {:#x} cr2 {:#x}",
            vector,
            ti.error,
            ti.rip,
            ti.cs,
            ti.rflags,
            ti.rsp,
            ti.ss,
            area.state.sregs.cr2
        );

        let probe = KontextProbe::new(kontext, self.platform);
        let mut state = TrapState { area, run, data };
        self.faults
            .handle(vector, &probe, &mut state)
            .map_err(|e| {
                if let KxError::UnsupportedTrap(v) = e {
                    log::error!("kx: vector {:#x} is not virtualized", v);
                }
                e
            })
    }
}

/// Guest kernel entry, called by the guest entry code on the guest area
/// stack.
#[no_mangle]
pub unsafe extern "C" fn kx_guest_kernel_start_payload() -> ! {
    match Kx::global() {
        Some(kx) => kx.enter_payload(),
        None => panic!("kx: payload entry without a registered engine"),
    }
}

/// Target of the redirect pointer. Reached from every trap taken in a guest
/// domain.
#[no_mangle]
pub unsafe extern "C" fn kx_switch_to_host_kernel() -> ! {
    match Kx::global() {
        Some(kx) => kx.return_to_host(),
        None => panic!("kx: trap without a registered engine"),
    }
}
