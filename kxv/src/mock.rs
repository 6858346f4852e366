//! Test double of the embedding kernel.
//!
//! Pages come from the heap with an identity virtual to physical mapping.
//! The kx window is a separate buffer at its own address. It is filled from
//! the bound guest area when the guest kernel is entered and written back
//! before the host return, which is all the engine can observe of an alias.
//!
//! The trampolines run the whole guest cycle synchronously: entering the
//! guest kernel stages the payload entry, pops a scripted trap, lets the
//! "payload" clobber the core and stages the host return.
use crate::{
    addressing::{Hva, Pa},
    engine::Kx,
    guest_area::{GuestArea, TrapInfo, GUEST_AREA_PAGES, GUEST_AREA_SIZE},
    platform::{Cpu, HostReturn, Mmu, SpecialStubs, TrampolineImage, Trampolines, UserAccess},
    redirect::KX_INTR_CODE_SIZE,
    relocate::{Relocation, Rewrite},
    KxError,
};
use kxarch::{
    x86_64::{
        interrupt::IDT_ENTRIES,
        msr,
        segmentation::{Segment, SegmentRegister, SegmentSelector},
        table::DescriptorTablePointer,
    },
    PAGE_SIZE,
};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

pub const IDT_VA: u64 = 0xffff_fe80_0000_0000;
pub const NATIVE_IDT: DescriptorTablePointer =
    DescriptorTablePointer::new(0xffff_fe00_0000_0000, 0xfff);
pub const HOST_CR3: u64 = 0x1_0a2b_3000;
pub const HOST_CR4: u64 = 0x3706f0;
pub const HOST_STACK: u64 = 0xffff_c900_0012_3e80;
pub const HOST_SP0: u64 = 0xffff_fe00_0000_6000;
pub const NATIVE_DEBUG: [u64; 8] = [0, 0, 0, 0, 0, 0, 0xffff_0ff0, 0x400];
pub const PAYLOAD_DEBUG: [u64; 8] = [0x40_2000, 0, 0, 0, 0, 0, 0xffff_4ff0, 0x401];

/// Link address of the interrupt entry code.
pub const ORIGIN: u64 = 0xffff_ffff_c010_0000;
pub const SYSCALL_OFFSET: u64 = 700;
pub const ENTRY_CODE: [u8; 6] = [0x0f, 0x01, 0xf8, 0x48, 0xcf, 0xcc];

const INTR_CODE_LEN: usize = 1024;
const SPECIAL_VECTORS: [u8; 8] = [8, 10, 11, 12, 13, 14, 17, 30];
const RELOCATIONS: [(u64, Rewrite, u32); 3] = [
    (800, Rewrite::StoreRsp, 0x6000),
    (820, Rewrite::LoadRsp, 0x6000),
    (840, Rewrite::Push, 0x6008),
];

pub fn vector_stub_offset(vector: usize) -> u64 {
    vector as u64 * 2
}

pub fn special_stub_offset(vector: u8) -> u64 {
    let i = SPECIAL_VECTORS
        .iter()
        .position(|v| *v == vector)
        .expect("not a special vector");
    600 + i as u64 * 8
}

fn intr_code() -> Vec<u8> {
    let mut code = vec![0x90; INTR_CODE_LEN];
    for (offset, rewrite, target) in RELOCATIONS {
        let rel = rewrite.rip_relative();
        let next_ip = ORIGIN + offset + rel.len() as u64 + 4;
        let disp = (target as i64 - next_ip as i64) as i32;
        let at = offset as usize;
        code[at..at + rel.len()].copy_from_slice(rel);
        code[at + rel.len()..at + rel.len() + 4].copy_from_slice(&disp.to_le_bytes());
    }
    code
}

/// The interrupt entry code as it must look once installed.
pub fn relocated_intr_code() -> Vec<u8> {
    let mut code = intr_code();
    for (offset, rewrite, target) in RELOCATIONS {
        let abs = rewrite.absolute();
        let at = offset as usize;
        code[at..at + abs.len()].copy_from_slice(abs);
        code[at + abs.len()..at + abs.len() + 4].copy_from_slice(&target.to_le_bytes());
    }
    code
}

/// Trampoline image served by the mock.
pub struct Image {
    intr_code: Vec<u8>,
    vector_stubs: Box<[u64; IDT_ENTRIES]>,
    special_stubs: SpecialStubs,
    relocations: Vec<Relocation>,
}

impl Default for Image {
    fn default() -> Self {
        let special = |v: u8| ORIGIN + special_stub_offset(v);
        Self {
            intr_code: intr_code(),
            vector_stubs: Box::new(core::array::from_fn(|v| {
                ORIGIN + vector_stub_offset(v)
            })),
            special_stubs: SpecialStubs {
                double_fault: special(8),
                invalid_tss: special(10),
                segment_not_present: special(11),
                stack_segment: special(12),
                general_protection: special(13),
                page_fault: special(14),
                alignment_check: special(17),
                security_exception: special(30),
            },
            relocations: RELOCATIONS
                .iter()
                .map(|(offset, rewrite, _)| Relocation {
                    site: ORIGIN + offset,
                    rewrite: *rewrite,
                })
                .collect(),
        }
    }
}

impl Image {
    /// Interrupt entry code one byte too large for its region.
    pub fn oversized() -> Self {
        Self {
            intr_code: vec![0x90; KX_INTR_CODE_SIZE + 1],
            ..Self::default()
        }
    }

    /// The second relocation site does not hold its instruction.
    pub fn bad_relocation() -> Self {
        let mut image = Self::default();
        let at = RELOCATIONS[1].0 as usize;
        image.intr_code[at..at + 8].fill(0x90);
        image
    }
}

/// A trap raised by the payload.
#[derive(Clone, Copy, Debug)]
pub struct Trap {
    vector: u64,
    error: u64,
    cr2: u64,
}

impl Trap {
    pub fn new(vector: u64) -> Self {
        Self {
            vector,
            error: 0,
            cr2: 0,
        }
    }

    pub fn error(mut self, error: u64) -> Self {
        self.error = error;
        self
    }

    pub fn cr2(mut self, cr2: u64) -> Self {
        self.cr2 = cr2;
        self
    }
}

/// Architectural state of the mocked core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuState {
    pub id: usize,
    pub cr3: u64,
    pub cr4: u64,
    pub segments: HashMap<SegmentRegister, SegmentSelector>,
    pub msrs: HashMap<msr::Register, u64>,
    pub debug: [u64; 8],
    pub interrupts: bool,
    pub idt: DescriptorTablePointer,
    pub tss: [u64; 3],
}

impl CpuState {
    fn host() -> Self {
        let kernel_data = Segment::KernelData.into_selector();
        Self {
            id: 0,
            cr3: HOST_CR3,
            cr4: HOST_CR4,
            segments: HashMap::from([
                (SegmentRegister::Ds, kernel_data),
                (SegmentRegister::Es, kernel_data),
                (SegmentRegister::Fs, SegmentSelector::NULL),
                (SegmentRegister::Gs, SegmentSelector::NULL),
                (SegmentRegister::Ss, kernel_data),
            ]),
            msrs: HashMap::from([
                (msr::Register::FsBase, 0x7f3a_5c00_0740),
                (msr::Register::GsBase, 0xffff_8880_7fc0_0000),
                (msr::Register::KernelGsBase, 0x7f3a_5c40_0000),
                (msr::Register::Lstar, 0xffff_ffff_8160_0080),
            ]),
            debug: NATIVE_DEBUG,
            interrupts: true,
            idt: NATIVE_IDT,
            tss: [HOST_SP0, 0, 0],
        }
    }
}

/// What the core looked like when the payload was entered.
#[derive(Clone, Debug)]
pub struct PayloadEntry {
    /// Stack handed to the guest kernel.
    pub stack: u64,
    pub cr3: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
    pub interrupts: bool,
    pub idt: DescriptorTablePointer,
    pub tss: [u64; 3],
    pub lstar: u64,
    pub fs_base: u64,
    /// ds, es and fs.
    pub data_segments: [SegmentSelector; 3],
    pub debug: [u64; 8],
}

#[derive(Default)]
struct UserMemory {
    bytes: HashMap<u64, u8>,
    reads: Vec<u64>,
    writes: Vec<(u64, u8)>,
}

#[derive(Default)]
struct Allocations {
    live: usize,
    fail_after: Option<usize>,
    /// Kernel address of the guest area bound to the kx window.
    bound: Option<u64>,
    kx_global: Option<[Pa; 4]>,
}

pub struct MockPlatform {
    image: Image,
    window: usize,
    cpu: Mutex<CpuState>,
    pages: Mutex<Allocations>,
    user: Mutex<UserMemory>,
    traps: Mutex<VecDeque<Trap>>,
    entries: Mutex<Vec<PayloadEntry>>,
}

impl MockPlatform {
    pub fn new(image: Image) -> Self {
        let window = unsafe { alloc_zeroed(layout(GUEST_AREA_PAGES)) };
        assert!(!window.is_null());
        Self {
            image,
            window: window as usize,
            cpu: Mutex::new(CpuState::host()),
            pages: Mutex::default(),
            user: Mutex::default(),
            traps: Mutex::default(),
            entries: Mutex::default(),
        }
    }

    /// A platform living for the rest of the test process.
    pub fn leak() -> &'static Self {
        Self::leak_with_image(Image::default())
    }

    pub fn leak_with_image(image: Image) -> &'static Self {
        Box::leak(Box::new(Self::new(image)))
    }

    /// Let `n` more allocations succeed, fail the ones after.
    pub fn fail_allocations_after(&self, n: usize) {
        self.pages.lock().unwrap().fail_after = Some(n);
    }

    /// Pages allocated and not freed.
    pub fn live_pages(&self) -> usize {
        self.pages.lock().unwrap().live
    }

    pub fn kx_global_info(&self) -> Option<[Pa; 4]> {
        self.pages.lock().unwrap().kx_global
    }

    /// Address of the kx window.
    pub fn window(&self) -> u64 {
        self.window as u64
    }

    /// Copy the bound guest area into the kx window.
    pub fn load_window(&self) {
        let bound = self.pages.lock().unwrap().bound.expect("unbound window");
        unsafe {
            core::ptr::copy_nonoverlapping(
                bound as *const u8,
                self.window as *mut u8,
                GUEST_AREA_SIZE,
            )
        };
    }

    /// Copy the kx window back into the bound guest area.
    fn store_window(&self) {
        let bound = self.pages.lock().unwrap().bound.expect("unbound window");
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.window as *const u8,
                bound as *mut u8,
                GUEST_AREA_SIZE,
            )
        };
    }

    pub fn set_cpu(&self, id: usize) {
        self.cpu.lock().unwrap().id = id;
    }

    pub fn cpu_state(&self) -> CpuState {
        self.cpu.lock().unwrap().clone()
    }

    /// Back the monitor address `hva` with `bytes`.
    pub fn poke_user(&self, hva: u64, bytes: &[u8]) {
        let mut user = self.user.lock().unwrap();
        for (i, b) in bytes.iter().enumerate() {
            user.bytes.insert(hva + i as u64, *b);
        }
    }

    /// Addresses of the successful `copy_from_user` calls.
    pub fn user_reads(&self) -> Vec<u64> {
        self.user.lock().unwrap().reads.clone()
    }

    /// Bytes stored by `copy_to_user`.
    pub fn user_writes(&self) -> Vec<(u64, u8)> {
        self.user.lock().unwrap().writes.clone()
    }

    /// Raise `trap` on the next payload entry.
    pub fn script(&self, trap: Trap) {
        self.traps.lock().unwrap().push_back(trap);
    }

    pub fn payload_entries(&self) -> Vec<PayloadEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// The payload runs and raises `trap`.
    fn run_payload(&self, area: &mut GuestArea, trap: Trap) {
        area.trap_info = TrapInfo {
            error: trap.error,
            rip: area.state.regs.rip,
            cs: area.state.guest_payload_cs,
            rflags: area.state.regs.rflags,
            rsp: area.state.regs.rsp,
            ss: area.state.guest_payload_ss,
        };
        area.state.intr_no = trap.vector;
        area.state.sregs.cr2 = trap.cr2;

        let mut cpu = self.cpu.lock().unwrap();
        let user_data = Segment::UserData.into_selector();
        cpu.cr3 = area.state.guest_payload_cr3;
        cpu.segments.insert(SegmentRegister::Ds, user_data);
        cpu.segments.insert(SegmentRegister::Gs, user_data);
        cpu.segments.insert(SegmentRegister::Ss, SegmentSelector::NULL);
        cpu.msrs.insert(msr::Register::GsBase, 0x7f3a_5c80_0000);
        cpu.msrs.insert(msr::Register::KernelGsBase, 0xffff_8880_7fc0_0000);
        cpu.debug = PAYLOAD_DEBUG;
    }
}

impl Drop for MockPlatform {
    fn drop(&mut self) {
        unsafe { dealloc(self.window as *mut u8, layout(GUEST_AREA_PAGES)) }
    }
}

impl Cpu for MockPlatform {
    fn id(&self) -> usize {
        self.cpu.lock().unwrap().id
    }

    fn read_cr3(&self) -> u64 {
        self.cpu.lock().unwrap().cr3
    }

    unsafe fn write_cr3(&self, root: u64) {
        self.cpu.lock().unwrap().cr3 = root;
    }

    fn read_cr4(&self) -> u64 {
        self.cpu.lock().unwrap().cr4
    }

    fn read_segment(&self, reg: SegmentRegister) -> SegmentSelector {
        self.cpu
            .lock()
            .unwrap()
            .segments
            .get(&reg)
            .copied()
            .unwrap_or_default()
    }

    unsafe fn load_segment(&self, reg: SegmentRegister, sel: SegmentSelector) {
        let mut cpu = self.cpu.lock().unwrap();
        cpu.segments.insert(reg, sel);
        // The hidden base is reloaded from the descriptor.
        match reg {
            SegmentRegister::Fs => {
                cpu.msrs.insert(msr::Register::FsBase, 0);
            }
            SegmentRegister::Gs => {
                cpu.msrs.insert(msr::Register::GsBase, 0);
            }
            _ => (),
        }
    }

    fn read_msr(&self, reg: msr::Register) -> u64 {
        self.cpu
            .lock()
            .unwrap()
            .msrs
            .get(&reg)
            .copied()
            .unwrap_or(0)
    }

    unsafe fn write_msr(&self, reg: msr::Register, v: u64) {
        self.cpu.lock().unwrap().msrs.insert(reg, v);
    }

    fn save_debug_registers(&self, regs: &mut [u64; 8]) {
        *regs = self.cpu.lock().unwrap().debug;
    }

    unsafe fn restore_debug_registers(&self, regs: &[u64; 8]) {
        self.cpu.lock().unwrap().debug = *regs;
    }

    fn disable_interrupts(&self) {
        self.cpu.lock().unwrap().interrupts = false;
    }

    unsafe fn enable_interrupts(&self) {
        self.cpu.lock().unwrap().interrupts = true;
    }

    fn store_idt(&self) -> DescriptorTablePointer {
        self.cpu.lock().unwrap().idt
    }

    unsafe fn load_idt(&self, idt: &DescriptorTablePointer) {
        self.cpu.lock().unwrap().idt = *idt;
    }

    fn tss_stacks(&self) -> [u64; 3] {
        self.cpu.lock().unwrap().tss
    }

    unsafe fn set_tss_stacks(&self, stacks: [u64; 3]) {
        self.cpu.lock().unwrap().tss = stacks;
    }
}

fn layout(count: usize) -> Layout {
    Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap()
}

impl Mmu for MockPlatform {
    fn allocate_pages(&self, count: usize) -> Option<usize> {
        let mut pages = self.pages.lock().unwrap();
        match pages.fail_after {
            Some(0) => return None,
            Some(ref mut n) => *n -= 1,
            None => (),
        }
        let va = unsafe { alloc_zeroed(layout(count)) };
        if va.is_null() {
            return None;
        }
        pages.live += count;
        Some(va as usize)
    }

    unsafe fn free_pages(&self, va: usize, count: usize) {
        dealloc(va as *mut u8, layout(count));
        self.pages.lock().unwrap().live -= count;
    }

    fn virt_to_phys(&self, va: usize) -> Pa {
        Pa::new(va as u64)
    }

    fn set_guest_area(&self, pa0: Pa, pa1: Pa, _pa2: Option<Pa>, _pa3: Option<Pa>) {
        assert_eq!(pa1.as_u64(), pa0.as_u64() + PAGE_SIZE as u64);
        self.pages.lock().unwrap().bound = Some(pa0.as_u64());
    }

    fn cur_cpu_guest_area(&self) -> *mut GuestArea {
        self.window as *mut GuestArea
    }

    fn idt_va(&self) -> u64 {
        IDT_VA
    }

    fn set_kx_global_info(&self, idt: Pa, text0: Pa, text1: Pa, global: Pa) {
        self.pages.lock().unwrap().kx_global = Some([idt, text0, text1, global]);
    }
}

impl UserAccess for MockPlatform {
    fn copy_from_user(&self, dst: &mut [u8], src: Hva) -> Result<(), KxError> {
        let mut user = self.user.lock().unwrap();
        for (i, b) in dst.iter_mut().enumerate() {
            *b = *user
                .bytes
                .get(&(src.as_u64() + i as u64))
                .ok_or(KxError::BadHostAddress(src))?;
        }
        user.reads.push(src.as_u64());
        Ok(())
    }

    fn copy_to_user(&self, dst: Hva, src: &[u8]) -> Result<(), KxError> {
        let mut user = self.user.lock().unwrap();
        for (i, b) in src.iter().enumerate() {
            let addr = dst.as_u64() + i as u64;
            if !user.bytes.contains_key(&addr) {
                return Err(KxError::BadHostAddress(dst));
            }
            user.bytes.insert(addr, *b);
            user.writes.push((addr, *b));
        }
        Ok(())
    }
}

impl Trampolines for MockPlatform {
    fn image(&self) -> TrampolineImage<'_> {
        TrampolineImage {
            intr_code: &self.image.intr_code,
            intr_origin: ORIGIN,
            entry_code: &ENTRY_CODE,
            vector_stubs: &self.image.vector_stubs,
            special_stubs: self.image.special_stubs,
            syscall_entry: ORIGIN + SYSCALL_OFFSET,
            relocations: &self.image.relocations,
        }
    }

    unsafe fn switch_to_guest_kernel(&self, kx: &Kx, ga: *mut GuestArea, stack: u64) {
        assert_eq!(ga, self.cur_cpu_guest_area());
        self.load_window();
        (*ga).set_native_kernel_stack(HOST_STACK);

        let ga = kx
            .stage_payload_entry()
            .unwrap_or_else(|e| panic!("kx: cannot enter the payload: {}", e));
        let entry = {
            let cpu = self.cpu.lock().unwrap();
            let state = &(*ga).state;
            PayloadEntry {
                stack,
                cr3: cpu.cr3,
                rflags: state.regs.rflags,
                cs: state.guest_payload_cs,
                ss: state.guest_payload_ss,
                interrupts: cpu.interrupts,
                idt: cpu.idt,
                tss: cpu.tss,
                lstar: cpu.msrs[&msr::Register::Lstar],
                fs_base: cpu.msrs[&msr::Register::FsBase],
                data_segments: [
                    cpu.segments[&SegmentRegister::Ds],
                    cpu.segments[&SegmentRegister::Es],
                    cpu.segments[&SegmentRegister::Fs],
                ],
                debug: cpu.debug,
            }
        };
        self.entries.lock().unwrap().push(entry);

        let trap = self
            .traps
            .lock()
            .unwrap()
            .pop_front()
            .expect("payload ran without a scripted trap");
        self.run_payload(&mut *ga, trap);
        self.store_window();

        let ret = kx
            .stage_host_return()
            .unwrap_or_else(|e| panic!("kx: cannot return to the host: {}", e));
        assert_eq!(ret.stack, HOST_STACK);
        self.cpu.lock().unwrap().cr3 = ret.cr3;
    }

    unsafe fn switch_to_guest_payload(&self, _ga: *mut GuestArea) -> ! {
        unreachable!("the mock enters the payload from switch_to_guest_kernel")
    }

    unsafe fn switch_to_host_kernel(&self, _ret: HostReturn) -> ! {
        unreachable!("the mock returns to the host from switch_to_guest_kernel")
    }
}
