//! intrinsics of x86_64 not included in [`core::arch::x86_64`].
//!
//! [`core::arch::x86_64`]: https://doc.rust-lang.org/beta/core/arch/x86_64/index.html
use core::arch::asm;

/// Initial APIC id of this core.
///
/// APIC ids may be sparse; this is not a logical cpu number.
pub fn cpuid() -> usize {
    unsafe { (core::arch::x86_64::__cpuid(1).ebx >> 24) as usize }
}

/// read current cr3.
pub fn read_cr3() -> u64 {
    let r: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) r, options(nomem, nostack));
    }
    r
}

/// Switch the address space.
///
/// # Safety
/// The code and stack currently executing must be mapped in `root`.
pub unsafe fn write_cr3(root: u64) {
    asm!("mov cr3, {}", in(reg) root, options(nostack));
}

/// Mask maskable interrupts.
#[inline(always)]
pub unsafe fn cli() {
    asm!("cli", options(nomem, nostack));
}

/// Unmask maskable interrupts.
#[inline(always)]
pub unsafe fn sti() {
    asm!("sti", options(nomem, nostack));
}

/// Read the debug registers dr0-dr7 into `regs`.
///
/// dr4 and dr5 are aliases of dr6 and dr7 and are stored as zero.
pub fn read_debug_registers(regs: &mut [u64; 8]) {
    unsafe {
        asm!("mov {}, dr0", out(reg) regs[0], options(nomem, nostack));
        asm!("mov {}, dr1", out(reg) regs[1], options(nomem, nostack));
        asm!("mov {}, dr2", out(reg) regs[2], options(nomem, nostack));
        asm!("mov {}, dr3", out(reg) regs[3], options(nomem, nostack));
        asm!("mov {}, dr6", out(reg) regs[6], options(nomem, nostack));
        asm!("mov {}, dr7", out(reg) regs[7], options(nomem, nostack));
    }
    regs[4] = 0;
    regs[5] = 0;
}

/// Load the debug registers from `regs`.
///
/// # Safety
/// An armed dr7 fires breakpoints on whatever runs next.
pub unsafe fn write_debug_registers(regs: &[u64; 8]) {
    asm!("mov dr0, {}", in(reg) regs[0], options(nomem, nostack));
    asm!("mov dr1, {}", in(reg) regs[1], options(nomem, nostack));
    asm!("mov dr2, {}", in(reg) regs[2], options(nomem, nostack));
    asm!("mov dr3, {}", in(reg) regs[3], options(nomem, nostack));
    asm!("mov dr6, {}", in(reg) regs[6], options(nomem, nostack));
    asm!("mov dr7, {}", in(reg) regs[7], options(nomem, nostack));
}
