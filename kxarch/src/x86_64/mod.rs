//! x86_64 specific

pub mod interrupt;
pub mod intrinsics;
pub mod msr;
pub mod segmentation;
pub mod table;
pub mod tss;

use core::arch::asm;

/// Privilege Levels.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrivilegeLevel {
    Ring0 = 0,
    Ring1 = 1,
    Ring2 = 2,
    Ring3 = 3,
}

bitflags::bitflags! {
    /// rflags.
    #[repr(transparent)]
    pub struct Rflags: u64 {
        /// Carry Flag
        const CF = 1 << 0;
        /// Must be 1.
        const _1 = 1 << 1;
        /// Parity Flag
        const PF = 1 << 2;
        /// Adjust Flag
        const AF = 1 << 4;
        /// Zero Flag
        const ZF = 1 << 6;
        /// Sign Flag
        const SF = 1 << 7;
        /// Trap Flag
        const TF = 1 << 8;
        /// Interrupt enable.
        ///
        /// Cleared to inhibit maskable hardware interrupts. Exceptions and
        /// NMIs are delivered regardless.
        const IF = 1 << 9;
        /// Direction Flag
        const DF = 1 << 10;
        /// Overflow Flag
        const OF = 1 << 11;
        /// I/O privilege level field - bit 0
        const IOPL0 = 1 << 12;
        /// I/O privilege level field - bit 1
        const IOPL1 = 1 << 13;
        /// Both bits of the I/O privilege level field.
        const IOPL = Self::IOPL0.bits | Self::IOPL1.bits;
        /// Nested task.
        const NT = 1 << 14;
        /// Resume flag.
        ///
        /// Suppresses instruction breakpoints for the next instruction.
        const RF = 1 << 16;
        /// Virtual-8086 mode.
        const VM = 1 << 17;
        /// Alignment check.
        const AC = 1 << 18;
        /// Virtual interrupt.
        const VIF = 1 << 19;
        /// Virtual interrupt pending.
        const VIP = 1 << 20;
        /// CPUID available.
        const ID = 1 << 21;
    }
}

bitflags::bitflags! {
    /// cr4.
    #[repr(transparent)]
    pub struct Cr4: u64 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        /// Debugging extensions.
        const DE = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
        const MCE = 1 << 6;
        /// Page global enable.
        const PGE = 1 << 7;
        const PCE = 1 << 8;
        const OSFXSR = 1 << 9;
        const OSXMMEXCPT = 1 << 10;
        const UMIP = 1 << 11;
        const LA57 = 1 << 12;
        const VMXE = 1 << 13;
        const SMXE = 1 << 14;
        const FSGSBASE = 1 << 16;
        /// Process context identifiers.
        const PCIDE = 1 << 17;
        const OSXSAVE = 1 << 18;
        /// Supervisor mode execution protection.
        const SMEP = 1 << 20;
        /// Supervisor mode access prevention.
        const SMAP = 1 << 21;
        const PKE = 1 << 22;
        const CET = 1 << 23;
        const PKS = 1 << 24;
    }
}

impl Cr4 {
    #[inline(always)]
    pub fn current() -> Self {
        let ret: u64;
        unsafe {
            asm!("mov {}, cr4", lateout(reg) ret, options(nomem, nostack));
        }
        Self::from_bits_truncate(ret)
    }
}
