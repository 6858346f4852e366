//! Model-specific register (MSR).

use core::arch::asm;

pub const IA32_LSTAR: usize = 0xC000_0082;
pub const IA32_FS_BASE: usize = 0xC000_0100;
pub const IA32_GS_BASE: usize = 0xC000_0101;
pub const IA32_KERNEL_GS_BASE: usize = 0xC000_0102;

/// Model specific register.
pub struct Msr<const ADDR: usize>;

impl<const ADDR: usize> Msr<ADDR> {
    /// Read the current value.
    #[inline(always)]
    pub fn read() -> u64 {
        let hi: u32;
        let lo: u32;
        unsafe {
            asm!("rdmsr", out("edx") hi, out("eax") lo, in("ecx") ADDR, options(nomem, nostack));
        }
        ((hi as u64) << 32) | (lo as u64)
    }

    /// Write to the msr.
    #[inline(always)]
    pub unsafe fn write(v: u64) {
        asm!(
            "wrmsr",
            in("edx") (v >> 32) as u32,
            in("eax") v as u32,
            in("ecx") ADDR,
            options(nomem, nostack)
        );
    }
}

/// The MSRs that differ between the host kernel and a guest domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Register {
    /// Base of the fs segment.
    FsBase,
    /// Base of the gs segment.
    GsBase,
    /// Value swapped into gs base by `swapgs`.
    KernelGsBase,
    /// Target of the `syscall` instruction.
    Lstar,
}

impl Register {
    /// Address of the register.
    pub const fn address(self) -> usize {
        match self {
            Self::FsBase => IA32_FS_BASE,
            Self::GsBase => IA32_GS_BASE,
            Self::KernelGsBase => IA32_KERNEL_GS_BASE,
            Self::Lstar => IA32_LSTAR,
        }
    }

    #[inline]
    pub fn read(self) -> u64 {
        match self {
            Self::FsBase => Msr::<IA32_FS_BASE>::read(),
            Self::GsBase => Msr::<IA32_GS_BASE>::read(),
            Self::KernelGsBase => Msr::<IA32_KERNEL_GS_BASE>::read(),
            Self::Lstar => Msr::<IA32_LSTAR>::read(),
        }
    }

    /// # Safety
    /// Writing a wrong base or syscall target breaks the running kernel.
    #[inline]
    pub unsafe fn write(self, v: u64) {
        match self {
            Self::FsBase => Msr::<IA32_FS_BASE>::write(v),
            Self::GsBase => Msr::<IA32_GS_BASE>::write(v),
            Self::KernelGsBase => Msr::<IA32_KERNEL_GS_BASE>::write(v),
            Self::Lstar => Msr::<IA32_LSTAR>::write(v),
        }
    }
}
