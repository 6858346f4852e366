//! Segment selectors and segment registers.

use super::PrivilegeLevel;
use core::arch::asm;

#[derive(Copy, Clone, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct SegmentSelector(u16);

impl core::fmt::Debug for SegmentSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("SegmentSelector")
            .field("index", &self.index())
            .field("dpl", &self.dpl())
            .finish()
    }
}

impl SegmentSelector {
    /// The null selector.
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(index: u16, dpl: PrivilegeLevel) -> Self {
        Self((index << 3) | dpl as u16)
    }

    /// Reinterpret a raw selector value.
    #[inline]
    pub const fn from_raw(v: u16) -> Self {
        Self(v)
    }

    #[inline]
    pub const fn pack(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    #[inline]
    pub const fn dpl(self) -> PrivilegeLevel {
        match self.0 & 3 {
            0 => PrivilegeLevel::Ring0,
            1 => PrivilegeLevel::Ring1,
            2 => PrivilegeLevel::Ring2,
            _ => PrivilegeLevel::Ring3,
        }
    }
}

/// Data segment registers that are saved and restored across a domain switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentRegister {
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
}

impl SegmentRegister {
    #[inline(always)]
    pub fn read(&self) -> SegmentSelector {
        let v: u16;
        unsafe {
            match self {
                Self::Ds => asm!("mov {:x}, ds", out(reg) v, options(nostack, nomem)),
                Self::Es => asm!("mov {:x}, es", out(reg) v, options(nostack, nomem)),
                Self::Fs => asm!("mov {:x}, fs", out(reg) v, options(nostack, nomem)),
                Self::Gs => asm!("mov {:x}, gs", out(reg) v, options(nostack, nomem)),
                Self::Ss => asm!("mov {:x}, ss", out(reg) v, options(nostack, nomem)),
            }
        }
        SegmentSelector(v)
    }

    /// Load `ss` into the register.
    ///
    /// Loading fs or gs resets the hidden base to the descriptor base, so the
    /// caller rewrites the base MSRs afterwards.
    ///
    /// # Safety
    /// `ss` must name a valid descriptor for the register.
    #[inline(always)]
    pub unsafe fn load(&self, ss: SegmentSelector) {
        match self {
            Self::Ds => asm!("mov ds, {:x}", in(reg) ss.pack(), options(nostack, nomem)),
            Self::Es => asm!("mov es, {:x}", in(reg) ss.pack(), options(nostack, nomem)),
            Self::Fs => asm!("mov fs, {:x}", in(reg) ss.pack(), options(nostack, nomem)),
            Self::Gs => asm!("mov gs, {:x}", in(reg) ss.pack(), options(nostack, nomem)),
            Self::Ss => asm!("mov ss, {:x}", in(reg) ss.pack(), options(nostack, nomem)),
        }
    }
}

/// Selectors of the host kernel's global descriptor table.
///
/// The layout is the one of the x86_64 Linux kernel, whose GDT is live while a
/// guest runs.
#[derive(Copy, Clone, Debug)]
pub enum Segment {
    Null,
    KernelCode,
    KernelData,
    UserData,
    UserCode,
}

impl Segment {
    pub const KERNEL_CODE_SELECTOR: SegmentSelector =
        SegmentSelector::new(2, PrivilegeLevel::Ring0);
    pub const KERNEL_DATA_SELECTOR: SegmentSelector =
        SegmentSelector::new(3, PrivilegeLevel::Ring0);
    pub const USER_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(5, PrivilegeLevel::Ring3);
    pub const USER_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(6, PrivilegeLevel::Ring3);

    #[inline]
    pub const fn into_selector(self) -> SegmentSelector {
        match self {
            Self::Null => SegmentSelector::NULL,
            Self::KernelCode => Self::KERNEL_CODE_SELECTOR,
            Self::KernelData => Self::KERNEL_DATA_SELECTOR,
            Self::UserData => Self::USER_DATA_SELECTOR,
            Self::UserCode => Self::USER_CODE_SELECTOR,
        }
    }
}
