//! Interrupt.

use super::segmentation::SegmentSelector;
use super::PrivilegeLevel;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Number of entries in an interrupt descriptor table.
pub const IDT_ENTRIES: usize = 256;

/// Architectural exception vectors of the x86_64.
///
/// See Intel 64 and IA-32 Architectures Software Developer’s Manual, Volume
/// 3A: System Programming Guide, Part 1, Chapter 6.15. Vectors 32-255 are
/// external interrupts and have no name here.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ExceptionVector {
    /// #DE
    DivideError = 0,
    /// #DB
    Debug = 1,
    NonMaskableInterrupt = 2,
    /// #BP
    Breakpoint = 3,
    /// #OF
    Overflow = 4,
    /// #BR
    BoundRangeExceeded = 5,
    /// #UD
    InvalidOpcode = 6,
    /// #NM
    DeviceNotAvailable = 7,
    /// #DF
    DoubleFault = 8,
    CoprocessorSegmentOverrun = 9,
    /// #TS
    InvalidTss = 10,
    /// #NP
    SegmentNotPresent = 11,
    /// #SS
    StackSegmentFault = 12,
    /// #GP
    GeneralProtection = 13,
    /// #PF
    PageFault = 14,
    /// #MF
    X87FloatingPoint = 16,
    /// #AC
    AlignmentCheck = 17,
    /// #MC
    MachineCheck = 18,
    /// #XM
    SimdFloatingPoint = 19,
    /// #VE
    Virtualization = 20,
    /// #CP
    ControlProtection = 21,
    /// #HV
    HypervisorInjection = 28,
    /// #VC
    VmmCommunication = 29,
    /// #SX
    SecurityException = 30,
}

impl ExceptionVector {
    /// Decode a raw vector number.
    #[inline]
    pub fn new(x: u64) -> Option<Self> {
        u8::try_from(x).ok().and_then(|n| Self::try_from(n).ok())
    }
}

/// Type of gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateType {
    /// Interrupts are masked on entry.
    Interrupt = 0xe,
    /// Interrupts are left untouched on entry.
    Trap = 0xf,
}

/// An entry of the 64-bit interrupt descriptor table.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct GateDescriptor {
    lo: u16,
    selector: u16,
    options: u16,
    mid: u16,
    hi: u32,
    _rev: u32,
}

impl GateDescriptor {
    /// A present gate that enters `handler` through `ss`.
    ///
    /// `dpl` is the least privileged ring allowed to raise the vector with a
    /// software `int`.
    #[inline]
    pub const fn new(
        handler: u64,
        ss: SegmentSelector,
        ty_: GateType,
        dpl: PrivilegeLevel,
        ist: u8,
    ) -> Self {
        GateDescriptor {
            lo: handler as u16,
            selector: ss.pack(),
            options: (1 << 15) | (dpl as u16) << 13 | (ty_ as u16) << 8 | (ist as u16 & 0x7),
            mid: (handler >> 16) as u16,
            hi: (handler >> 32) as u32,
            _rev: 0,
        }
    }

    /// Address of the handler.
    #[inline]
    pub const fn handler(&self) -> u64 {
        self.lo as u64 | (self.mid as u64) << 16 | (self.hi as u64) << 32
    }

    #[inline]
    pub const fn selector(&self) -> SegmentSelector {
        SegmentSelector::from_raw(self.selector)
    }

    #[inline]
    pub const fn dpl(&self) -> PrivilegeLevel {
        match (self.options >> 13) & 3 {
            0 => PrivilegeLevel::Ring0,
            1 => PrivilegeLevel::Ring1,
            2 => PrivilegeLevel::Ring2,
            _ => PrivilegeLevel::Ring3,
        }
    }

    #[inline]
    pub const fn is_present(&self) -> bool {
        self.options & (1 << 15) != 0
    }

    #[inline]
    pub const fn gate_type(&self) -> Option<GateType> {
        match (self.options >> 8) & 0xf {
            0xe => Some(GateType::Interrupt),
            0xf => Some(GateType::Trap),
            _ => None,
        }
    }

    /// Raw 16 bytes of the entry.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut b = [0; 16];
        b[0..2].copy_from_slice(&self.lo.to_le_bytes());
        b[2..4].copy_from_slice(&self.selector.to_le_bytes());
        b[4..6].copy_from_slice(&self.options.to_le_bytes());
        b[6..8].copy_from_slice(&self.mid.to_le_bytes());
        b[8..12].copy_from_slice(&self.hi.to_le_bytes());
        b
    }
}

impl core::fmt::Debug for GateDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("GateDescriptor")
            .field("handler", &format_args!("{:#x}", self.handler()))
            .field("selector", &self.selector())
            .field("dpl", &self.dpl())
            .field("present", &self.is_present())
            .finish()
    }
}

bitflags::bitflags! {
    /// List of error codes on page fault.
    #[repr(transparent)]
    pub struct PFErrorCode: u64 {
        /// When set, the page fault was caused by a page-protection violation. When not set, it was caused by a non-present page.
        const PRESENT = 1 << 0;
        /// When set, the page fault was caused by a write access. When not set, it was caused by a read access.
        const WRITE_ACCESS = 1 << 1;
        /// When set, the page fault was caused while CPL = 3.
        const USER = 1 << 2;
        /// Reserved bit set in a paging-structure entry.
        const RESERVED_WRITE = 1 << 3;
        /// Caused by an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
        /// Protection-key violation.
        const PROTECTION_KEY = 1 << 5;
    }
}
