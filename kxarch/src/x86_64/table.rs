//! Descriptor table registers.

use core::arch::asm;

/// Image of a descriptor table register as used by `lidt`/`sidt` and
/// `lgdt`/`sgdt`.
#[repr(C, packed)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTablePointer {
    /// Size of the table minus one.
    pub size: u16,
    /// Linear address of the table.
    pub address: u64,
}

impl core::fmt::Debug for DescriptorTablePointer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        let (size, address) = (self.size, self.address);
        write!(
            f,
            "DescriptorTablePointer({:#x}, size {:#x})",
            address, size
        )
    }
}

impl DescriptorTablePointer {
    #[inline]
    pub const fn new(address: u64, size: u16) -> Self {
        Self { size, address }
    }
}

pub struct InterruptDescriptorTable;

impl InterruptDescriptorTable {
    /// Current idtr of this core.
    #[inline(always)]
    pub fn current() -> DescriptorTablePointer {
        let mut r = DescriptorTablePointer::default();
        unsafe {
            asm!("sidt [{0}]", in(reg) &mut r, options(nostack));
        }
        r
    }

    /// # Safety
    /// Every vector that may fire afterwards must be routed by `table`.
    #[inline(always)]
    pub unsafe fn load(table: &DescriptorTablePointer) {
        asm!("lidt [{0}]", in(reg) table, options(nostack, readonly));
    }
}

pub struct GlobalDescriptorTable;

impl GlobalDescriptorTable {
    /// Current gdtr of this core.
    #[inline(always)]
    pub fn current() -> DescriptorTablePointer {
        let mut r = DescriptorTablePointer::default();
        unsafe {
            asm!("sgdt [{0}]", in(reg) &mut r, options(nostack));
        }
        r
    }
}
