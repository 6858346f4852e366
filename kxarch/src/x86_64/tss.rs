//! Task-state segment

use super::table::GlobalDescriptorTable;
use core::arch::asm;

#[repr(C, packed)]
pub struct TaskStateSegment {
    _res0: u32,
    pub rsp0: u64,
    pub rsp1: u64,
    pub rsp2: u64,
    _res1: u64,
    pub ist: [u64; 7],
    _res2: u64,
    _res3: u16,
    pub io_map_base: u16,
}

impl TaskStateSegment {
    /// The privileged stack pointers (rsp0, rsp1, rsp2).
    #[inline]
    pub fn stacks(&self) -> [u64; 3] {
        [self.rsp0, self.rsp1, self.rsp2]
    }

    #[inline]
    pub fn set_stacks(&mut self, stacks: [u64; 3]) {
        self.rsp0 = stacks[0];
        self.rsp1 = stacks[1];
        self.rsp2 = stacks[2];
    }

    /// Task state segment of this core, located through the task register.
    ///
    /// # Safety
    /// The GDT entry selected by the task register must describe a mapped,
    /// writable TSS.
    pub unsafe fn current() -> &'static mut TaskStateSegment {
        let tr: u16;
        asm!("str {:x}", out(reg) tr, options(nostack, nomem));
        let gdt = GlobalDescriptorTable::current();
        let entry = (gdt.address as usize + (tr as usize & !7)) as *const [u32; 4];
        &mut *(system_descriptor_base(entry.read()) as *mut TaskStateSegment)
    }
}

/// Base address encoded in a 16-byte system segment descriptor.
pub const fn system_descriptor_base(d: [u32; 4]) -> u64 {
    let base_15_0 = (d[0] >> 16) as u64;
    let base_23_16 = (d[1] & 0xff) as u64;
    let base_31_24 = (d[1] >> 24) as u64;
    let base_63_32 = d[2] as u64;
    base_15_0 | base_23_16 << 16 | base_31_24 << 24 | base_63_32 << 32
}
