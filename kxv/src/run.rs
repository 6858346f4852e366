//! Exit record shared with the userspace monitor.
//!
//! The monitor maps two pages of each kontext: the [`KxRun`] record and a
//! data page located `data_offset` bytes after it.
use crate::{
    platform::{Pages, Platform},
    KxError,
};
use kxarch::PAGE_SIZE;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Pages shared with the monitor.
pub const RUN_AREA_PAGES: usize = 2;

/// Why the engine returned to the monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ExitReason {
    Unknown = 0,
    Io = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum IoDirection {
    In = 0,
    Out = 1,
}

/// Port I/O exit.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoExit {
    pub direction: u8,
    /// Operand size in bytes.
    pub size: u8,
    pub port: u16,
    /// Number of operands.
    pub count: u32,
    /// Offset of the data from the start of the record.
    pub data_offset: u64,
}

/// The exit record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KxRun {
    pub exit_reason: u32,
    _pad: u32,
    pub io: IoExit,
}

impl KxRun {
    /// Decoded exit reason.
    pub fn reason(&self) -> Option<ExitReason> {
        ExitReason::try_from(self.exit_reason).ok()
    }

    pub fn set_reason(&mut self, reason: ExitReason) {
        self.exit_reason = reason.into();
    }

    /// Record an `out` of `count` operands of `size` bytes to `port`. The
    /// data is staged at the start of the data page.
    pub fn set_io_out(&mut self, port: u16, size: u8, count: u32) {
        self.set_reason(ExitReason::Io);
        self.io = IoExit {
            direction: IoDirection::Out.into(),
            size,
            port,
            count,
            data_offset: PAGE_SIZE as u64,
        };
    }
}

/// Exit record and data page of a kontext.
pub struct RunArea {
    pages: Pages,
}

impl RunArea {
    pub fn new(platform: &'static dyn Platform) -> Result<Self, KxError> {
        Ok(Self {
            pages: Pages::new(platform, RUN_AREA_PAGES)?,
        })
    }

    /// Backing pages, for mapping into the monitor.
    pub fn pages(&self) -> &Pages {
        &self.pages
    }

    /// # Safety
    /// The caller must be the only one touching the record.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn split_mut(&self) -> (&mut KxRun, &mut [u8]) {
        let base = self.pages.as_mut_ptr::<u8>();
        (
            &mut *(base as *mut KxRun),
            core::slice::from_raw_parts_mut(base.add(PAGE_SIZE), PAGE_SIZE),
        )
    }

    /// Copy of the record.
    pub fn record(&self) -> KxRun {
        unsafe { (self.pages.as_mut_ptr::<KxRun>()).read() }
    }

    /// Copy of the first `N` bytes of the data page.
    pub fn data<const N: usize>(&self) -> [u8; N] {
        let mut out = [0; N];
        unsafe {
            let data = self.pages.as_mut_ptr::<u8>().add(PAGE_SIZE);
            core::ptr::copy_nonoverlapping(data, out.as_mut_ptr(), N.min(PAGE_SIZE));
        }
        out
    }
}
