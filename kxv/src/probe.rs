//! Access to guest memory from the emulators.
use crate::{
    addressing::{Gva, Hva},
    kontext::Kontext,
    platform::Platform,
    KxError,
};

/// Traits to probe guest memory.
pub trait Probe {
    /// Translate guest virtual address to host virtual address.
    fn gva2hva(&self, gva: Gva) -> Result<Hva, KxError>;
    /// Read `buf.len()` bytes at `hva`.
    fn read(&self, hva: Hva, buf: &mut [u8]) -> Result<(), KxError>;
    /// Write `buf` at `hva`.
    fn write(&self, hva: Hva, buf: &[u8]) -> Result<(), KxError>;
}

/// [`Probe`] of a kontext, through the monitor's memory.
pub struct KontextProbe<'a> {
    kontext: &'a Kontext,
    platform: &'a dyn Platform,
}

impl<'a> KontextProbe<'a> {
    pub fn new(kontext: &'a Kontext, platform: &'a dyn Platform) -> Self {
        Self { kontext, platform }
    }
}

impl Probe for KontextProbe<'_> {
    #[inline]
    fn gva2hva(&self, gva: Gva) -> Result<Hva, KxError> {
        self.kontext.translate(gva)
    }

    #[inline]
    fn read(&self, hva: Hva, buf: &mut [u8]) -> Result<(), KxError> {
        self.platform.copy_from_user(buf, hva)
    }

    #[inline]
    fn write(&self, hva: Hva, buf: &[u8]) -> Result<(), KxError> {
        self.platform.copy_to_user(hva, buf)
    }
}
