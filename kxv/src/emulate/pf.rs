//! Page fault: let the host fault the page in.
//!
//! A user mode fault of the payload is usually a page the monitor has not
//! touched yet. Touching the translated address from the host, the same way
//! the payload did, makes the host kernel resolve it; the payload then
//! retries the access.
use super::{FaultController, TrapState};
use crate::{addressing::Gva, engine::FaultOutcome, probe::Probe, KxError};
use kxarch::x86_64::interrupt::{ExceptionVector, PFErrorCode};

#[derive(Clone, Copy, Debug, Default)]
pub struct PageFault;

impl FaultController for PageFault {
    fn handle<P: Probe>(
        &self,
        vector: u64,
        p: &P,
        state: &mut TrapState<'_>,
    ) -> Result<FaultOutcome, KxError> {
        if ExceptionVector::new(vector) != Some(ExceptionVector::PageFault) {
            return Err(KxError::UnsupportedTrap(vector));
        }

        let cr2 = Gva::new(state.area.state.sregs.cr2);
        let hva = p.gva2hva(cr2)?;
        let error = PFErrorCode::from_bits_truncate(state.area.trap_info.error);
        if !error.contains(PFErrorCode::USER) {
            log::debug!("pf: supervisor fault at {} ({:?})", cr2, error);
            return Ok(FaultOutcome::Done);
        }

        let untouchable = |e: KxError| {
            log::warn!("pf: cannot touch {} at {}: {}", cr2, hva, e);
            KxError::BadAddress(cr2)
        };
        let byte = &mut state.area.state.instruction_decode[..1];
        p.read(hva, byte).map_err(untouchable)?;
        if error.contains(PFErrorCode::WRITE_ACCESS) {
            p.write(hva, byte).map_err(untouchable)?;
        }
        Ok(FaultOutcome::Resume)
    }
}
