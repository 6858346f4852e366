//! Emulation of the traps taken by a guest.
//!
//! Each emulator is a [`FaultController`]. Controllers are chained as
//! tuples: `(A, B)` gives the trap to `A` and falls through to `B` when `A`
//! does not handle the vector. `()` ends the chain.
pub mod gp;
pub mod pf;

use crate::{engine::FaultOutcome, guest_area::GuestArea, probe::Probe, run::KxRun, KxError};

/// State an emulator may inspect and update.
pub struct TrapState<'a> {
    pub area: &'a mut GuestArea,
    pub run: &'a mut KxRun,
    /// Data page shared with the monitor.
    pub data: &'a mut [u8],
}

/// Controller that defines action on a trap.
pub trait FaultController {
    /// Handle the trap on this controller.
    ///
    /// Returns [`KxError::UnsupportedTrap`] when this controller does not
    /// handle `vector`.
    fn handle<P: Probe>(
        &self,
        vector: u64,
        p: &P,
        state: &mut TrapState<'_>,
    ) -> Result<FaultOutcome, KxError>;
}

impl FaultController for () {
    fn handle<P: Probe>(
        &self,
        vector: u64,
        _p: &P,
        _state: &mut TrapState<'_>,
    ) -> Result<FaultOutcome, KxError> {
        Err(KxError::UnsupportedTrap(vector))
    }
}

impl<A: FaultController, B: FaultController> FaultController for (A, B) {
    fn handle<P: Probe>(
        &self,
        vector: u64,
        p: &P,
        state: &mut TrapState<'_>,
    ) -> Result<FaultOutcome, KxError> {
        let (a, b) = self;
        match a.handle(vector, p, state) {
            Err(KxError::UnsupportedTrap(vector)) => b.handle(vector, p, state),
            r => r,
        }
    }
}
