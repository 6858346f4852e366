//! Engine configuration.

/// Interrupt flag of the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PayloadInterrupts {
    /// Payload runs with interrupts masked, whatever its saved flags say.
    #[default]
    Masked,
    /// Payload runs with interrupts enabled.
    Enabled,
}

/// What to do with a general protection fault on an instruction that is not
/// virtualized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GpMismatch {
    /// Fail the entry with [`KxError::UnexpectedInstruction`].
    ///
    /// [`KxError::UnexpectedInstruction`]: crate::KxError::UnexpectedInstruction
    #[default]
    Abort,
    /// Return to the monitor with an unknown exit, leaving the guest at the
    /// faulting instruction.
    Unresolved,
}

/// Configuration of a [`Kx`](crate::Kx).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub payload_interrupts: PayloadInterrupts,
    pub gp_mismatch: GpMismatch,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            payload_interrupts: PayloadInterrupts::Masked,
            gp_mismatch: GpMismatch::Abort,
        }
    }

    pub const fn payload_interrupts(mut self, p: PayloadInterrupts) -> Self {
        self.payload_interrupts = p;
        self
    }

    pub const fn gp_mismatch(mut self, p: GpMismatch) -> Self {
        self.gp_mismatch = p;
        self
    }
}
