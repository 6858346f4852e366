//! General protection fault: port output from the payload.
//!
//! The payload runs with IOPL 0, so `out dx, eax` raises #GP. The access is
//! turned into an I/O exit for the monitor and the guest is moved past the
//! instruction.
use super::{FaultController, TrapState};
use crate::{addressing::Gva, config::GpMismatch, engine::FaultOutcome, probe::Probe, KxError};
use iced_x86::{Code, Decoder, DecoderOptions};
use kxarch::x86_64::interrupt::ExceptionVector;

/// `out dx, eax`
pub const OUT_DX_EAX: u8 = 0xef;

#[derive(Clone, Copy, Debug, Default)]
pub struct GeneralProtection {
    mismatch: GpMismatch,
}

impl GeneralProtection {
    pub const fn new(mismatch: GpMismatch) -> Self {
        Self { mismatch }
    }
}

impl FaultController for GeneralProtection {
    fn handle<P: Probe>(
        &self,
        vector: u64,
        p: &P,
        state: &mut TrapState<'_>,
    ) -> Result<FaultOutcome, KxError> {
        if ExceptionVector::new(vector) != Some(ExceptionVector::GeneralProtection) {
            return Err(KxError::UnsupportedTrap(vector));
        }

        let rip = Gva::new(state.area.state.regs.rip);
        let hva = p.gva2hva(rip)?;
        let decode = &mut state.area.state.instruction_decode;
        p.read(hva, &mut decode[..1]).map_err(|e| {
            log::warn!(
                "gp: cannot fetch the instruction at {} ({}): {}",
                rip,
                hva,
                e
            );
            KxError::BadAddress(rip)
        })?;

        let insn = Decoder::with_ip(64, &decode[..1], rip.as_u64(), DecoderOptions::NONE).decode();
        match insn.code() {
            Code::Out_DX_EAX => {
                let regs = &mut state.area.state.regs;
                state.run.set_io_out(regs.rdx as u16, 4, 1);
                state.data[..4].copy_from_slice(&(regs.rax as u32).to_le_bytes());
                regs.rip += insn.len() as u64;
                Ok(FaultOutcome::Done)
            }
            _ => {
                let opcode = decode[0];
                log::warn!("gp: unexpected opcode {:#04x} at {}", opcode, rip);
                match self.mismatch {
                    GpMismatch::Abort => Err(KxError::UnexpectedInstruction { rip, opcode }),
                    GpMismatch::Unresolved => Ok(FaultOutcome::Done),
                }
            }
        }
    }
}
