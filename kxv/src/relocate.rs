//! Materialization of the trampoline code into the kx window.
//!
//! The interrupt-entry code addresses per-cpu variables through
//! `%gs:disp(%rip)` operands. Once copied into the kx window the code runs at
//! a different address, so each such operand is rewritten to the equivalent
//! `%gs:abs32` form, where `abs32` is the target the operand resolved to at
//! the link address.
use crate::KxError;

/// Instruction rewritten at a relocation site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rewrite {
    /// `mov %rsp, %gs:disp(%rip)`
    StoreRsp,
    /// `mov %gs:disp(%rip), %rsp`
    LoadRsp,
    /// `push %gs:disp(%rip)`
    Push,
}

impl Rewrite {
    /// Encoding up to the displacement, with rip-relative addressing.
    pub const fn rip_relative(self) -> &'static [u8] {
        match self {
            Self::StoreRsp => &[0x65, 0x48, 0x89, 0x25],
            Self::LoadRsp => &[0x65, 0x48, 0x8b, 0x25],
            Self::Push => &[0x65, 0xff, 0x35],
        }
    }

    /// Encoding up to the displacement, with absolute addressing (SIB, no
    /// base, no index).
    pub const fn absolute(self) -> &'static [u8] {
        match self {
            Self::StoreRsp => &[0x65, 0x48, 0x89, 0x24, 0x25],
            Self::LoadRsp => &[0x65, 0x48, 0x8b, 0x24, 0x25],
            Self::Push => &[0x65, 0xff, 0x34, 0x25],
        }
    }
}

/// A rip-relative operand of the interrupt-entry code.
///
/// The absolute form is one byte longer; the byte following the rip-relative
/// instruction is overwritten and must be padding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocation {
    /// Link address of the instruction.
    pub site: u64,
    pub rewrite: Rewrite,
}

/// Copy `code`, linked at `origin`, into `dst` and apply `relocations`.
///
/// Sites that already carry the absolute form are left alone.
pub fn materialize(
    code: &[u8],
    origin: u64,
    relocations: &[Relocation],
    dst: &mut [u8],
) -> Result<(), KxError> {
    if dst.len() < code.len() {
        return Err(KxError::InvalidImage("code does not fit its region"));
    }
    dst[..code.len()].copy_from_slice(code);

    for r in relocations {
        let offset = r
            .site
            .checked_sub(origin)
            .and_then(|o| usize::try_from(o).ok())
            .filter(|o| *o < code.len())
            .ok_or(KxError::InvalidImage("relocation site outside of the code"))?;
        let (rel, abs) = (r.rewrite.rip_relative(), r.rewrite.absolute());
        let insn = &code[offset..];

        if insn.starts_with(abs) {
            continue;
        }
        if !insn.starts_with(rel) || insn.len() < rel.len() + 4 {
            return Err(KxError::RelocationMismatch { offset });
        }
        if offset + abs.len() + 4 > code.len() {
            return Err(KxError::InvalidImage(
                "relocated instruction overruns the code",
            ));
        }

        let mut disp = [0; 4];
        disp.copy_from_slice(&insn[rel.len()..rel.len() + 4]);
        let next_ip = r.site + (rel.len() + 4) as u64;
        let target = next_ip.wrapping_add(i32::from_le_bytes(disp) as i64 as u64);
        let target = i32::try_from(target as i64).map_err(|_| {
            KxError::InvalidImage("relocation target is not a 32-bit offset")
        })?;

        let out = &mut dst[offset..offset + abs.len() + 4];
        out[..abs.len()].copy_from_slice(abs);
        out[abs.len()..].copy_from_slice(&target.to_le_bytes());
        log::debug!(
            "relocate: {:?} at +{:#x} -> %gs:{:#x}",
            r.rewrite,
            offset,
            target
        );
    }
    Ok(())
}
