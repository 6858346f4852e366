//! Software virtualization engine for cores without (or not using) hardware
//! virtualization extensions.
//!
//! A physical core is multiplexed between three execution domains:
//!
//! - the *host kernel*, where this crate normally runs,
//! - the *guest kernel*, a thin privileged shim running on the guest's own
//!   address space root,
//! - the *guest payload*, the unprivileged guest code.
//!
//! ```text
//!  HOST_KERNEL --enter_guest--> GUEST_KERNEL --enter_payload--> GUEST_PAYLOAD
//!       ^                                                            |
//!       +----------------- return_to_host (trap) <-------------------+
//! ```
//!
//! Every exception raised while a guest domain is active lands, through the
//! system-wide [`redirect::RedirectTable`], in [`Kx::return_to_host`]. Once the
//! host state is back in place, the trap is handed to the fault
//! [`dispatch`](Kx::dispatch)er whose emulators ([`emulate`]) either resume the
//! guest payload or report an exit to the userspace monitor through the
//! shared [`run::KxRun`] record.
//!
//! ## Collaborators
//! Page allocation, the per-core "kx" window, user memory accessors and the
//! assembly trampolines that literally load registers and `iretq` belong to
//! the embedding kernel. They are reached through the traits of
//! [`platform`]. [`platform::NativeCpu`] implements the privileged CPU
//! operations on real hardware.
//!
//! ## Usage
//! ```ignore
//! let kx = Kx::new(platform, Config::new())?.register()?;
//! let kontainer = Arc::new(Kontainer::new(platform)?);
//! kontainer.set_memory_region(0, monitor_base, size)?;
//! let kontext = Kontext::new(platform, kontainer)?;
//! loop {
//!     match kx.enter_guest(&kontext) {
//!         Ok(_) => handle_exit(kontext.run()),
//!         Err(e) => return e.errno(),
//!     }
//! }
//! ```
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addressing;
pub mod config;
pub mod emulate;
pub mod engine;
pub mod guest_area;
pub mod kontainer;
pub mod kontext;
pub mod platform;
pub mod probe;
pub mod redirect;
pub mod relocate;
pub mod run;
pub mod translate;

#[cfg(test)]
pub(crate) mod mock;

pub use config::Config;
pub use engine::{FaultOutcome, Kx};
pub use kontainer::Kontainer;
pub use kontext::Kontext;

use addressing::{Gva, Hva};

/// Maximum number of cores a guest may run on.
pub const MAX_CPU: usize = 64;

/// Possible errors of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KxError {
    /// A page allocation failed.
    OutOfMemory,
    /// The trampoline image does not fit the installed code region.
    InvalidImage(&'static str),
    /// Relocation site does not hold the instruction it expects.
    RelocationMismatch {
        /// Offset of the site inside the interrupt-entry code.
        offset: usize,
    },
    /// Guest address has no host backing, or probing it failed.
    BadAddress(Gva),
    /// Host-visible address could not be accessed.
    BadHostAddress(Hva),
    /// No emulator handles this vector.
    UnsupportedTrap(u64),
    /// A guest area redzone was overwritten.
    RedzoneCorrupted,
    /// The instruction at the faulting address is not the one the emulator
    /// virtualizes.
    UnexpectedInstruction {
        /// Faulting instruction pointer.
        rip: Gva,
        /// First byte at `rip`.
        opcode: u8,
    },
    /// The kontext is active on another core.
    KontextBusy,
    /// No kontext is active on this core.
    NoCurrentKontext,
    /// Core id is out of the supported range.
    CpuOutOfRange(usize),
    /// Memory slot index is out of range.
    InvalidSlot(usize),
    /// The engine is already registered.
    AlreadyInstalled,
}

impl KxError {
    /// Negative status reported to the userspace monitor.
    pub const fn errno(&self) -> i32 {
        const EIO: i32 = 5;
        const ENOMEM: i32 = 12;
        const EFAULT: i32 = 14;
        const EBUSY: i32 = 16;
        const EEXIST: i32 = 17;
        const EINVAL: i32 = 22;
        const EOPNOTSUPP: i32 = 95;
        -match self {
            Self::OutOfMemory => ENOMEM,
            Self::InvalidImage(_) | Self::RelocationMismatch { .. } => EINVAL,
            Self::BadAddress(_) | Self::BadHostAddress(_) => EFAULT,
            Self::UnsupportedTrap(_) | Self::UnexpectedInstruction { .. } => EOPNOTSUPP,
            Self::RedzoneCorrupted | Self::NoCurrentKontext => EIO,
            Self::KontextBusy => EBUSY,
            Self::CpuOutOfRange(_) | Self::InvalidSlot(_) => EINVAL,
            Self::AlreadyInstalled => EEXIST,
        }
    }
}

impl core::fmt::Display for KxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidImage(why) => write!(f, "invalid trampoline image: {}", why),
            Self::RelocationMismatch { offset } => {
                write!(
                    f,
                    "unexpected instruction at relocation site +{:#x}",
                    offset
                )
            }
            Self::BadAddress(gva) => write!(f, "no host mapping for {}", gva),
            Self::BadHostAddress(hva) => write!(f, "cannot access {}", hva),
            Self::UnsupportedTrap(v) => write!(f, "unsupported trap vector {:#x}", v),
            Self::RedzoneCorrupted => write!(f, "guest area redzone corrupted"),
            Self::UnexpectedInstruction { rip, opcode } => {
                write!(f, "unexpected opcode {:#04x} at {}", opcode, rip)
            }
            Self::KontextBusy => write!(f, "kontext is active on another core"),
            Self::NoCurrentKontext => write!(f, "no kontext is active on this core"),
            Self::CpuOutOfRange(cpu) => write!(f, "cpu {} is out of range", cpu),
            Self::InvalidSlot(slot) => write!(f, "invalid memory slot {}", slot),
            Self::AlreadyInstalled => write!(f, "engine already registered"),
        }
    }
}
