//! Architectural primitives for the kx software virtualization engine.
//!
//! This crate holds the bits of x86_64 that the engine has to touch directly:
//! flag and control registers, model specific registers, segment selectors,
//! the interrupt gate and descriptor-table-register layouts, the task state
//! segment, and the handful of privileged intrinsics used to save and restore
//! a core's state around a domain switch.
//!
//! Nothing here owns any state. Higher layers decide *when* an instruction is
//! executed; this crate only knows *how*.
#![cfg_attr(not(test), no_std)]

pub mod x86_64;

/// Size of a page.
pub const PAGE_SIZE: usize = 0x1000;
