//! Per-architecture knowledge: the saved register file, the TLS record, the
//! kernel's rt_sigframe layout, and the one explicitly-unsafe primitive that
//! loads a full register file and never returns. Nothing outside this module
//! knows what a sigframe looks like.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;
