//! revive -- the in-process restoration engine.
//!
//! This crate runs *as* the process being restored: the controller has
//! already replaced the task's image with us, pre-carved the argument and
//! per-thread memory zones, and filled in a [`restore_args::TaskRestoreArgs`]
//! record. From that point we rebuild the address space, recreate secondary
//! threads, replay credentials, timers, AIO rings and socket state, and
//! finally jump back to the checkpointed register file via the kernel's
//! sigreturn facility. Control never returns here on success.
//!
//! Every kernel interaction goes through the [`kernel::Kernel`] capability
//! trait. [`kernel::LinuxKernel`] issues the real syscalls; tests drive the
//! same code against a recording fake so the ordering and abort paths can be
//! exercised without privileges (and without a process to destroy).

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;
#[macro_use]
extern crate memoffset;

#[macro_use]
pub mod log;

pub mod address_space;
pub mod aio;
pub mod arch;
pub mod creds;
pub mod error;
pub mod kernel;
pub mod memory_range;
pub mod restore_args;
pub mod sync;
pub mod task_restore;
pub mod thread_restore;
pub mod timers;

#[cfg(test)]
pub(crate) mod fake_kernel;

pub use crate::error::{RestoreError, Result};

/// The engine assumes 4K pages throughout; the controller refuses to
/// checkpoint on kernels configured otherwise.
pub const PAGE_SIZE: usize = 4096;
