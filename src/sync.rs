//! Stage synchronization between the controller and the restoring threads.
//!
//! All parties share a few u32 words (inside `TaskEntries`). The controller
//! advances `start` through the stages; every thread decrements
//! `nr_in_progress` when it finishes its part of a stage and then sleeps on
//! `start` until the next stage opens. A high bit on either word turns every
//! waiter into an error return so one failing thread tears the whole job
//! down instead of deadlocking it.

use crate::kernel::Kernel;
use crate::{Result, RestoreError};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const FUTEX_ABORT_FLAG: u32 = 0x8000_0000;

/// A shared u32 with futex wait/wake routed through the kernel handle.
#[derive(Default)]
pub struct Futex(AtomicU32);

impl Futex {
    pub fn new(v: u32) -> Futex {
        Futex(AtomicU32::new(v))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, v: u32) {
        self.0.store(v, Ordering::SeqCst);
    }

    pub fn set_and_wake(&self, kernel: &dyn Kernel, v: u32) {
        self.0.store(v, Ordering::SeqCst);
        kernel.futex_wake_all(&self.0);
    }

    pub fn dec_and_wake(&self, kernel: &dyn Kernel) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        kernel.futex_wake_all(&self.0);
    }

    pub fn abort_and_wake(&self, kernel: &dyn Kernel) {
        self.0.fetch_or(FUTEX_ABORT_FLAG, Ordering::SeqCst);
        kernel.futex_wake_all(&self.0);
    }

    pub fn aborted(&self) -> bool {
        self.get() & FUTEX_ABORT_FLAG != 0
    }

    /// Sleep until the value reaches `bound`. An abort flag set by any
    /// party surfaces as `RestoreError::Aborted`.
    pub fn wait_until(&self, kernel: &dyn Kernel, bound: u32) -> Result<()> {
        loop {
            let cur = self.get();
            if cur & FUTEX_ABORT_FLAG != 0 {
                return Err(RestoreError::Aborted);
            }
            if cur >= bound {
                return Ok(());
            }
            kernel.futex_wait(&self.0, cur)?;
        }
    }

    /// Sleep while the value stays above `bound` (controller side: wait for
    /// every thread to check in).
    pub fn wait_while_gt(&self, kernel: &dyn Kernel, bound: u32) -> Result<()> {
        loop {
            let cur = self.get();
            if cur & FUTEX_ABORT_FLAG != 0 {
                return Err(RestoreError::Aborted);
            }
            if cur <= bound {
                return Ok(());
            }
            kernel.futex_wait(&self.0, cur)?;
        }
    }
}

/// The stages `start` moves through, in order. A thread may not proceed
/// past a stage boundary until the controller opens the next one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Stage {
    /// Address space, timers, AIO; everything that does not touch signal
    /// routing or credentials.
    Restore = 1,
    /// SIGCHLD disposition handed back to the checkpointed handler.
    RestoreSigchld = 2,
    /// Credentials dropped; the final stage before sigreturn.
    RestoreCreds = 3,
}

/// Shared between the controller and every restoring thread of the job.
pub struct TaskEntries {
    pub nr_in_progress: Futex,
    pub nr_zombies: AtomicU32,
    pub start: Futex,
}

impl TaskEntries {
    pub fn new(nr_tasks: u32, nr_zombies: u32) -> TaskEntries {
        TaskEntries {
            nr_in_progress: Futex::new(nr_tasks),
            nr_zombies: AtomicU32::new(nr_zombies),
            start: Futex::new(0),
        }
    }

    /// Report this thread done with the current stage and sleep until the
    /// controller opens `stage`.
    pub fn finish_stage(&self, kernel: &dyn Kernel, stage: Stage) -> Result<()> {
        self.nr_in_progress.dec_and_wake(kernel);
        self.start.wait_until(kernel, stage as u32)
    }

    /// Poison both words so every current and future waiter errors out.
    pub fn abort(&self, kernel: &dyn Kernel) {
        self.nr_in_progress.abort_and_wake(kernel);
        self.start.abort_and_wake(kernel);
    }

    pub fn zombie_collected(&self) {
        self.nr_zombies.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Which children we planned for. Anything else dying mid-restore is fatal.
struct ChildLedger {
    helpers: Vec<Pid>,
    zombies: Vec<Pid>,
}

/// Consumer of child-death events. Production feeds it from a SIGCHLD
/// handler; tests feed it synthetic events.
pub struct DeathWatch {
    ledger: Mutex<ChildLedger>,
    entries: Arc<TaskEntries>,
}

impl DeathWatch {
    pub fn new(helpers: Vec<Pid>, zombies: Vec<Pid>, entries: Arc<TaskEntries>) -> DeathWatch {
        DeathWatch {
            ledger: Mutex::new(ChildLedger { helpers, zombies }),
            entries,
        }
    }

    /// Handle one child event. Returns true when the event is fatal; the
    /// caller must then take the process down without returning to the
    /// (possibly already torn down) user code.
    pub fn on_child_event(
        &self,
        kernel: &dyn Kernel,
        pid: Pid,
        si_code: i32,
        status: i32,
    ) -> bool {
        if si_code != libc::CLD_EXITED && si_code != libc::CLD_KILLED
            && si_code != libc::CLD_DUMPED
        {
            return false;
        }
        let mut ledger = match self.ledger.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if let Some(pos) = ledger.helpers.iter().position(|&h| h == pid) {
            if si_code == libc::CLD_EXITED && status == 0 {
                ledger.helpers.remove(pos);
                // Reap here; the orchestrator tolerates us getting there
                // first.
                let _ = kernel.wait_exited(pid);
                return false;
            }
        } else if ledger.zombies.contains(&pid) {
            // Expected death. Leave it unreaped so it stays a zombie for
            // the restored parent.
            self.entries.zombie_collected();
            return false;
        }
        self.entries.abort(kernel);
        true
    }
}
