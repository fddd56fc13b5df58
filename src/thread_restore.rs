//! Per-thread restoration. The leader runs `restore_thread_common` inline;
//! every other thread of the group runs `restore_thread_entry` as its clone
//! entry point and never returns from it.

use crate::arch::SIGFRAME_OFFSET;
use crate::creds::{restore_creds, restore_dumpable, restore_pdeath_sig};
use crate::kernel::{Kernel, Resumed};
use crate::log::LogLevel::*;
use crate::restore_args::{TaskRestoreArgs, ThreadArgs};
use crate::sync::{Futex, Stage};
use crate::{Result, RestoreError};
use nix::unistd::Pid;
use std::sync::Arc;

/// Everything a restoring thread needs a handle on. One per job, shared by
/// the leader and all cloned threads.
pub struct RestoreContext {
    pub args: Arc<TaskRestoreArgs>,
    pub kernel: Arc<dyn Kernel>,
    /// Counts threads that have not yet issued their sigreturn; the leader
    /// goes last.
    pub thread_inprogress: Futex,
}

impl RestoreContext {
    pub fn new(args: Arc<TaskRestoreArgs>, kernel: Arc<dyn Kernel>) -> RestoreContext {
        RestoreContext {
            args,
            kernel,
            thread_inprogress: Futex::new(1),
        }
    }
}

/// Thread state shared between the leader path and cloned threads:
/// exit-notification address, robust futex list, scheduling, TLS.
pub fn restore_thread_common(kernel: &dyn Kernel, t: &ThreadArgs) -> Result<()> {
    if t.clear_tid_addr != 0 {
        kernel.set_tid_address(t.clear_tid_addr)?;
    }
    if t.robust_list_len != 0 {
        kernel.set_robust_list(t.robust_list, t.robust_list_len)?;
    }
    kernel.set_scheduler(t.sched_policy, t.sched_prio)?;
    kernel.set_nice(t.nice)?;
    kernel.set_tls(&t.tls)?;
    Ok(())
}

/// Write the synthetic signal frame for `t` and issue the sigreturn that
/// reloads its register file.
pub fn resume(kernel: &dyn Kernel, t: &ThreadArgs) -> Result<Resumed> {
    kernel.write_sigframe(t.zone.rt_sigframe, &t.regs, t.sigmask)?;
    Ok(kernel.sigreturn(t.zone.rt_sigframe + SIGFRAME_OFFSET)?)
}

/// A cloned (non-leader) thread, from first instruction to sigreturn.
pub fn restore_thread(ctx: &RestoreContext, t: &ThreadArgs) -> Result<Resumed> {
    let kernel = &*ctx.kernel;
    let args = &*ctx.args;

    let tid = kernel.gettid().as_raw();
    if tid != t.tid {
        return Err(RestoreError::TidMismatch {
            want: t.tid,
            got: tid,
        });
    }
    kernel.block_all_signals()?;
    restore_thread_common(kernel, t)?;
    restore_creds(kernel, &args.creds, args.cap_last_cap, args.proc_fd, t.tid)?;
    restore_dumpable(kernel, args.dumpable)?;
    log!(LogInfo, "{}: thread restored", t.tid);
    args.entries.finish_stage(kernel, Stage::Restore)?;

    for si in &t.pending {
        kernel.queue_thread_signal(Pid::from_raw(args.pid), Pid::from_raw(t.tid), si)?;
    }
    args.entries.finish_stage(kernel, Stage::RestoreSigchld)?;

    restore_pdeath_sig(kernel, t.pdeath_sig)?;
    args.entries.finish_stage(kernel, Stage::RestoreCreds)?;

    ctx.thread_inprogress.dec_and_wake(kernel);
    resume(kernel, t)
}

/// Clone entry point. A failed thread poisons the job and exits the whole
/// thread group; there is no way to hand a broken thread back.
pub fn restore_thread_entry(ctx: Arc<RestoreContext>, t: ThreadArgs) {
    if let Err(err) = restore_thread(&ctx, &t) {
        log!(LogError, "thread {} failed: {}", t.tid, err);
        ctx.args.entries.abort(&*ctx.kernel);
        ctx.kernel.exit_group(1);
    }
}
