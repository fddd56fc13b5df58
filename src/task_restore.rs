//! The leader's end-to-end restore sequence and the clone protocol that
//! brings the rest of the thread group back with their original tids.

use crate::address_space::{
    map_fresh_regions, replay_advice, replay_protections, shift_premapped_regions,
    unmap_foreign_regions,
};
use crate::aio::restore_aio_rings;
use crate::creds::{install_seccomp, restore_creds, restore_dumpable, restore_pdeath_sig};
use crate::kernel::{Kernel, Resumed};
use crate::log;
use crate::log::LogLevel::*;
use crate::restore_args::TaskRestoreArgs;
use crate::sync::{DeathWatch, Stage};
use crate::thread_restore::{restore_thread_common, restore_thread_entry, resume, RestoreContext};
use crate::timers::{arm_itimers, arm_posix_timers, arm_timerfds, create_posix_timers};
use crate::{Result, RestoreError};
use nix::fcntl::{FlockArg, OFlag};
use nix::unistd::Pid;
use std::sync::Arc;

const LAST_PID_PATH: &str = "sys/kernel/ns_last_pid";

/// Spawn every non-leader thread with its original tid. The kernel hands
/// out pids sequentially from the last-pid file, so each clone is preceded
/// by writing `tid - 1` there, under an exclusive lock held across the
/// whole loop so no other task in the pid namespace can race the counter.
fn clone_threads(ctx: &Arc<RestoreContext>) -> Result<()> {
    let args = &*ctx.args;
    let kernel = &*ctx.kernel;
    if args.threads.len() == 1 {
        return Ok(());
    }
    let fd = kernel.openat(args.proc_fd, LAST_PID_PATH, OFlag::O_RDWR)?;
    kernel.flock(fd, FlockArg::LockExclusive)?;
    let mut ret = Ok(());
    for t in args.threads.iter().filter(|t| t.tid != args.pid) {
        kernel.rewind(fd)?;
        kernel.write(fd, format!("{}", t.tid - 1).as_bytes())?;
        let thread_ctx = Arc::clone(ctx);
        let thread_args = t.clone();
        let tid = kernel.clone_restore_thread(
            t.zone.stack_top,
            Box::new(move || restore_thread_entry(thread_ctx, thread_args)),
        )?;
        log!(LogDebug, "cloned thread {} (wanted {})", tid, t.tid);
        if tid.as_raw() != t.tid {
            ret = Err(RestoreError::TidMismatch {
                want: t.tid,
                got: tid.as_raw(),
            });
            break;
        }
    }
    kernel.flock(fd, FlockArg::Unlock)?;
    kernel.close(fd)?;
    ret
}

/// Block until every recorded zombie child has died, without reaping it:
/// the restored process must still be able to wait on them itself.
fn wait_zombies(kernel: &dyn Kernel, args: &TaskRestoreArgs) -> Result<()> {
    for &pid in &args.zombies {
        kernel.wait_zombie_nowait(Pid::from_raw(pid))?;
        log!(LogDebug, "zombie {} in place", pid);
    }
    Ok(())
}

/// Reap the controller's helper children. The death watch may have gotten
/// to one first; only a helper that reports failure is a problem.
fn wait_helpers(kernel: &dyn Kernel, args: &TaskRestoreArgs) -> Result<()> {
    for &pid in &args.helpers {
        match kernel.wait_exited(Pid::from_raw(pid))? {
            None => (),
            Some(status) => {
                if !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 {
                    return Err(RestoreError::HelperFailed { pid, status });
                }
            }
        }
    }
    Ok(())
}

/// The whole leader sequence. Returns only in tests (through the fake's
/// sigreturn); under a real kernel the final call does not come back.
pub fn run_restore(ctx: &Arc<RestoreContext>) -> Result<Resumed> {
    let args = Arc::clone(&ctx.args);
    let kernel = &*ctx.kernel;

    log::set_fd(args.log_fd);
    log::set_level(args.log_level);
    log!(LogInfo, "{}: task restore begins", args.pid);

    let watch = Arc::new(DeathWatch::new(
        args.helpers.iter().map(|&p| Pid::from_raw(p)).collect(),
        args.zombies.iter().map(|&p| Pid::from_raw(p)).collect(),
        Arc::clone(&args.entries),
    ));
    kernel.install_death_watch(watch)?;

    unmap_foreign_regions(kernel, args.bootstrap, args.premapped, args.task_size)?;
    shift_premapped_regions(kernel, &args.vmas, args.task_size)?;
    map_fresh_regions(kernel, &args.vmas)?;
    replay_protections(kernel, &args.vmas)?;
    replay_advice(kernel, &args.vmas)?;
    restore_aio_rings(kernel, &args.aio_rings)?;

    kernel.set_comm(&args.comm)?;
    if args.exe_fd != -1 {
        let linked = kernel.set_exe_file(args.exe_fd);
        kernel.close(args.exe_fd)?;
        linked?;
    }

    let leader = args.leader().clone();
    restore_thread_common(kernel, &leader)?;
    clone_threads(ctx)?;

    for rl in &args.rlimits {
        kernel.setrlimit(rl.resource, rl.cur, rl.max)?;
    }
    create_posix_timers(kernel, &args.posix_timers)?;
    arm_timerfds(kernel, &args.timerfds)?;

    log!(LogInfo, "{}: restored", args.pid);
    args.entries.finish_stage(kernel, Stage::Restore)?;

    wait_zombies(kernel, &args)?;
    wait_helpers(kernel, &args)?;

    kernel.block_all_signals()?;
    kernel.set_sigchld_action(&args.sigchld_act)?;
    let pid = Pid::from_raw(args.pid);
    for si in &args.process_pending {
        kernel.queue_process_signal(pid, si)?;
    }
    for si in &leader.pending {
        kernel.queue_thread_signal(pid, Pid::from_raw(leader.tid), si)?;
    }
    args.entries.finish_stage(kernel, Stage::RestoreSigchld)?;

    // Repair mode and the last-pid writes both needed capabilities the
    // creds drop may take away, so sockets come first.
    for s in &args.tcp_socks {
        kernel.tcp_repair_off(s.sk)?;
        kernel.set_reuseaddr(s.sk, s.reuseaddr)?;
    }
    restore_creds(kernel, &args.creds, args.cap_last_cap, args.proc_fd, leader.tid)?;
    restore_dumpable(kernel, args.dumpable)?;
    restore_pdeath_sig(kernel, leader.pdeath_sig)?;

    ctx.thread_inprogress
        .set_and_wake(kernel, args.threads.len() as u32);
    args.entries.finish_stage(kernel, Stage::RestoreCreds)?;
    // Every other thread sigreturns before the leader tears down the
    // remaining engine state they still share.
    ctx.thread_inprogress.wait_while_gt(kernel, 1)?;

    kernel.close(args.proc_fd)?;
    log!(LogInfo, "{}: resuming", args.pid);
    log::close();

    arm_itimers(kernel, &args.itimers)?;
    arm_posix_timers(kernel, &args.posix_timers)?;
    if install_seccomp(kernel, args.seccomp_mode, &args.seccomp_filters).is_err() {
        // A half-installed sandbox must not be allowed to run anything.
        kernel.exit_group(1);
    }
    kernel.munmap(args.rst_mem.start(), args.rst_mem.size())?;
    resume(kernel, &leader)
}

/// Production entry point: restore and resume, or die. Nothing below this
/// frame survives a success, so there is no success path to return on.
pub fn restore_task(kernel: Arc<dyn Kernel>, args: TaskRestoreArgs) -> ! {
    let ctx = Arc::new(RestoreContext::new(Arc::new(args), Arc::clone(&kernel)));
    match run_restore(&ctx) {
        // A real sigreturn does not come back; if it did, something is
        // deeply wrong with the frame we built.
        Ok(_) => fatal!("leader returned from sigreturn"),
        Err(err) => {
            log!(LogError, "restore failed: {}", err);
            ctx.args.entries.abort(&*kernel);
            kernel.exit_group(1)
        }
    }
}
