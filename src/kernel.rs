//! The narrow capability boundary between the engine and the kernel: one
//! trait method per operation family the restore needs. `LinuxKernel`
//! implements it with direct syscalls (nix wrappers where they exist, raw
//! `libc::syscall` otherwise). Tests implement it with a recording fake so
//! ordering and failure propagation can be exercised deterministically.

use crate::arch::{self, Registers, TlsRecord};
use crate::restore_args::{ITimerSpec, ITimerVal, KTimeSpec, SavedSigaction, SigInfo, SockFilter};
use crate::sync::DeathWatch;
use nix::errno::Errno;
use nix::fcntl::{openat, FlockArg, OFlag};
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Pid, Uid, Whence};
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

pub type KernResult<T> = std::result::Result<T, Errno>;

/// Witness that a sigreturn was issued. The production implementation never
/// actually produces one (the call does not return); the fake hands them
/// out so tests can count successful trampoline entries.
#[derive(Debug)]
pub struct Resumed(pub(crate) ());

const PR_SET_PDEATHSIG: libc::c_int = 1;
const PR_GET_DUMPABLE: libc::c_int = 3;
const PR_SET_DUMPABLE: libc::c_int = 4;
const PR_SET_NAME: libc::c_int = 15;
const PR_SET_SECCOMP: libc::c_int = 22;
const PR_CAPBSET_DROP: libc::c_int = 24;
const PR_SET_SECUREBITS: libc::c_int = 28;
const PR_SET_MM: libc::c_int = 35;
const PR_SET_MM_EXE_FILE: libc::c_ulong = 13;

const SECCOMP_MODE_STRICT: libc::c_ulong = 1;
const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;
const SECCOMP_FILTER_FLAG_TSYNC: libc::c_ulong = 1;

const TCP_REPAIR: libc::c_int = 19;
/// _IOW('T', 0, u64)
const TFD_IOC_SET_TICKS: libc::c_ulong = 0x4008_5400;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

#[repr(C)]
struct SockFprog {
    len: libc::c_ushort,
    filter: *const SockFilter,
}

pub trait Kernel: Send + Sync {
    // Memory.
    fn mmap(
        &self,
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: RawFd,
        pgoff: u64,
    ) -> KernResult<usize>;
    fn munmap(&self, addr: usize, len: usize) -> KernResult<()>;
    /// mremap with MREMAP_MAYMOVE | MREMAP_FIXED; old and new length are the
    /// same. Rejected with EINVAL by the kernel when the ranges overlap.
    fn mremap_fixed(&self, src: usize, len: usize, dst: usize) -> KernResult<usize>;
    fn mprotect(&self, addr: usize, len: usize, prot: ProtFlags) -> KernResult<()>;
    fn madvise(&self, addr: usize, len: usize, advice: i32) -> KernResult<()>;
    fn shmat(&self, shmid: i32, addr: usize, shmflg: i32) -> KernResult<usize>;

    // Descriptors (all relative to the controller-supplied proc handle
    // where a path is involved).
    fn openat(&self, dir: RawFd, path: &str, oflag: OFlag) -> KernResult<RawFd>;
    fn close(&self, fd: RawFd) -> KernResult<()>;
    fn write(&self, fd: RawFd, buf: &[u8]) -> KernResult<usize>;
    fn rewind(&self, fd: RawFd) -> KernResult<()>;
    fn flock(&self, fd: RawFd, arg: FlockArg) -> KernResult<()>;

    // Identity.
    fn getpid(&self) -> Pid;
    fn gettid(&self) -> Pid;
    fn setresuid(&self, ruid: u32, euid: u32, suid: u32) -> KernResult<()>;
    /// Returns the previous fsuid; probing with u32::MAX changes nothing.
    fn setfsuid(&self, fsuid: u32) -> u32;
    fn setresgid(&self, rgid: u32, egid: u32, sgid: u32) -> KernResult<()>;
    fn setfsgid(&self, fsgid: u32) -> u32;
    fn set_securebits(&self, bits: u32) -> KernResult<()>;
    fn capbset_drop(&self, cap: u32) -> KernResult<()>;
    fn capset(&self, eff: [u32; 2], prm: [u32; 2], inh: [u32; 2]) -> KernResult<()>;

    // Task tuning.
    fn set_comm(&self, comm: &[u8; 16]) -> KernResult<()>;
    fn set_exe_file(&self, fd: RawFd) -> KernResult<()>;
    fn get_dumpable(&self) -> KernResult<u32>;
    fn set_dumpable(&self, v: u32) -> KernResult<()>;
    fn set_pdeath_sig(&self, sig: i32) -> KernResult<()>;

    // Signals.
    fn block_all_signals(&self) -> KernResult<()>;
    fn set_sigchld_action(&self, act: &SavedSigaction) -> KernResult<()>;
    /// Route child-death notifications into the watch. Production installs
    /// a SIGCHLD handler; the fake lets tests inject events directly.
    fn install_death_watch(&self, watch: Arc<DeathWatch>) -> KernResult<()>;
    fn queue_process_signal(&self, pid: Pid, info: &SigInfo) -> KernResult<()>;
    fn queue_thread_signal(&self, pid: Pid, tid: Pid, info: &SigInfo) -> KernResult<()>;

    // Threads.
    /// clone() sharing vm/files/sighand/thread-group/sysvsem, running
    /// `entry` on the given pre-carved stack. The kernel assigns the next
    /// pid after the value written to the last-pid file.
    fn clone_restore_thread(
        &self,
        stack_top: usize,
        entry: Box<dyn FnOnce() + Send>,
    ) -> KernResult<Pid>;
    fn set_tid_address(&self, addr: usize) -> KernResult<()>;
    fn set_robust_list(&self, head: usize, len: usize) -> KernResult<()>;
    fn set_tls(&self, tls: &TlsRecord) -> KernResult<()>;
    fn set_nice(&self, nice: i32) -> KernResult<()>;
    fn set_scheduler(&self, policy: i32, priority: i32) -> KernResult<()>;
    fn setrlimit(&self, resource: u32, cur: u64, max: u64) -> KernResult<()>;

    // Waiting.
    /// Blocking wait4; `None` when the child was already collected by the
    /// death-notification handler.
    fn wait_exited(&self, pid: Pid) -> KernResult<Option<i32>>;
    /// waitid with WNOWAIT | WEXITED, leaving the zombie inspectable.
    fn wait_zombie_nowait(&self, pid: Pid) -> KernResult<()>;
    fn exit_group(&self, code: i32) -> !;

    // Timers.
    fn timer_create(
        &self,
        clock_id: i32,
        sigev_notify: i32,
        signo: i32,
        sival_ptr: usize,
    ) -> KernResult<i32>;
    fn timer_delete(&self, id: i32) -> KernResult<()>;
    fn timer_settime(&self, id: i32, value: &ITimerSpec) -> KernResult<()>;
    fn timerfd_settime(&self, fd: RawFd, flags: i32, value: &ITimerSpec) -> KernResult<()>;
    fn timerfd_set_ticks(&self, fd: RawFd, ticks: u64) -> KernResult<()>;
    fn clock_gettime(&self, clock_id: i32) -> KernResult<KTimeSpec>;
    fn setitimer(&self, which: i32, value: &ITimerVal) -> KernResult<()>;

    // AIO.
    fn io_setup(&self, nr_events: u32) -> KernResult<usize>;
    /// Zero-timeout io_getevents probe; returns the number of ready events.
    fn io_events_ready(&self, ctx: usize) -> KernResult<usize>;

    // Sockets.
    fn tcp_repair_off(&self, sk: RawFd) -> KernResult<()>;
    fn set_reuseaddr(&self, sk: RawFd, on: bool) -> KernResult<()>;

    // Seccomp.
    fn seccomp_strict(&self) -> KernResult<()>;
    fn seccomp_filter_tsync(&self, prog: &[SockFilter]) -> KernResult<()>;

    // Futex, operating on words inside the shared TaskEntries.
    fn futex_wait(&self, word: &AtomicU32, expected: u32) -> KernResult<()>;
    fn futex_wake_all(&self, word: &AtomicU32);

    // Trampoline.
    fn write_sigframe(
        &self,
        frame_addr: usize,
        regs: &Registers,
        sigmask: u64,
    ) -> KernResult<()>;
    fn sigreturn(&self, new_sp: usize) -> KernResult<Resumed>;
}

/// The real thing. Stateless; every method is a thin syscall shim.
#[derive(Default)]
pub struct LinuxKernel;

fn rc_long(ret: libc::c_long) -> KernResult<libc::c_long> {
    if ret == -1 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

fn rc_int(ret: libc::c_int) -> KernResult<libc::c_int> {
    if ret == -1 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

fn ne(e: nix::Error) -> Errno {
    e.as_errno().unwrap_or(Errno::UnknownErrno)
}

lazy_static! {
    /// The SIGCHLD handler has no context argument, so the production death
    /// watch hangs off this. Job-local state otherwise lives in
    /// `RestoreContext`.
    static ref DEATH_WATCH: Mutex<Option<Arc<DeathWatch>>> = Mutex::new(None);
}

extern "C" fn sigchld_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let (pid, code, status) = unsafe { ((*info).si_pid(), (*info).si_code, (*info).si_status()) };
    let watch = match DEATH_WATCH.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    };
    if let Some(watch) = watch {
        if watch.on_child_event(&LinuxKernel, Pid::from_raw(pid), code, status) {
            // The checkpointed sa_restorer may already be unmapped, so we
            // must not return to userspace from here.
            unsafe {
                libc::kill(libc::getpid(), libc::SIGSTOP);
                libc::syscall(libc::SYS_exit_group, 1);
            }
        }
    }
}

extern "C" fn clone_thread_trampoline(arg: *mut libc::c_void) -> libc::c_int {
    let entry: Box<Box<dyn FnOnce() + Send>> =
        unsafe { Box::from_raw(arg as *mut Box<dyn FnOnce() + Send>) };
    entry();
    0
}

impl Kernel for LinuxKernel {
    fn mmap(
        &self,
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: RawFd,
        pgoff: u64,
    ) -> KernResult<usize> {
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                prot.bits(),
                flags.bits(),
                fd,
                pgoff as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            Err(Errno::last())
        } else {
            Ok(ret as usize)
        }
    }

    fn munmap(&self, addr: usize, len: usize) -> KernResult<()> {
        rc_int(unsafe { libc::munmap(addr as *mut libc::c_void, len) }).map(drop)
    }

    fn mremap_fixed(&self, src: usize, len: usize, dst: usize) -> KernResult<usize> {
        let ret = unsafe {
            libc::mremap(
                src as *mut libc::c_void,
                len,
                len,
                libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
                dst as *mut libc::c_void,
            )
        };
        if ret == libc::MAP_FAILED {
            Err(Errno::last())
        } else {
            Ok(ret as usize)
        }
    }

    fn mprotect(&self, addr: usize, len: usize, prot: ProtFlags) -> KernResult<()> {
        rc_int(unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot.bits()) }).map(drop)
    }

    fn madvise(&self, addr: usize, len: usize, advice: i32) -> KernResult<()> {
        rc_int(unsafe { libc::madvise(addr as *mut libc::c_void, len, advice) }).map(drop)
    }

    fn shmat(&self, shmid: i32, addr: usize, shmflg: i32) -> KernResult<usize> {
        let ret = unsafe { libc::shmat(shmid, addr as *const libc::c_void, shmflg) };
        if ret as isize == -1 {
            Err(Errno::last())
        } else {
            Ok(ret as usize)
        }
    }

    fn openat(&self, dir: RawFd, path: &str, oflag: OFlag) -> KernResult<RawFd> {
        openat(dir, path, oflag, Mode::empty()).map_err(ne)
    }

    fn close(&self, fd: RawFd) -> KernResult<()> {
        nix::unistd::close(fd).map_err(ne)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> KernResult<usize> {
        nix::unistd::write(fd, buf).map_err(ne)
    }

    fn rewind(&self, fd: RawFd) -> KernResult<()> {
        nix::unistd::lseek(fd, 0, Whence::SeekSet).map_err(ne).map(drop)
    }

    fn flock(&self, fd: RawFd, arg: FlockArg) -> KernResult<()> {
        nix::fcntl::flock(fd, arg).map_err(ne)
    }

    fn getpid(&self) -> Pid {
        nix::unistd::getpid()
    }

    fn gettid(&self) -> Pid {
        nix::unistd::gettid()
    }

    fn setresuid(&self, ruid: u32, euid: u32, suid: u32) -> KernResult<()> {
        nix::unistd::setresuid(
            Uid::from_raw(ruid),
            Uid::from_raw(euid),
            Uid::from_raw(suid),
        )
        .map_err(ne)
    }

    fn setfsuid(&self, fsuid: u32) -> u32 {
        unsafe { libc::setfsuid(fsuid as libc::uid_t) as u32 }
    }

    fn setresgid(&self, rgid: u32, egid: u32, sgid: u32) -> KernResult<()> {
        nix::unistd::setresgid(
            Gid::from_raw(rgid),
            Gid::from_raw(egid),
            Gid::from_raw(sgid),
        )
        .map_err(ne)
    }

    fn setfsgid(&self, fsgid: u32) -> u32 {
        unsafe { libc::setfsgid(fsgid as libc::gid_t) as u32 }
    }

    fn set_securebits(&self, bits: u32) -> KernResult<()> {
        rc_int(unsafe { libc::prctl(PR_SET_SECUREBITS, bits as libc::c_ulong, 0, 0, 0) })
            .map(drop)
    }

    fn capbset_drop(&self, cap: u32) -> KernResult<()> {
        rc_int(unsafe { libc::prctl(PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) }).map(drop)
    }

    fn capset(&self, eff: [u32; 2], prm: [u32; 2], inh: [u32; 2]) -> KernResult<()> {
        let hdr = CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let mut data = [CapUserData::default(); 2];
        for i in 0..2 {
            data[i].effective = eff[i];
            data[i].permitted = prm[i];
            data[i].inheritable = inh[i];
        }
        rc_long(unsafe { libc::syscall(libc::SYS_capset, &hdr, data.as_ptr()) }).map(drop)
    }

    fn set_comm(&self, comm: &[u8; 16]) -> KernResult<()> {
        rc_int(unsafe { libc::prctl(PR_SET_NAME, comm.as_ptr() as libc::c_ulong, 0, 0, 0) })
            .map(drop)
    }

    fn set_exe_file(&self, fd: RawFd) -> KernResult<()> {
        rc_int(unsafe {
            libc::prctl(PR_SET_MM, PR_SET_MM_EXE_FILE, fd as libc::c_ulong, 0, 0)
        })
        .map(drop)
    }

    fn get_dumpable(&self) -> KernResult<u32> {
        rc_int(unsafe { libc::prctl(PR_GET_DUMPABLE, 0, 0, 0, 0) }).map(|v| v as u32)
    }

    fn set_dumpable(&self, v: u32) -> KernResult<()> {
        rc_int(unsafe { libc::prctl(PR_SET_DUMPABLE, v as libc::c_ulong, 0, 0, 0) }).map(drop)
    }

    fn set_pdeath_sig(&self, sig: i32) -> KernResult<()> {
        rc_int(unsafe { libc::prctl(PR_SET_PDEATHSIG, sig as libc::c_ulong, 0, 0, 0) }).map(drop)
    }

    fn block_all_signals(&self) -> KernResult<()> {
        let mask: u64 = !0;
        rc_long(unsafe {
            libc::syscall(
                libc::SYS_rt_sigprocmask,
                libc::SIG_SETMASK,
                &mask,
                std::ptr::null_mut::<u64>(),
                std::mem::size_of::<u64>(),
            )
        })
        .map(drop)
    }

    fn set_sigchld_action(&self, act: &SavedSigaction) -> KernResult<()> {
        rc_long(unsafe {
            libc::syscall(
                libc::SYS_rt_sigaction,
                libc::SIGCHLD,
                act as *const SavedSigaction,
                std::ptr::null_mut::<SavedSigaction>(),
                std::mem::size_of::<u64>(),
            )
        })
        .map(drop)
    }

    fn install_death_watch(&self, watch: Arc<DeathWatch>) -> KernResult<()> {
        *DEATH_WATCH.lock().unwrap() = Some(watch);
        let action = SigAction::new(
            SigHandler::SigAction(sigchld_handler),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::all(),
        );
        unsafe { sigaction(Signal::SIGCHLD, &action) }
            .map_err(ne)
            .map(drop)
    }

    fn queue_process_signal(&self, pid: Pid, info: &SigInfo) -> KernResult<()> {
        rc_long(unsafe {
            libc::syscall(
                libc::SYS_rt_sigqueueinfo,
                pid.as_raw(),
                info.signo(),
                info.0.as_ptr(),
            )
        })
        .map(drop)
    }

    fn queue_thread_signal(&self, pid: Pid, tid: Pid, info: &SigInfo) -> KernResult<()> {
        rc_long(unsafe {
            libc::syscall(
                libc::SYS_rt_tgsigqueueinfo,
                pid.as_raw(),
                tid.as_raw(),
                info.signo(),
                info.0.as_ptr(),
            )
        })
        .map(drop)
    }

    fn clone_restore_thread(
        &self,
        stack_top: usize,
        entry: Box<dyn FnOnce() + Send>,
    ) -> KernResult<Pid> {
        let flags = libc::CLONE_VM
            | libc::CLONE_FILES
            | libc::CLONE_SIGHAND
            | libc::CLONE_THREAD
            | libc::CLONE_SYSVSEM;
        let arg = Box::into_raw(Box::new(entry));
        let ret = unsafe {
            libc::clone(
                clone_thread_trampoline,
                stack_top as *mut libc::c_void,
                flags,
                arg as *mut libc::c_void,
            )
        };
        if ret == -1 {
            // Reclaim the closure we leaked into the failed clone call.
            drop(unsafe { Box::from_raw(arg) });
            Err(Errno::last())
        } else {
            Ok(Pid::from_raw(ret))
        }
    }

    fn set_tid_address(&self, addr: usize) -> KernResult<()> {
        rc_long(unsafe { libc::syscall(libc::SYS_set_tid_address, addr) }).map(drop)
    }

    fn set_robust_list(&self, head: usize, len: usize) -> KernResult<()> {
        rc_long(unsafe { libc::syscall(libc::SYS_set_robust_list, head, len) }).map(drop)
    }

    #[cfg(target_arch = "x86_64")]
    fn set_tls(&self, tls: &TlsRecord) -> KernResult<()> {
        const ARCH_SET_GS: libc::c_ulong = 0x1001;
        const ARCH_SET_FS: libc::c_ulong = 0x1002;
        rc_long(unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_SET_FS, tls.fs_base) })?;
        rc_long(unsafe { libc::syscall(libc::SYS_arch_prctl, ARCH_SET_GS, tls.gs_base) })
            .map(drop)
    }

    #[cfg(target_arch = "aarch64")]
    fn set_tls(&self, tls: &TlsRecord) -> KernResult<()> {
        unsafe {
            core::arch::asm!("msr tpidr_el0, {v}", v = in(reg) tls.tpidr_el0);
        }
        Ok(())
    }

    fn set_nice(&self, nice: i32) -> KernResult<()> {
        rc_int(unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) }).map(drop)
    }

    fn set_scheduler(&self, policy: i32, priority: i32) -> KernResult<()> {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        rc_int(unsafe { libc::sched_setscheduler(0, policy, &param) }).map(drop)
    }

    fn setrlimit(&self, resource: u32, cur: u64, max: u64) -> KernResult<()> {
        let rl = libc::rlimit {
            rlim_cur: cur,
            rlim_max: max,
        };
        rc_long(unsafe { libc::syscall(libc::SYS_setrlimit, resource, &rl) }).map(drop)
    }

    fn wait_exited(&self, pid: Pid) -> KernResult<Option<i32>> {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, std::ptr::null_mut()) };
        if ret == -1 {
            // Already collected by the death-notification handler.
            Ok(None)
        } else {
            Ok(Some(status))
        }
    }

    fn wait_zombie_nowait(&self, pid: Pid) -> KernResult<()> {
        rc_long(unsafe {
            libc::syscall(
                libc::SYS_waitid,
                libc::P_PID,
                pid.as_raw(),
                std::ptr::null_mut::<libc::siginfo_t>(),
                libc::WNOWAIT | libc::WEXITED,
                std::ptr::null_mut::<libc::c_void>(),
            )
        })
        .map(drop)
    }

    fn exit_group(&self, code: i32) -> ! {
        unsafe {
            libc::syscall(libc::SYS_exit_group, code);
        }
        unreachable!();
    }

    fn timer_create(
        &self,
        clock_id: i32,
        sigev_notify: i32,
        signo: i32,
        sival_ptr: usize,
    ) -> KernResult<i32> {
        let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
        sev.sigev_notify = sigev_notify;
        sev.sigev_signo = signo;
        sev.sigev_value.sival_ptr = sival_ptr as *mut libc::c_void;
        let mut timer_id: libc::c_int = -1;
        rc_long(unsafe { libc::syscall(libc::SYS_timer_create, clock_id, &sev, &mut timer_id) })?;
        Ok(timer_id)
    }

    fn timer_delete(&self, id: i32) -> KernResult<()> {
        rc_long(unsafe { libc::syscall(libc::SYS_timer_delete, id) }).map(drop)
    }

    fn timer_settime(&self, id: i32, value: &ITimerSpec) -> KernResult<()> {
        rc_long(unsafe {
            libc::syscall(
                libc::SYS_timer_settime,
                id,
                0,
                value as *const ITimerSpec,
                std::ptr::null_mut::<ITimerSpec>(),
            )
        })
        .map(drop)
    }

    fn timerfd_settime(&self, fd: RawFd, flags: i32, value: &ITimerSpec) -> KernResult<()> {
        rc_long(unsafe {
            libc::syscall(
                libc::SYS_timerfd_settime,
                fd,
                flags,
                value as *const ITimerSpec,
                std::ptr::null_mut::<ITimerSpec>(),
            )
        })
        .map(drop)
    }

    fn timerfd_set_ticks(&self, fd: RawFd, ticks: u64) -> KernResult<()> {
        rc_int(unsafe { libc::ioctl(fd, TFD_IOC_SET_TICKS, &ticks) }).map(drop)
    }

    fn clock_gettime(&self, clock_id: i32) -> KernResult<KTimeSpec> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        rc_int(unsafe { libc::clock_gettime(clock_id, &mut ts) })?;
        Ok(KTimeSpec {
            sec: ts.tv_sec,
            nsec: ts.tv_nsec,
        })
    }

    fn setitimer(&self, which: i32, value: &ITimerVal) -> KernResult<()> {
        let itv = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: value.interval.sec,
                tv_usec: value.interval.usec,
            },
            it_value: libc::timeval {
                tv_sec: value.value.sec,
                tv_usec: value.value.usec,
            },
        };
        rc_int(unsafe { libc::setitimer(which, &itv, std::ptr::null_mut()) }).map(drop)
    }

    fn io_setup(&self, nr_events: u32) -> KernResult<usize> {
        let mut ctx: libc::c_ulong = 0;
        rc_long(unsafe { libc::syscall(libc::SYS_io_setup, nr_events, &mut ctx) })?;
        Ok(ctx as usize)
    }

    fn io_events_ready(&self, ctx: usize) -> KernResult<usize> {
        let ret = rc_long(unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                ctx,
                0usize,
                1usize,
                std::ptr::null_mut::<libc::c_void>(),
                std::ptr::null_mut::<libc::timespec>(),
            )
        })?;
        Ok(ret as usize)
    }

    fn tcp_repair_off(&self, sk: RawFd) -> KernResult<()> {
        let off: libc::c_int = 0;
        rc_int(unsafe {
            libc::setsockopt(
                sk,
                libc::SOL_TCP,
                TCP_REPAIR,
                &off as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })
        .map(drop)
    }

    fn set_reuseaddr(&self, sk: RawFd, on: bool) -> KernResult<()> {
        let val: libc::c_int = on as libc::c_int;
        rc_int(unsafe {
            libc::setsockopt(
                sk,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &val as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })
        .map(drop)
    }

    fn seccomp_strict(&self) -> KernResult<()> {
        rc_int(unsafe { libc::prctl(PR_SET_SECCOMP, SECCOMP_MODE_STRICT, 0, 0, 0) }).map(drop)
    }

    fn seccomp_filter_tsync(&self, prog: &[SockFilter]) -> KernResult<()> {
        let fprog = SockFprog {
            len: prog.len() as libc::c_ushort,
            filter: prog.as_ptr(),
        };
        rc_long(unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                SECCOMP_FILTER_FLAG_TSYNC,
                &fprog,
            )
        })
        .map(drop)
    }

    fn futex_wait(&self, word: &AtomicU32, expected: u32) -> KernResult<()> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32,
                libc::FUTEX_WAIT,
                expected,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if ret == -1 {
            match Errno::last() {
                // Value changed under us or we got a signal; the caller
                // re-reads the word and decides.
                Errno::EAGAIN | Errno::EINTR => Ok(()),
                e => Err(e),
            }
        } else {
            Ok(())
        }
    }

    fn futex_wake_all(&self, word: &AtomicU32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32,
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn write_sigframe(
        &self,
        frame_addr: usize,
        regs: &Registers,
        sigmask: u64,
    ) -> KernResult<()> {
        unsafe { arch::write_sigframe(frame_addr, regs, sigmask) };
        Ok(())
    }

    fn sigreturn(&self, new_sp: usize) -> KernResult<Resumed> {
        unsafe { arch::resume_with_registers(new_sp) }
    }
}
