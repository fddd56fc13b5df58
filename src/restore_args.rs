//! The argument contract between the controller and this engine. The
//! controller validates and resolves everything before handing the record
//! over; nothing in here is re-checked beyond debug assertions.

use crate::arch::{Registers, TlsRecord};
use crate::memory_range::MemoryRange;
use crate::sync::TaskEntries;
use nix::sys::mman::{MapFlags, ProtFlags};
use std::os::unix::io::RawFd;
use std::sync::Arc;

bitflags! {
    /// What kind of area a region descriptor talks about.
    pub struct VmaStatus: u32 {
        /// A regular area we are responsible for mapping.
        const REGULAR = 1 << 0;
        /// System-V shared memory segment; `fd` holds the shm id.
        const SYSVIPC = 1 << 1;
        /// Anonymous shared area restored through a map_files descriptor.
        const ANON_SHARED = 1 << 2;
        /// Private area that the controller premapped at a scratch address;
        /// it must be shifted into place with mremap, never mapped fresh.
        const PREMAPPED = 1 << 3;
    }
}

/// One recorded memory region. Final layout is the half-open
/// `[start, end)`; premapped regions additionally carry the scratch address
/// their live pages currently sit at.
#[derive(Clone, Debug)]
pub struct VmaDescriptor {
    pub start: usize,
    pub end: usize,
    pub prot: ProtFlags,
    pub flags: MapFlags,
    /// Backing descriptor, shm id for SYSVIPC areas, -1 for none.
    pub fd: RawFd,
    /// Byte offset into the backing file.
    pub pgoff: u64,
    /// madvise() behaviors to replay, one bit per MADV_* value.
    pub madv: u64,
    pub status: VmaStatus,
    /// Scratch address of the premapped copy; doubles as the secondary sort
    /// key for the two-pass shift (regions are ordered by `start`, and the
    /// passes compare `start` against this).
    pub premap_addr: usize,
}

impl VmaDescriptor {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn range(&self) -> MemoryRange {
        MemoryRange::from_range(self.start, self.end)
    }

    pub fn is_premapped(&self) -> bool {
        self.status.contains(VmaStatus::PREMAPPED)
    }
}

/// Opaque kernel siginfo payload, re-queued verbatim.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct SigInfo(pub [u8; 128]);

impl SigInfo {
    pub fn from_signo(signo: i32) -> SigInfo {
        let mut raw = [0u8; 128];
        raw[..4].copy_from_slice(&signo.to_ne_bytes());
        SigInfo(raw)
    }

    pub fn signo(&self) -> i32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.0[..4]);
        i32::from_ne_bytes(b)
    }
}

impl std::fmt::Debug for SigInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigInfo(signo={})", self.signo())
    }
}

/// The controller pre-carves one of these per thread inside the premapped
/// area: a private stack and space for the synthetic sigframe.
#[derive(Copy, Clone, Debug, Default)]
pub struct MemZone {
    pub stack_top: usize,
    pub rt_sigframe: usize,
}

#[derive(Clone, Debug)]
pub struct ThreadArgs {
    pub tid: i32,
    pub regs: Registers,
    /// Signals blocked once the register file is reloaded.
    pub sigmask: u64,
    pub tls: TlsRecord,
    /// Address the kernel clears and wakes on thread exit.
    pub clear_tid_addr: usize,
    /// Robust futex list head; 0 length means none recorded.
    pub robust_list: usize,
    pub robust_list_len: usize,
    pub sched_policy: i32,
    pub sched_prio: i32,
    pub nice: i32,
    /// Thread-private pending queue, re-sent with rt_tgsigqueueinfo.
    pub pending: Vec<SigInfo>,
    pub pdeath_sig: i32,
    pub zone: MemZone,
}

/// Numeric identities, securebits and capability sets, replayed in the
/// fixed order documented in `creds`.
#[derive(Clone, Debug, Default)]
pub struct CredsRecord {
    pub uid: u32,
    pub euid: u32,
    pub suid: u32,
    pub fsuid: u32,
    pub gid: u32,
    pub egid: u32,
    pub sgid: u32,
    pub fsgid: u32,
    pub secbits: u32,
    pub cap_bnd: [u32; 2],
    pub cap_eff: [u32; 2],
    pub cap_prm: [u32; 2],
    pub cap_inh: [u32; 2],
    pub lsm_label: Option<String>,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct RlimitRecord {
    pub resource: u32,
    pub cur: u64,
    pub max: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KTimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ITimerSpec {
    pub interval: KTimeSpec,
    pub value: KTimeSpec,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KTimeVal {
    pub sec: i64,
    pub usec: i64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ITimerVal {
    pub interval: KTimeVal,
    pub value: KTimeVal,
}

impl ITimerVal {
    pub fn is_armed(&self) -> bool {
        self.interval.sec != 0 || self.interval.usec != 0
    }
}

#[derive(Copy, Clone, Debug)]
pub struct PosixTimerRecord {
    /// Kernel timer id the restored process knows this timer by.
    pub id: i32,
    pub clock_id: i32,
    pub sigev_notify: i32,
    pub si_signo: i32,
    pub sival_ptr: usize,
    pub value: ITimerSpec,
}

#[derive(Copy, Clone, Debug)]
pub struct TimerfdRecord {
    pub fd: RawFd,
    pub clock_id: i32,
    pub settime_flags: i32,
    /// Expirations that had already fired at checkpoint time.
    pub ticks: u64,
    pub value: ITimerSpec,
}

#[derive(Copy, Clone, Debug)]
pub struct AioRingRecord {
    /// Context address the restored process holds; the ring must end up
    /// exactly here.
    pub ctx_addr: usize,
    pub len: usize,
    pub nr_req: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct TcpRepairRecord {
    pub sk: RawFd,
    pub reuseaddr: bool,
}

/// One BPF instruction of a seccomp filter program.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SeccompMode {
    Disabled,
    Strict,
    Filter,
}

/// Saved SIGCHLD disposition, written back verbatim before pending signals
/// are re-queued. Same layout as the kernel's struct sigaction.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct SavedSigaction {
    pub handler: usize,
    pub flags: u64,
    pub restorer: usize,
    pub mask: u64,
}

/// Everything the controller delivers to `restore_task`. Read-only from the
/// engine's point of view; lives until the process resumes or dies.
pub struct TaskRestoreArgs {
    pub pid: i32,
    pub task_size: usize,
    /// The engine's own image, stack and argument area.
    pub bootstrap: MemoryRange,
    /// Scratch area holding the premapped private regions.
    pub premapped: MemoryRange,
    /// Controller scratch holding serialized records; unmapped at the very
    /// end, after the last engine code that touches it.
    pub rst_mem: MemoryRange,
    /// Ordered by `start`; final ranges pairwise disjoint.
    pub vmas: Vec<VmaDescriptor>,
    /// Exactly one entry has `tid == pid`: the leader.
    pub threads: Vec<ThreadArgs>,
    pub creds: CredsRecord,
    pub dumpable: Option<u32>,
    pub rlimits: Vec<RlimitRecord>,
    pub itimers: [ITimerVal; 3],
    pub posix_timers: Vec<PosixTimerRecord>,
    pub timerfds: Vec<TimerfdRecord>,
    pub aio_rings: Vec<AioRingRecord>,
    pub tcp_socks: Vec<TcpRepairRecord>,
    pub seccomp_mode: SeccompMode,
    pub seccomp_filters: Vec<Vec<SockFilter>>,
    /// Highest capability number the running kernel knows about.
    pub cap_last_cap: u32,
    pub comm: [u8; 16],
    /// Handle on the procfs root; the LSM label and last-pid writes go
    /// through it by relative path.
    pub proc_fd: RawFd,
    /// Descriptor used to restore the /proc/pid/exe link; -1 if not needed.
    pub exe_fd: RawFd,
    pub log_fd: RawFd,
    pub log_level: u32,
    pub sigchld_act: SavedSigaction,
    /// Process-wide (shared) pending queue, re-sent with rt_sigqueueinfo.
    pub process_pending: Vec<SigInfo>,
    pub helpers: Vec<i32>,
    pub zombies: Vec<i32>,
    /// Shared stage/progress counters; the controller owns advancement.
    pub entries: Arc<TaskEntries>,
}

impl TaskRestoreArgs {
    /// The thread descriptor whose tid equals the process id.
    pub fn leader(&self) -> &ThreadArgs {
        self.threads
            .iter()
            .find(|t| t.tid == self.pid)
            .expect("argument record must contain a leader thread")
    }
}
