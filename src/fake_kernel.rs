//! A programmable stand-in for `LinuxKernel`. It keeps a journal of every
//! call, models an address space with real clobber/overlap semantics (in
//! particular mremap rejecting overlapping ranges and anonymous mmap
//! picking top-down from a ceiling, like the real allocator), assigns
//! sequential posix-timer ids, and runs cloned threads on std::thread with
//! a faked tid. Failure injection lets error paths run deterministically.

use crate::arch::{Registers, TlsRecord};
use crate::kernel::{KernResult, Kernel, Resumed};
use crate::memory_range::MemoryRange;
use crate::restore_args::{ITimerSpec, ITimerVal, KTimeSpec, SavedSigaction, SigInfo, SockFilter};
use crate::sync::DeathWatch;
use crate::PAGE_SIZE;
use nix::errno::Errno;
use nix::fcntl::{FlockArg, OFlag};
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::unistd::Pid;
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

thread_local! {
    static CURRENT_TID: Cell<Option<i32>> = Cell::new(None);
}

#[derive(Clone, Copy)]
struct Mapping {
    len: usize,
    prot: ProtFlags,
    tag: usize,
}

struct FakeState {
    maps: BTreeMap<usize, Mapping>,
    anon_ceiling: usize,
    journal: Vec<String>,
    fail: HashMap<&'static str, Errno>,

    pid: i32,
    last_pid: i32,
    tid_skew: i32,
    threads: Vec<JoinHandle<()>>,

    files: HashMap<RawFd, String>,
    next_fd: RawFd,

    fsuid: u32,
    fsgid: u32,
    refuse_fsuid: bool,
    dumpable: u32,

    next_timer_id: i32,
    live_timers: Vec<i32>,
    timer_sets: Vec<(i32, ITimerSpec)>,
    timerfd_sets: Vec<(RawFd, i32, ITimerSpec)>,
    itimer_sets: Vec<(i32, ITimerVal)>,
    now: KTimeSpec,
    aio_ready: usize,

    children: HashMap<i32, i32>,
    watch: Option<Arc<DeathWatch>>,
    sigreturns: u32,
}

pub struct FakeKernel {
    state: Mutex<FakeState>,
    futex_lock: Mutex<()>,
    futex_cond: Condvar,
}

impl FakeKernel {
    pub const AIO_TAG: usize = 0xa10;

    pub fn new() -> FakeKernel {
        FakeKernel {
            state: Mutex::new(FakeState {
                maps: BTreeMap::new(),
                anon_ceiling: 0x8000_0000,
                journal: Vec::new(),
                fail: HashMap::new(),
                pid: 1000,
                last_pid: 1000,
                tid_skew: 0,
                threads: Vec::new(),
                files: HashMap::new(),
                next_fd: 100,
                fsuid: 0,
                fsgid: 0,
                refuse_fsuid: false,
                dumpable: 0,
                next_timer_id: 0,
                live_timers: Vec::new(),
                timer_sets: Vec::new(),
                timerfd_sets: Vec::new(),
                itimer_sets: Vec::new(),
                now: KTimeSpec::default(),
                aio_ready: 0,
                children: HashMap::new(),
                watch: None,
                sigreturns: 0,
            }),
            futex_lock: Mutex::new(()),
            futex_cond: Condvar::new(),
        }
    }

    fn st(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn call(&self, op: &'static str, entry: String) -> KernResult<MutexGuard<'_, FakeState>> {
        let mut st = self.st();
        if let Some(&errno) = st.fail.get(op) {
            return Err(errno);
        }
        st.journal.push(entry);
        Ok(st)
    }

    // --- programming the fake ---

    pub fn fail_with(&self, op: &'static str, errno: Errno) {
        self.st().fail.insert(op, errno);
    }

    pub fn seed_mapping(&self, addr: usize, len: usize, tag: usize) {
        let mut st = self.st();
        Self::clobber(&mut st.maps, addr, len);
        st.maps.insert(
            addr,
            Mapping {
                len,
                prot: ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                tag,
            },
        );
    }

    pub fn set_pids(&self, pid: i32) {
        let mut st = self.st();
        st.pid = pid;
        st.last_pid = pid;
    }

    pub fn skew_clone_tids(&self, skew: i32) {
        self.st().tid_skew = skew;
    }

    pub fn set_next_timer_id(&self, id: i32) {
        self.st().next_timer_id = id;
    }

    pub fn set_now(&self, now: KTimeSpec) {
        self.st().now = now;
    }

    pub fn set_aio_ready(&self, n: usize) {
        self.st().aio_ready = n;
    }

    pub fn set_anon_ceiling(&self, ceiling: usize) {
        self.st().anon_ceiling = ceiling;
    }

    pub fn refuse_fsuid(&self) {
        self.st().refuse_fsuid = true;
    }

    pub fn set_dumpable_state(&self, v: u32) {
        self.st().dumpable = v;
    }

    pub fn set_child_exit(&self, pid: i32, status: i32) {
        self.st().children.insert(pid, status);
    }

    // --- inspecting the fake ---

    pub fn mapped_ranges(&self) -> Vec<MemoryRange> {
        self.st()
            .maps
            .iter()
            .map(|(&start, m)| MemoryRange::new_range(start, m.len))
            .collect()
    }

    pub fn mapping_tag(&self, addr: usize) -> Option<usize> {
        self.find_mapping(addr).map(|(_, m)| m.tag)
    }

    pub fn mapping_prot(&self, addr: usize) -> Option<ProtFlags> {
        self.find_mapping(addr).map(|(_, m)| m.prot)
    }

    fn find_mapping(&self, addr: usize) -> Option<(usize, Mapping)> {
        let st = self.st();
        if let Some((&start, m)) = st.maps.range(..=addr).next_back() {
            if addr < start + m.len {
                return Some((start, *m));
            }
        }
        None
    }

    /// Where the next kernel-chosen anonymous page would land.
    pub fn next_anon_addr(&self) -> usize {
        let st = self.st();
        Self::alloc_topdown(&st.maps, PAGE_SIZE, st.anon_ceiling)
            .unwrap_or_else(|| panic!("fake address space exhausted"))
    }

    pub fn journal(&self) -> Vec<String> {
        self.st().journal.clone()
    }

    pub fn journal_contains(&self, needle: &str) -> bool {
        self.st().journal.iter().any(|e| e.contains(needle))
    }

    pub fn journal_count(&self, prefix: &str) -> usize {
        self.st()
            .journal
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn last_journal_entry(&self) -> String {
        self.st().journal.last().cloned().unwrap_or_default()
    }

    /// Assert the given substrings appear in the journal in this order
    /// (other entries may be interleaved).
    pub fn assert_journal_order(&self, expected: &[&str]) {
        let journal = self.journal();
        let mut pos = 0;
        for want in expected {
            match journal[pos..].iter().position(|e| e.contains(want)) {
                Some(off) => pos += off + 1,
                None => panic!(
                    "journal missing `{}` after entry {}:\n{:#?}",
                    want, pos, journal
                ),
            }
        }
    }

    pub fn live_timers(&self) -> Vec<i32> {
        let mut t = self.st().live_timers.clone();
        t.sort_unstable();
        t
    }

    pub fn timer_settings(&self) -> Vec<(i32, ITimerSpec)> {
        self.st().timer_sets.clone()
    }

    pub fn timerfd_settings(&self) -> Vec<(RawFd, i32, ITimerSpec)> {
        self.st().timerfd_sets.clone()
    }

    pub fn sigreturn_count(&self) -> u32 {
        self.st().sigreturns
    }

    pub fn child_still_waitable(&self, pid: i32) -> bool {
        self.st().children.contains_key(&pid)
    }

    pub fn death_watch(&self) -> Option<Arc<DeathWatch>> {
        self.st().watch.clone()
    }

    /// Join every thread spawned through the fake clone, swallowing the
    /// panics that stand in for exit_group.
    pub fn join_threads(&self) {
        let threads = std::mem::take(&mut self.st().threads);
        for handle in threads {
            let _ = handle.join();
        }
    }

    // --- address space model ---

    /// Remove everything intersecting `[addr, addr + len)`, keeping the
    /// parts of split mappings that stick out on either side.
    fn clobber(maps: &mut BTreeMap<usize, Mapping>, addr: usize, len: usize) {
        let range = MemoryRange::new_range(addr, len);
        let hits: Vec<usize> = maps
            .iter()
            .filter(|(&start, m)| range.intersects(&MemoryRange::new_range(start, m.len)))
            .map(|(&start, _)| start)
            .collect();
        for start in hits {
            let m = maps.remove(&start).unwrap();
            let end = start + m.len;
            if start < range.start() {
                maps.insert(
                    start,
                    Mapping {
                        len: range.start() - start,
                        ..m
                    },
                );
            }
            if end > range.end() {
                maps.insert(
                    range.end(),
                    Mapping {
                        len: end - range.end(),
                        ..m
                    },
                );
            }
        }
    }

    /// Highest free slot below the ceiling, the way the real anonymous
    /// allocator hands out addresses.
    fn alloc_topdown(
        maps: &BTreeMap<usize, Mapping>,
        len: usize,
        ceiling: usize,
    ) -> Option<usize> {
        let mut candidate_end = ceiling;
        for (&start, m) in maps.iter().rev() {
            if start >= candidate_end {
                continue;
            }
            let m_end = start + m.len;
            if m_end <= candidate_end.saturating_sub(len) {
                break;
            }
            candidate_end = start.min(candidate_end);
        }
        if candidate_end >= len + PAGE_SIZE {
            Some(candidate_end - len)
        } else {
            None
        }
    }

    fn insert(maps: &mut BTreeMap<usize, Mapping>, addr: usize, mapping: Mapping) {
        Self::clobber(maps, addr, mapping.len);
        maps.insert(addr, mapping);
    }
}

impl Kernel for FakeKernel {
    fn mmap(
        &self,
        addr: usize,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        _fd: RawFd,
        _pgoff: u64,
    ) -> KernResult<usize> {
        if addr == 0 && !flags.contains(MapFlags::MAP_FIXED) {
            let mut st = self.st();
            if let Some(&errno) = st.fail.get("mmap") {
                return Err(errno);
            }
            let picked = Self::alloc_topdown(&st.maps, len, st.anon_ceiling).ok_or(Errno::ENOMEM)?;
            st.journal
                .push(format!("mmap_anon({:#x}) -> {:#x}", len, picked));
            Self::insert(&mut st.maps, picked, Mapping { len, prot, tag: 0 });
            Ok(picked)
        } else {
            let mut st = self.call("mmap", format!("mmap_fixed({:#x}, {:#x})", addr, len))?;
            Self::insert(&mut st.maps, addr, Mapping { len, prot, tag: 0 });
            Ok(addr)
        }
    }

    fn munmap(&self, addr: usize, len: usize) -> KernResult<()> {
        let mut st = self.call("munmap", format!("munmap({:#x}, {:#x})", addr, len))?;
        Self::clobber(&mut st.maps, addr, len);
        Ok(())
    }

    fn mremap_fixed(&self, src: usize, len: usize, dst: usize) -> KernResult<usize> {
        let mut st = self.call(
            "mremap",
            format!("mremap({:#x} -> {:#x}, {:#x})", src, dst, len),
        )?;
        let src_range = MemoryRange::new_range(src, len);
        let dst_range = MemoryRange::new_range(dst, len);
        if src_range.intersects(&dst_range) {
            st.journal.pop();
            return Err(Errno::EINVAL);
        }
        let m = match st.maps.get(&src) {
            Some(m) if m.len == len => *m,
            _ => {
                st.journal.pop();
                return Err(Errno::EFAULT);
            }
        };
        st.maps.remove(&src);
        Self::insert(&mut st.maps, dst, m);
        Ok(dst)
    }

    fn mprotect(&self, addr: usize, len: usize, prot: ProtFlags) -> KernResult<()> {
        let mut st = self.call("mprotect", format!("mprotect({:#x}, {:#x})", addr, len))?;
        match st.maps.get_mut(&addr) {
            Some(m) if m.len == len => {
                m.prot = prot;
                Ok(())
            }
            _ => Err(Errno::ENOMEM),
        }
    }

    fn madvise(&self, _addr: usize, _len: usize, advice: i32) -> KernResult<()> {
        self.call("madvise", format!("madvise({})", advice))?;
        Ok(())
    }

    fn shmat(&self, shmid: i32, addr: usize, shmflg: i32) -> KernResult<usize> {
        let mode = if shmflg & libc::SHM_RDONLY != 0 {
            "rdonly"
        } else {
            "rw"
        };
        let mut st = self.call("shmat", format!("shmat({}, {})", shmid, mode))?;
        Self::insert(
            &mut st.maps,
            addr,
            Mapping {
                len: PAGE_SIZE,
                prot: ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                tag: shmid as usize,
            },
        );
        Ok(addr)
    }

    fn openat(&self, _dir: RawFd, path: &str, _oflag: OFlag) -> KernResult<RawFd> {
        let mut st = self.call("openat", format!("openat({})", path))?;
        let fd = st.next_fd;
        st.next_fd += 1;
        st.files.insert(fd, path.to_string());
        Ok(fd)
    }

    fn close(&self, fd: RawFd) -> KernResult<()> {
        let mut st = self.call("close", format!("close({})", fd))?;
        st.files.remove(&fd);
        Ok(())
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> KernResult<usize> {
        let mut st = self.st();
        if let Some(&errno) = st.fail.get("write") {
            return Err(errno);
        }
        let path = st.files.get(&fd).cloned().unwrap_or_default();
        if path.ends_with("ns_last_pid") {
            let text = String::from_utf8_lossy(buf).into_owned();
            st.last_pid = text.parse().map_err(|_| Errno::EINVAL)?;
            st.journal.push(format!("write({}, {})", path, text));
        } else {
            st.journal.push(format!("write({})", path));
        }
        Ok(buf.len())
    }

    fn rewind(&self, fd: RawFd) -> KernResult<()> {
        self.call("rewind", format!("rewind({})", fd))?;
        Ok(())
    }

    fn flock(&self, _fd: RawFd, arg: FlockArg) -> KernResult<()> {
        let name = match arg {
            FlockArg::LockExclusive => "LockExclusive",
            FlockArg::LockShared => "LockShared",
            FlockArg::Unlock => "Unlock",
            _ => "other",
        };
        self.call("flock", format!("flock({})", name))?;
        Ok(())
    }

    fn getpid(&self) -> Pid {
        Pid::from_raw(self.st().pid)
    }

    fn gettid(&self) -> Pid {
        let tid = CURRENT_TID
            .with(|t| t.get())
            .unwrap_or_else(|| self.st().pid);
        Pid::from_raw(tid)
    }

    fn setresuid(&self, ruid: u32, euid: u32, suid: u32) -> KernResult<()> {
        self.call(
            "setresuid",
            format!("setresuid({}, {}, {})", ruid, euid, suid),
        )?;
        Ok(())
    }

    fn setfsuid(&self, fsuid: u32) -> u32 {
        let mut st = self.st();
        let prev = st.fsuid;
        if fsuid == u32::MAX {
            st.journal.push("setfsuid(-1)".to_string());
        } else {
            st.journal.push(format!("setfsuid({})", fsuid));
            if !st.refuse_fsuid {
                st.fsuid = fsuid;
            }
        }
        prev
    }

    fn setresgid(&self, rgid: u32, egid: u32, sgid: u32) -> KernResult<()> {
        self.call(
            "setresgid",
            format!("setresgid({}, {}, {})", rgid, egid, sgid),
        )?;
        Ok(())
    }

    fn setfsgid(&self, fsgid: u32) -> u32 {
        let mut st = self.st();
        let prev = st.fsgid;
        if fsgid == u32::MAX {
            st.journal.push("setfsgid(-1)".to_string());
        } else {
            st.journal.push(format!("setfsgid({})", fsgid));
            st.fsgid = fsgid;
        }
        prev
    }

    fn set_securebits(&self, bits: u32) -> KernResult<()> {
        self.call("set_securebits", format!("set_securebits({})", bits))?;
        Ok(())
    }

    fn capbset_drop(&self, cap: u32) -> KernResult<()> {
        self.call("capbset_drop", format!("capbset_drop({})", cap))?;
        Ok(())
    }

    fn capset(&self, _eff: [u32; 2], _prm: [u32; 2], _inh: [u32; 2]) -> KernResult<()> {
        self.call("capset", "capset".to_string())?;
        Ok(())
    }

    fn set_comm(&self, _comm: &[u8; 16]) -> KernResult<()> {
        self.call("set_comm", "set_comm".to_string())?;
        Ok(())
    }

    fn set_exe_file(&self, fd: RawFd) -> KernResult<()> {
        self.call("set_exe_file", format!("set_exe_file({})", fd))?;
        Ok(())
    }

    fn get_dumpable(&self) -> KernResult<u32> {
        Ok(self.st().dumpable)
    }

    fn set_dumpable(&self, v: u32) -> KernResult<()> {
        let mut st = self.call("set_dumpable", format!("set_dumpable({})", v))?;
        st.dumpable = v;
        Ok(())
    }

    fn set_pdeath_sig(&self, sig: i32) -> KernResult<()> {
        self.call("set_pdeath_sig", format!("set_pdeath_sig({})", sig))?;
        Ok(())
    }

    fn block_all_signals(&self) -> KernResult<()> {
        self.call("block_all_signals", "block_all_signals".to_string())?;
        Ok(())
    }

    fn set_sigchld_action(&self, _act: &SavedSigaction) -> KernResult<()> {
        self.call("set_sigchld_action", "set_sigchld_action".to_string())?;
        Ok(())
    }

    fn install_death_watch(&self, watch: Arc<DeathWatch>) -> KernResult<()> {
        let mut st = self.call("install_death_watch", "install_death_watch".to_string())?;
        st.watch = Some(watch);
        Ok(())
    }

    fn queue_process_signal(&self, pid: Pid, info: &SigInfo) -> KernResult<()> {
        self.call(
            "sigqueueinfo",
            format!("sigqueueinfo({}, {})", pid.as_raw(), info.signo()),
        )?;
        Ok(())
    }

    fn queue_thread_signal(&self, pid: Pid, tid: Pid, info: &SigInfo) -> KernResult<()> {
        self.call(
            "tgsigqueueinfo",
            format!(
                "tgsigqueueinfo({}, {}, {})",
                pid.as_raw(),
                tid.as_raw(),
                info.signo()
            ),
        )?;
        Ok(())
    }

    fn clone_restore_thread(
        &self,
        _stack_top: usize,
        entry: Box<dyn FnOnce() + Send>,
    ) -> KernResult<Pid> {
        let tid = {
            let mut st = self.st();
            if let Some(&errno) = st.fail.get("clone") {
                return Err(errno);
            }
            let tid = st.last_pid + 1 + st.tid_skew;
            st.last_pid = tid;
            st.journal.push(format!("clone({})", tid));
            tid
        };
        let handle = std::thread::spawn(move || {
            CURRENT_TID.with(|t| t.set(Some(tid)));
            entry();
        });
        self.st().threads.push(handle);
        Ok(Pid::from_raw(tid))
    }

    fn set_tid_address(&self, addr: usize) -> KernResult<()> {
        self.call("set_tid_address", format!("set_tid_address({:#x})", addr))?;
        Ok(())
    }

    fn set_robust_list(&self, head: usize, len: usize) -> KernResult<()> {
        self.call(
            "set_robust_list",
            format!("set_robust_list({:#x}, {})", head, len),
        )?;
        Ok(())
    }

    fn set_tls(&self, _tls: &TlsRecord) -> KernResult<()> {
        self.call("set_tls", "set_tls".to_string())?;
        Ok(())
    }

    fn set_nice(&self, nice: i32) -> KernResult<()> {
        self.call("set_nice", format!("set_nice({})", nice))?;
        Ok(())
    }

    fn set_scheduler(&self, policy: i32, priority: i32) -> KernResult<()> {
        self.call(
            "set_scheduler",
            format!("set_scheduler({}, {})", policy, priority),
        )?;
        Ok(())
    }

    fn setrlimit(&self, resource: u32, cur: u64, max: u64) -> KernResult<()> {
        self.call(
            "setrlimit",
            format!("setrlimit({}, {}, {})", resource, cur, max),
        )?;
        Ok(())
    }

    fn wait_exited(&self, pid: Pid) -> KernResult<Option<i32>> {
        let mut st = self.call("wait_exited", format!("wait4({})", pid.as_raw()))?;
        Ok(st.children.remove(&pid.as_raw()))
    }

    fn wait_zombie_nowait(&self, pid: Pid) -> KernResult<()> {
        let st = self.call(
            "waitid_nowait",
            format!("waitid_nowait({})", pid.as_raw()),
        )?;
        if st.children.contains_key(&pid.as_raw()) {
            Ok(())
        } else {
            Err(Errno::ECHILD)
        }
    }

    fn exit_group(&self, code: i32) -> ! {
        panic!("exit_group({})", code);
    }

    fn timer_create(
        &self,
        _clock_id: i32,
        _sigev_notify: i32,
        _signo: i32,
        _sival_ptr: usize,
    ) -> KernResult<i32> {
        let mut st = self.st();
        if let Some(&errno) = st.fail.get("timer_create") {
            return Err(errno);
        }
        let id = st.next_timer_id;
        st.next_timer_id += 1;
        st.live_timers.push(id);
        st.journal.push(format!("timer_create({})", id));
        Ok(id)
    }

    fn timer_delete(&self, id: i32) -> KernResult<()> {
        let mut st = self.call("timer_delete", format!("timer_delete({})", id))?;
        st.live_timers.retain(|&t| t != id);
        Ok(())
    }

    fn timer_settime(&self, id: i32, value: &ITimerSpec) -> KernResult<()> {
        let mut st = self.call("timer_settime", format!("timer_settime({})", id))?;
        if !st.live_timers.contains(&id) {
            return Err(Errno::EINVAL);
        }
        st.timer_sets.push((id, *value));
        Ok(())
    }

    fn timerfd_settime(&self, fd: RawFd, flags: i32, value: &ITimerSpec) -> KernResult<()> {
        let mut st = self.call("timerfd_settime", format!("timerfd_settime({})", fd))?;
        st.timerfd_sets.push((fd, flags, *value));
        Ok(())
    }

    fn timerfd_set_ticks(&self, fd: RawFd, ticks: u64) -> KernResult<()> {
        self.call(
            "timerfd_set_ticks",
            format!("timerfd_set_ticks({}, {})", fd, ticks),
        )?;
        Ok(())
    }

    fn clock_gettime(&self, _clock_id: i32) -> KernResult<KTimeSpec> {
        Ok(self.st().now)
    }

    fn setitimer(&self, which: i32, value: &ITimerVal) -> KernResult<()> {
        let mut st = self.call("setitimer", format!("setitimer({})", which))?;
        st.itimer_sets.push((which, *value));
        Ok(())
    }

    fn io_setup(&self, nr_events: u32) -> KernResult<usize> {
        let mut st = self.st();
        if let Some(&errno) = st.fail.get("io_setup") {
            return Err(errno);
        }
        let addr =
            Self::alloc_topdown(&st.maps, PAGE_SIZE, st.anon_ceiling).ok_or(Errno::ENOMEM)?;
        Self::insert(
            &mut st.maps,
            addr,
            Mapping {
                len: PAGE_SIZE,
                prot: ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                tag: Self::AIO_TAG,
            },
        );
        st.journal
            .push(format!("io_setup({}) -> {:#x}", nr_events, addr));
        Ok(addr)
    }

    fn io_events_ready(&self, ctx: usize) -> KernResult<usize> {
        let st = self.call("io_getevents", format!("io_getevents({:#x})", ctx))?;
        let backing = st
            .maps
            .get(&ctx)
            .ok_or(Errno::EINVAL)?;
        if backing.tag != Self::AIO_TAG {
            return Err(Errno::EINVAL);
        }
        Ok(st.aio_ready)
    }

    fn tcp_repair_off(&self, sk: RawFd) -> KernResult<()> {
        self.call("tcp_repair_off", format!("tcp_repair_off({})", sk))?;
        Ok(())
    }

    fn set_reuseaddr(&self, sk: RawFd, on: bool) -> KernResult<()> {
        self.call("set_reuseaddr", format!("set_reuseaddr({}, {})", sk, on))?;
        Ok(())
    }

    fn seccomp_strict(&self) -> KernResult<()> {
        self.call("seccomp_strict", "seccomp_strict".to_string())?;
        Ok(())
    }

    fn seccomp_filter_tsync(&self, prog: &[SockFilter]) -> KernResult<()> {
        self.call(
            "seccomp_filter_tsync",
            format!("seccomp_filter_tsync({})", prog.len()),
        )?;
        Ok(())
    }

    fn futex_wait(&self, word: &AtomicU32, expected: u32) -> KernResult<()> {
        use std::sync::atomic::Ordering;
        let guard = match self.futex_lock.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if word.load(Ordering::SeqCst) != expected {
            return Ok(());
        }
        // Spurious wakeups are allowed by the contract, so a timeout keeps
        // a missed wake from hanging the test run.
        let _ = self
            .futex_cond
            .wait_timeout(guard, Duration::from_millis(50));
        Ok(())
    }

    fn futex_wake_all(&self, _word: &AtomicU32) {
        let _guard = match self.futex_lock.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        self.futex_cond.notify_all();
    }

    fn write_sigframe(
        &self,
        frame_addr: usize,
        _regs: &Registers,
        _sigmask: u64,
    ) -> KernResult<()> {
        self.call("write_sigframe", format!("write_sigframe({:#x})", frame_addr))?;
        Ok(())
    }

    fn sigreturn(&self, new_sp: usize) -> KernResult<Resumed> {
        let mut st = self.call("sigreturn", format!("sigreturn({:#x})", new_sp))?;
        st.sigreturns += 1;
        Ok(Resumed(()))
    }
}
