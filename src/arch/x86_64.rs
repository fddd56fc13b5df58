use core::arch::asm;

/// The general-purpose register file captured at checkpoint time, in the
/// shape we feed back through the sigcontext. Segment bases travel
/// separately in `TlsRecord` because they are restored via arch_prctl, not
/// through the frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rsp: u64,
    pub rip: u64,
    pub eflags: u64,
    pub cs: u16,
    pub gs: u16,
    pub fs: u16,
    pub ss: u16,
}

/// Thread-local state restored outside the sigframe.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsRecord {
    pub fs_base: u64,
    pub gs_base: u64,
}

/// struct sigcontext from arch/x86/include/uapi/asm/sigcontext.h, 64-bit.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Sigcontext {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rsp: u64,
    pub rip: u64,
    pub eflags: u64,
    pub cs: u16,
    pub gs: u16,
    pub fs: u16,
    pub ss: u16,
    pub err: u64,
    pub trapno: u64,
    pub oldmask: u64,
    pub cr2: u64,
    /// Userspace pointer to the fpstate area; zero means "none saved" and
    /// the kernel restores a default x87/SSE environment.
    pub fpstate: u64,
    pub reserved1: [u64; 8],
}

assert_eq_size!(Sigcontext, [u8; 256]);

#[repr(C)]
#[derive(Copy, Clone)]
pub struct KernelSigstack {
    pub ss_sp: u64,
    pub ss_flags: i32,
    pub _pad: i32,
    pub ss_size: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct KernelUcontext {
    pub uc_flags: u64,
    pub uc_link: u64,
    pub uc_stack: KernelSigstack,
    pub uc_mcontext: Sigcontext,
    pub uc_sigmask: u64,
}

/// The frame rt_sigreturn consumes. The kernel expects the stack pointer to
/// aim just past `pretcode`, i.e. at the ucontext.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct RtSigframe {
    pub pretcode: u64,
    pub uc: KernelUcontext,
    pub info: [u8; 128],
}

/// Distance from the frame's base address to where the stack pointer must
/// point when rt_sigreturn is invoked.
pub const SIGFRAME_OFFSET: usize = 8;

assert_eq_size!(KernelUcontext, [u8; 304]);
assert_eq_size!(RtSigframe, [u8; 440]);

impl RtSigframe {
    /// Build a frame that resumes at `regs` with `sigmask` as the blocked
    /// set after the jump.
    pub fn from_registers(regs: &Registers, sigmask: u64) -> RtSigframe {
        let mut frame: RtSigframe = unsafe { std::mem::zeroed() };
        let mc = &mut frame.uc.uc_mcontext;
        mc.r8 = regs.r8;
        mc.r9 = regs.r9;
        mc.r10 = regs.r10;
        mc.r11 = regs.r11;
        mc.r12 = regs.r12;
        mc.r13 = regs.r13;
        mc.r14 = regs.r14;
        mc.r15 = regs.r15;
        mc.rdi = regs.rdi;
        mc.rsi = regs.rsi;
        mc.rbp = regs.rbp;
        mc.rbx = regs.rbx;
        mc.rdx = regs.rdx;
        mc.rax = regs.rax;
        mc.rcx = regs.rcx;
        mc.rsp = regs.rsp;
        mc.rip = regs.rip;
        mc.eflags = regs.eflags;
        mc.cs = regs.cs;
        mc.gs = regs.gs;
        mc.fs = regs.fs;
        mc.ss = regs.ss;
        frame.uc.uc_sigmask = sigmask;
        frame
    }
}

/// Write a fully-populated sigframe at `frame_addr`, which must point into
/// the thread's pre-carved restore zone.
///
/// # Safety
/// `frame_addr` must be mapped, writable, and sized for an `RtSigframe`.
pub unsafe fn write_sigframe(frame_addr: usize, regs: &Registers, sigmask: u64) {
    let frame = RtSigframe::from_registers(regs, sigmask);
    std::ptr::write(frame_addr as *mut RtSigframe, frame);
}

/// Point the stack at a prepared sigframe and issue rt_sigreturn. The
/// kernel atomically loads the whole register file, including rip, so no
/// engine code ever runs at the target address. This must be the very last
/// thing executed on the calling thread.
///
/// # Safety
/// `new_sp` must equal frame address + `SIGFRAME_OFFSET` for a valid frame.
/// The caller must have nothing left to unwind; control never returns.
pub unsafe fn resume_with_registers(new_sp: usize) -> ! {
    asm!(
        "mov rsp, {sp}",
        "mov eax, 15", // __NR_rt_sigreturn
        "syscall",
        sp = in(reg) new_sp,
        options(noreturn),
    );
}
