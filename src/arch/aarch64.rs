use core::arch::asm;

/// The general-purpose register file captured at checkpoint time.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Registers {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl Default for Registers {
    fn default() -> Registers {
        Registers {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
        }
    }
}

/// Thread-local state restored outside the sigframe.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsRecord {
    pub tpidr_el0: u64,
}

/// struct sigcontext from arch/arm64/include/uapi/asm/sigcontext.h. The
/// __reserved area holds the (unused here) fpsimd/extension records.
#[repr(C)]
#[repr(align(16))]
#[derive(Copy, Clone)]
pub struct Sigcontext {
    pub fault_address: u64,
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    pub reserved: [u8; 4096],
}

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
    pub uc_sigmask: u64,
    /// Pads the sigmask area out to the glibc-sized 1024-bit set.
    pub _unused: [u8; 120],
    pub uc_mcontext: Sigcontext,
}

/// On arm64 the kernel expects sp to point at the frame itself: siginfo
/// first, then the ucontext.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct RtSigframe {
    pub info: [u8; 128],
    pub uc: KernelUcontext,
}

pub const SIGFRAME_OFFSET: usize = 0;

impl RtSigframe {
    pub fn from_registers(regs: &Registers, sigmask: u64) -> RtSigframe {
        let mut frame: RtSigframe = unsafe { std::mem::zeroed() };
        let mc = &mut frame.uc.uc_mcontext;
        mc.regs = regs.regs;
        mc.sp = regs.sp;
        mc.pc = regs.pc;
        mc.pstate = regs.pstate;
        frame.uc.uc_sigmask = sigmask;
        frame
    }
}

/// # Safety
/// `frame_addr` must be mapped, writable, 16-byte aligned and sized for an
/// `RtSigframe`.
pub unsafe fn write_sigframe(frame_addr: usize, regs: &Registers, sigmask: u64) {
    let frame = RtSigframe::from_registers(regs, sigmask);
    std::ptr::write(frame_addr as *mut RtSigframe, frame);
}

/// # Safety
/// See the x86_64 twin: last instruction on this thread, never returns.
pub unsafe fn resume_with_registers(new_sp: usize) -> ! {
    asm!(
        "mov sp, {sp}",
        "mov x8, #139", // __NR_rt_sigreturn
        "svc #0",
        sp = in(reg) new_sp,
        options(noreturn),
    );
}
