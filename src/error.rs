use nix::errno::Errno;
use std::fmt;
use std::fmt::{Display, Formatter};

/// Everything that can go wrong during a restore. There is no recovery from
/// any of these: the caller's only move is to wake the other job members via
/// the abort futex and exit non-zero. They are distinct variants so the
/// abort paths can be asserted on deterministically in tests.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RestoreError {
    /// The kernel rejected a call.
    Sys(Errno),
    /// The job-wide abort flag was observed while blocked on the barrier.
    Aborted,
    /// A mapping (mmap/shmat/mremap) did not land at its required address.
    MappingMismatch { want: usize, got: usize },
    /// The kernel assigned a posix timer id past the one we need; id
    /// assignment is only repeatable while we stay below the target.
    TimerIdOverrun { want: i32, got: i32 },
    /// A cloned thread woke up with a tid other than the one reserved for
    /// it through the last-pid protocol.
    TidMismatch { want: i32, got: i32 },
    /// setfsuid/setfsgid read-back disagreed with the credential record.
    FsIdMismatch { want: u32, got: u32 },
    /// A helper process exited with a non-zero status or was killed.
    HelperFailed { pid: i32, status: i32 },
    /// An AIO ring was remapped but the kernel-side context did not follow,
    /// or the zero-timeout probe produced spurious events.
    AioRingBroken { ctx: usize },
}

pub type Result<T> = std::result::Result<T, RestoreError>;

impl From<Errno> for RestoreError {
    fn from(e: Errno) -> RestoreError {
        RestoreError::Sys(e)
    }
}

impl Display for RestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RestoreError::Sys(e) => write!(f, "kernel call failed: {}", e),
            RestoreError::Aborted => write!(f, "restore aborted by peer"),
            RestoreError::MappingMismatch { want, got } => {
                write!(f, "mapping landed at {:#x}, needed {:#x}", got, want)
            }
            RestoreError::TimerIdOverrun { want, got } => {
                write!(f, "posix timer id overrun: wanted {}, kernel gave {}", want, got)
            }
            RestoreError::TidMismatch { want, got } => {
                write!(f, "thread woke up as tid {}, expected {}", got, want)
            }
            RestoreError::FsIdMismatch { want, got } => {
                write!(f, "fs id read back as {}, expected {}", got, want)
            }
            RestoreError::HelperFailed { pid, status } => {
                write!(f, "helper {} failed with wait status {:#x}", pid, status)
            }
            RestoreError::AioRingBroken { ctx } => {
                write!(f, "aio ring at {:#x} did not survive relocation", ctx)
            }
        }
    }
}
