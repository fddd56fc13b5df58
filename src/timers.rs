//! Re-creating and re-arming the process timers.
//!
//! Posix timer ids are kernel-assigned and the restored process knows its
//! timers by the old ids, so creation leans on the kernel handing ids out
//! sequentially: create, and while the assigned id is still below the
//! target, delete and create again. An id past the target can never be
//! walked back and fails the restore.
//!
//! Creation happens early (ids must match before anything observes them);
//! arming happens at the very end of the restore so a short timer cannot
//! fire into a half-rebuilt process.

use crate::kernel::Kernel;
use crate::log::LogLevel::*;
use crate::restore_args::{ITimerVal, PosixTimerRecord, TimerfdRecord};
use crate::{Result, RestoreError};

const TFD_TIMER_ABSTIME: i32 = 1;

pub fn create_posix_timers(kernel: &dyn Kernel, timers: &[PosixTimerRecord]) -> Result<()> {
    for t in timers {
        loop {
            let id = kernel.timer_create(t.clock_id, t.sigev_notify, t.si_signo, t.sival_ptr)?;
            if id == t.id {
                break;
            }
            kernel.timer_delete(id)?;
            if id > t.id {
                log!(LogError, "timer ids not assigned sequentially");
                return Err(RestoreError::TimerIdOverrun { want: t.id, got: id });
            }
        }
    }
    Ok(())
}

pub fn arm_posix_timers(kernel: &dyn Kernel, timers: &[PosixTimerRecord]) -> Result<()> {
    for t in timers {
        kernel.timer_settime(t.id, &t.value)?;
    }
    Ok(())
}

/// Arm recorded timerfds and replay their expiration counters.
///
/// Absolute-time records were saved as remaining time; only the seconds are
/// shifted by the current clock value, the sub-second part is carried over
/// as recorded.
pub fn arm_timerfds(kernel: &dyn Kernel, timerfds: &[TimerfdRecord]) -> Result<()> {
    for t in timerfds {
        let mut value = t.value;
        if t.settime_flags & TFD_TIMER_ABSTIME != 0 {
            let now = kernel.clock_gettime(t.clock_id)?;
            value.value.sec += now.sec;
            log!(
                LogDebug,
                "timerfd {} rearmed absolute at {}s",
                t.fd,
                value.value.sec
            );
        }
        kernel.timerfd_settime(t.fd, t.settime_flags, &value)?;
        if t.ticks != 0 {
            kernel.timerfd_set_ticks(t.fd, t.ticks)?;
        }
    }
    Ok(())
}

/// REAL / VIRTUAL / PROF interval timers; a record without an interval was
/// disarmed at checkpoint time and stays that way.
pub fn arm_itimers(kernel: &dyn Kernel, itimers: &[ITimerVal; 3]) -> Result<()> {
    for (which, it) in itimers.iter().enumerate() {
        if it.is_armed() {
            kernel.setitimer(which as i32, it)?;
        }
    }
    Ok(())
}
