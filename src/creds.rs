//! Identity, capability and sandbox restoration.
//!
//! The order here is load-bearing. NO_SETUID_FIXUP keeps the kernel from
//! clearing capability sets while the uids change; the saved securebits
//! only go back once both id families are in place; the bounding set must
//! shrink before capset pins the working sets; the LSM label write needs
//! the proc handle that later steps are allowed to close. Seccomp comes
//! last of all and only after the log fd is gone, because strict mode
//! leaves no way to close anything afterwards.

use crate::kernel::Kernel;
use crate::log::LogLevel::*;
use crate::restore_args::{CredsRecord, SeccompMode, SockFilter};
use crate::{Result, RestoreError};
use bit_field::BitField;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use std::os::unix::io::RawFd;

const SECURE_NO_SETUID_FIXUP: u32 = 1 << 2;

pub fn restore_creds(
    kernel: &dyn Kernel,
    creds: &CredsRecord,
    cap_last_cap: u32,
    proc_fd: RawFd,
    tid: i32,
) -> Result<()> {
    kernel.set_securebits(SECURE_NO_SETUID_FIXUP)?;

    kernel.setresuid(creds.uid, creds.euid, creds.suid)?;
    kernel.setfsuid(creds.fsuid);
    let got = kernel.setfsuid(u32::MAX);
    if got != creds.fsuid {
        log!(LogError, "fsuid did not stick");
        return Err(RestoreError::FsIdMismatch {
            want: creds.fsuid,
            got,
        });
    }

    kernel.setresgid(creds.gid, creds.egid, creds.sgid)?;
    kernel.setfsgid(creds.fsgid);
    let got = kernel.setfsgid(u32::MAX);
    if got != creds.fsgid {
        log!(LogError, "fsgid did not stick");
        return Err(RestoreError::FsIdMismatch {
            want: creds.fsgid,
            got,
        });
    }

    kernel.set_securebits(creds.secbits)?;

    for cap in 0..=cap_last_cap {
        let (word, bit) = ((cap / 32) as usize, (cap % 32) as usize);
        if !creds.cap_bnd[word].get_bit(bit) {
            kernel.capbset_drop(cap)?;
        }
    }

    kernel.capset(creds.cap_eff, creds.cap_prm, creds.cap_inh)?;

    if let Some(label) = &creds.lsm_label {
        let path = format!("self/task/{}/attr/current", tid);
        let fd = kernel.openat(proc_fd, &path, OFlag::O_WRONLY)?;
        let written = kernel.write(fd, label.as_bytes());
        kernel.close(fd)?;
        if written? != label.len() {
            return Err(RestoreError::Sys(Errno::EIO));
        }
    }

    Ok(())
}

/// PR_SET_DUMPABLE only accepts 0 and 1; the suid-safe value is whatever
/// the creds restore left behind, so it is checked rather than set and
/// forced to the safe side on mismatch.
pub fn restore_dumpable(kernel: &dyn Kernel, dumpable: Option<u32>) -> Result<()> {
    let dumpable = match dumpable {
        Some(d) => d,
        None => return Ok(()),
    };
    if dumpable <= 1 {
        return Ok(kernel.set_dumpable(dumpable)?);
    }
    let current = kernel.get_dumpable()?;
    if current != dumpable {
        log!(
            LogWarn,
            "dumpable {} not restorable, have {}; clearing",
            dumpable,
            current
        );
        kernel.set_dumpable(0)?;
    }
    Ok(())
}

/// Ordered after creds: changing real or effective ids resets the
/// parent-death signal.
pub fn restore_pdeath_sig(kernel: &dyn Kernel, sig: i32) -> Result<()> {
    if sig != 0 {
        kernel.set_pdeath_sig(sig)?;
    }
    Ok(())
}

/// The caller must have closed the log sink already; from here on a
/// failure cannot be allowed to return into engine code.
pub fn install_seccomp(
    kernel: &dyn Kernel,
    mode: SeccompMode,
    filters: &[Vec<SockFilter>],
) -> Result<()> {
    match mode {
        SeccompMode::Disabled => Ok(()),
        SeccompMode::Strict => Ok(kernel.seccomp_strict()?),
        SeccompMode::Filter => {
            for prog in filters {
                kernel.seccomp_filter_tsync(prog)?;
            }
            Ok(())
        }
    }
}
