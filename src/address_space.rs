//! Rebuilding the target address space on top of ourselves.
//!
//! Order matters and is driven by the orchestrator: everything foreign is
//! unmapped first, then the premapped private regions are shifted from
//! their scratch addresses into their final places, then the remaining
//! regions are mapped fresh, and finally protections and madvise behaviors
//! are replayed. Any rejected call is terminal for the whole job.

use crate::kernel::Kernel;
use crate::log::LogLevel::*;
use crate::memory_range::MemoryRange;
use crate::restore_args::{VmaDescriptor, VmaStatus};
use crate::{Result, RestoreError, PAGE_SIZE};
use nix::sys::mman::{MapFlags, ProtFlags};

/// Unmap the up-to-three gaps of `[0, task_size)` not covered by the two
/// regions we still live in: our own image/stack and the premapped scratch
/// area.
pub fn unmap_foreign_regions(
    kernel: &dyn Kernel,
    bootstrap: MemoryRange,
    premapped: MemoryRange,
    task_size: usize,
) -> Result<()> {
    let (lo, hi) = if bootstrap.start() <= premapped.start() {
        (bootstrap, premapped)
    } else {
        (premapped, bootstrap)
    };
    let gaps = [
        MemoryRange::from_range(0, lo.start()),
        MemoryRange::from_range(lo.end(), hi.start()),
        MemoryRange::from_range(hi.end(), task_size),
    ];
    for gap in &gaps {
        if gap.is_empty() {
            continue;
        }
        log!(LogDebug, "unmap foreign {}", gap);
        kernel.munmap(gap.start(), gap.size())?;
    }
    Ok(())
}

/// Move a premapped region from `src` to `dst`, tolerating overlap.
///
/// mremap refuses overlapping source and destination ranges, so in that
/// case the region takes a detour through a kernel-chosen scratch address.
/// The catch: the destination range is currently a hole (we just unmapped
/// it), and the kernel is free to place the scratch mapping right there,
/// which would put the region out of reach of the final move. A one-page
/// PROT_NONE guard at the edge of the destination that does not overlap the
/// source makes the hole too small for that. The final fixed move clobbers
/// the guard along with the rest of the destination range.
fn remap_region(kernel: &dyn Kernel, mut src: usize, dst: usize, len: usize) -> Result<()> {
    if src == dst {
        return Ok(());
    }
    let guard = if src.wrapping_sub(dst) < len {
        // Moving down; the low edge of dst is clear of src.
        Some(dst)
    } else if dst.wrapping_sub(src) < len {
        // Moving up; the high edge is.
        Some(dst + len - PAGE_SIZE)
    } else {
        None
    };
    if let Some(guard) = guard {
        kernel.mmap(
            guard,
            PAGE_SIZE,
            ProtFlags::PROT_NONE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_FIXED,
            -1,
            0,
        )?;
        let scratch = kernel.mmap(
            0,
            len,
            ProtFlags::PROT_NONE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )?;
        let moved = kernel.mremap_fixed(src, len, scratch)?;
        if moved != scratch {
            return Err(RestoreError::MappingMismatch {
                want: scratch,
                got: moved,
            });
        }
        src = scratch;
    }
    let moved = kernel.mremap_fixed(src, len, dst)?;
    if moved != dst {
        return Err(RestoreError::MappingMismatch {
            want: dst,
            got: moved,
        });
    }
    Ok(())
}

/// Shift every premapped private region from its scratch address to its
/// final one.
///
/// Two passes over the descriptors (which are ordered by final start, the
/// same order their scratch copies are packed in): regions moving down are
/// handled front to back, regions moving up back to front. Each pass stops
/// at the first region moving the other way; this ordering guarantees a
/// move never lands on a scratch copy that has not been moved out yet.
pub fn shift_premapped_regions(
    kernel: &dyn Kernel,
    vmas: &[VmaDescriptor],
    task_size: usize,
) -> Result<()> {
    for vma in vmas {
        if !vma.is_premapped() || vma.end >= task_size {
            continue;
        }
        if vma.start > vma.premap_addr {
            break;
        }
        log!(
            LogDebug,
            "shift down {} <- {:#x}",
            vma.range(),
            vma.premap_addr
        );
        remap_region(kernel, vma.premap_addr, vma.start, vma.len())?;
    }
    for vma in vmas.iter().rev() {
        if !vma.is_premapped() || vma.start > task_size {
            continue;
        }
        if vma.start < vma.premap_addr {
            break;
        }
        log!(
            LogDebug,
            "shift up {} <- {:#x}",
            vma.range(),
            vma.premap_addr
        );
        remap_region(kernel, vma.premap_addr, vma.start, vma.len())?;
    }
    Ok(())
}

fn map_one_region(kernel: &dyn Kernel, vma: &VmaDescriptor) -> Result<usize> {
    if vma.status.contains(VmaStatus::SYSVIPC) {
        let shmflg = if vma.prot.contains(ProtFlags::PROT_WRITE) {
            0
        } else {
            libc::SHM_RDONLY
        };
        return Ok(kernel.shmat(vma.fd, vma.start, shmflg)?);
    }
    let mut prot = vma.prot;
    let mut flags = vma.flags | MapFlags::MAP_FIXED;
    if vma.status.contains(VmaStatus::ANON_SHARED) && vma.fd != -1 {
        flags &= !MapFlags::MAP_ANONYMOUS;
    }
    // Private and anonymous regions still need their pages written; the
    // recorded protection is replayed once population is done.
    if vma.fd == -1 || !vma.flags.contains(MapFlags::MAP_SHARED) {
        prot |= ProtFlags::PROT_WRITE;
    }
    let addr = kernel.mmap(vma.start, vma.len(), prot, flags, vma.fd, vma.pgoff)?;
    if vma.fd != -1 {
        kernel.close(vma.fd)?;
    }
    Ok(addr)
}

/// Map every region that was not premapped. The premapped ones are already
/// in place by now.
pub fn map_fresh_regions(kernel: &dyn Kernel, vmas: &[VmaDescriptor]) -> Result<()> {
    for vma in vmas {
        if vma.is_premapped() || vma.status.is_empty() {
            continue;
        }
        let addr = map_one_region(kernel, vma)?;
        if addr != vma.start {
            log!(LogError, "region {} landed at {:#x}", vma.range(), addr);
            return Err(RestoreError::MappingMismatch {
                want: vma.start,
                got: addr,
            });
        }
    }
    Ok(())
}

/// Drop the write permission added for population wherever the descriptor
/// does not carry it.
pub fn replay_protections(kernel: &dyn Kernel, vmas: &[VmaDescriptor]) -> Result<()> {
    for vma in vmas {
        if !vma.status.contains(VmaStatus::REGULAR) {
            continue;
        }
        if !vma.prot.contains(ProtFlags::PROT_WRITE) {
            kernel.mprotect(vma.start, vma.len(), vma.prot)?;
        }
    }
    Ok(())
}

/// Replay recorded madvise behaviors, one call per set bit.
pub fn replay_advice(kernel: &dyn Kernel, vmas: &[VmaDescriptor]) -> Result<()> {
    for vma in vmas {
        if vma.madv == 0 {
            continue;
        }
        for advice in 0..64 {
            if vma.madv & (1u64 << advice) != 0 {
                kernel.madvise(vma.start, vma.len(), advice as i32)?;
            }
        }
    }
    Ok(())
}
