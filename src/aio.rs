//! Async-IO context restoration. An aio ring is kernel memory mapped into
//! the process at an address the restored code holds on to, so a fresh
//! io_setup whose ring lands elsewhere is moved into place with mremap.
//! The ring size is fixed by the kernel for a given event count, which
//! makes a size-mismatched move fail loudly instead of corrupting the ring.

use crate::kernel::Kernel;
use crate::log::LogLevel::*;
use crate::restore_args::AioRingRecord;
use crate::{Result, RestoreError};

pub fn restore_aio_rings(kernel: &dyn Kernel, rings: &[AioRingRecord]) -> Result<()> {
    for r in rings {
        let ctx = kernel.io_setup(r.nr_req)?;
        if ctx != r.ctx_addr {
            log!(LogDebug, "aio ring at {:#x}, moving to {:#x}", ctx, r.ctx_addr);
            let moved = kernel.mremap_fixed(ctx, r.len, r.ctx_addr)?;
            if moved != r.ctx_addr {
                return Err(RestoreError::MappingMismatch {
                    want: r.ctx_addr,
                    got: moved,
                });
            }
        }
        // A relocated context must still answer as an empty ring; anything
        // else means the kernel lost track of it.
        if kernel.io_events_ready(r.ctx_addr)? != 0 {
            return Err(RestoreError::AioRingBroken { ctx: r.ctx_addr });
        }
    }
    Ok(())
}
