//! The seam this helper hands off to once sandboxing is complete.
//!
//! spec §1 lists "the actual file-copy packer/unpacker" as an external
//! collaborator — "a separate library API" this component calls into but
//! does not implement. [`Unpack`] is that seam; [`StdinUnpack`] is a
//! minimal, crate-local stand-in so the binary is runnable end to end
//! without vendoring the real transfer-format parser.

use std::io::Read;

use crate::quota::{Limits, WaitForSpace};

/// The out-of-scope unpack routine this helper calls once it has dropped
/// privileges, chrooted, and computed quota limits.
pub trait Unpack {
    /// Consumes the incoming transfer from `source` within `limits`,
    /// returning the process exit code `do_unpack()` would have produced.
    fn run(&self, source: &mut dyn Read, limits: Limits, verbose: bool) -> std::io::Result<i32>;
}

/// Reads the incoming transfer from stdin, enforcing only the byte
/// ceiling locally (file-count and the real on-wire file-copy framing are
/// the real library's job, out of scope here per spec §1).
///
/// `limits.wait_for_space` is not exercised by this stand-in: the real
/// `-w` pause-below-margin behaviour needs a destination filesystem to
/// poll free space on, and this stand-in never writes one — it only
/// counts bytes read from `source`. The margin is logged, not acted on.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinUnpack;

impl Unpack for StdinUnpack {
    fn run(&self, source: &mut dyn Read, limits: Limits, verbose: bool) -> std::io::Result<i32> {
        if verbose {
            if let WaitForSpace::Enabled { margin } = limits.wait_for_space {
                tracing::debug!(margin, "wait-for-space requested but not exercised by this stand-in");
            }
        }
        let mut remaining = limits.max_bytes;
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            if want == 0 {
                if verbose {
                    tracing::warn!(limit = limits.max_bytes, "byte limit reached, truncating transfer");
                }
                return Ok(1);
            }
            let n = source.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            total += n as u64;
            remaining -= n as u64;
        }
        if verbose {
            tracing::info!(bytes = total, "transfer complete");
        }
        Ok(0)
    }
}
