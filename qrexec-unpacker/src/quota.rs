//! Byte/file count limits for the incoming transfer, and the free-space
//! arithmetic that bounds them.
//!
//! Grounded in `qfile-dom0-unpacker.c`'s `main`: the byte limit defaults to
//! the lesser of 90% of the destination filesystem's free space and a
//! fixed compiled-in default; either limit can be overridden wholesale by
//! an environment variable, bypassing the free-space computation entirely
//! (spec §4.9, §6).

/// Compiled-in default byte limit (`DEFAULT_MAX_UPDATES_BYTES`, 4 GiB in
/// the original).
pub const DEFAULT_MAX_BYTES: u64 = 4 << 30;

/// Compiled-in default file-count limit (`DEFAULT_MAX_UPDATES_FILES`).
pub const DEFAULT_MAX_FILES: u64 = 2048;

/// The margin (in bytes) `do_unpack()` should leave free on disk while
/// writing, once `-w` requests wait-for-space behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitForSpace {
    /// `-w` was not given: proceed without waiting for free space.
    Disabled,
    /// `-w [margin]` was given; `do_unpack()` should pause writes until at
    /// least this many bytes are free. A bare `-w` with no value uses a
    /// margin of `1` byte, matching the original's `set_wait_for_space(1)`.
    Enabled {
        /// Bytes of headroom to maintain.
        margin: u64,
    },
}

/// Byte and file-count limits to hand to the (out-of-scope) unpack
/// routine, plus whether it should wait for free space while writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum total bytes the transfer may write.
    pub max_bytes: u64,
    /// Maximum number of files the transfer may create.
    pub max_files: u64,
    /// Wait-for-space behaviour requested via `-w`.
    pub wait_for_space: WaitForSpace,
}

/// Computes the byte limit: `override_bytes` if given (from
/// `UPDATES_MAX_BYTES`), else `min(90% of free_space_bytes,
/// DEFAULT_MAX_BYTES)`.
#[must_use]
pub fn resolve_max_bytes(free_space_bytes: u64, override_bytes: Option<u64>) -> u64 {
    if let Some(bytes) = override_bytes {
        return bytes;
    }
    let ninety_percent = free_space_bytes / 10 * 9;
    ninety_percent.min(DEFAULT_MAX_BYTES)
}

/// Computes the file-count limit: `override_files` if given (from
/// `UPDATES_MAX_FILES`), else [`DEFAULT_MAX_FILES`].
#[must_use]
pub fn resolve_max_files(override_files: Option<u64>) -> u64 {
    override_files.unwrap_or(DEFAULT_MAX_FILES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_default_to_ninety_percent_of_free_space_when_smaller() {
        // 1 GiB free -> 90% = ~0.9 GiB, well under the 4 GiB default.
        let free = 1 << 30;
        assert_eq!(resolve_max_bytes(free, None), free / 10 * 9);
    }

    #[test]
    fn bytes_cap_at_the_compiled_in_default_on_a_huge_filesystem() {
        let free = 1_000 << 30; // 1000 GiB free
        assert_eq!(resolve_max_bytes(free, None), DEFAULT_MAX_BYTES);
    }

    #[test]
    fn env_override_bypasses_the_free_space_computation() {
        let free = 1 << 30;
        assert_eq!(resolve_max_bytes(free, Some(123)), 123);
    }

    #[test]
    fn files_default_to_the_compiled_in_default() {
        assert_eq!(resolve_max_files(None), DEFAULT_MAX_FILES);
    }

    #[test]
    fn files_override_wins() {
        assert_eq!(resolve_max_files(Some(7)), 7);
    }
}
