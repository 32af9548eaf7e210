//! The `-t`/`-T` byte-replacement filter.
//!
//! Grounded in `qrexec-client.c`'s `do_replace_chars`: when the remote
//! side is a terminal (`-t` filters stdout, `-T` filters stderr), any byte
//! that isn't printable ASCII or one of the allowed control characters
//! (`\t \n \r \b \a`) is rewritten to `_` before being written to the
//! local terminal, so a hostile remote can't smuggle escape sequences
//! into the user's terminal emulator.

/// Rewrites `buf` in place, replacing any byte outside printable ASCII
/// (`0x20..=0x7e`) or the allowed controls `\t`/`\n`/`\r`/`\b`/`\a` with `_`.
pub fn replace_chars(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        let printable = matches!(*byte, 0x20..=0x7e);
        let allowed_control = matches!(*byte, b'\t' | b'\n' | b'\r' | 0x08 | 0x07);
        if !printable && !allowed_control {
            *byte = b'_';
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_printable_ascii_and_allowed_controls_untouched() {
        let mut buf = b"hello\tworld\n\r\x08\x07".to_vec();
        let original = buf.clone();
        replace_chars(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn rewrites_escape_sequences_but_not_bell() {
        let mut buf = vec![0x1b, b'[', b'3', b'1', b'm', 0x07];
        replace_chars(&mut buf);
        assert_eq!(buf, b"_[31m\x07");
    }
}
