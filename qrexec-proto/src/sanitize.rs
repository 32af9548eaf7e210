//! The only path by which bytes originating from a guest agent are allowed
//! to become a `String` the daemon or policy dispatcher acts on.
//!
//! Grounded in `qrexec-daemon.c`'s `sanitize_name`/`ENSURE_NULL_TERMINATED`:
//! every byte outside a small whitelist is rewritten to `_`, the buffer is
//! truncated at the first NUL (agents are untrusted; a missing terminator
//! must not read past the fixed buffer), and the result is always valid
//! UTF-8 ASCII. Per spec.md's Open Question, this crate rewrites rather than
//! rejects — two distinct offending inputs can collide on the same
//! sanitised output, and nothing here resolves that ambiguity; policy
//! matching downstream sees only the rewritten name.

use crate::message::{RawTriggerServiceParams, TRIGGER_FIELD_LEN};

/// A value that has passed through [`sanitize_field`] and is therefore safe
/// to log, match against policy, or pass to a subprocess argument list.
///
/// There is deliberately no way to construct this from an arbitrary
/// `String` outside this module's own sanitisation path — the type exists
/// so call sites downstream can require `Untrusted<T>: Into<Sanitized>`
/// instead of a plain `String`, making "did this get sanitised" a
/// compile-time question.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sanitized(String);

impl Sanitized {
    /// Borrows the sanitised string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Sanitized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wraps a value that originated from a guest agent and has not yet been
/// sanitised. The only operations available are those that sanitise it.
#[derive(Debug, Clone, Copy)]
pub struct Untrusted<T>(T);

impl<T> Untrusted<T> {
    /// Marks `value` as untrusted agent-originated data.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self(value)
    }
}

/// Extra characters, beyond `[A-Za-z0-9._-]`, allowed in a given field.
/// Mirrors the per-field whitelists `qrexec-daemon.c` applies: service
/// names may carry a `+`-separated argument, targets may be a `user@host`
/// or `@alias` form, and request identifiers may contain spaces (they are
/// built by concatenating multiple fields with `ENSURE_NULL_TERMINATED`).
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// A service name, e.g. `qubes.Filecopy+arg` — allows `+`.
    ServiceName,
    /// A target domain name or alias, e.g. `@default`, `user@host` —
    /// allows `@` and `:`.
    TargetDomain,
    /// A request identifier — allows a literal space.
    RequestId,
}

impl FieldKind {
    fn extra_allowed(self, byte: u8) -> bool {
        match self {
            Self::ServiceName => byte == b'+',
            Self::TargetDomain => byte == b'@' || byte == b':',
            Self::RequestId => byte == b' ',
        }
    }
}

fn base_allowed(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-')
}

/// Sanitises one fixed-size, zero-padded field buffer: truncates at the
/// first NUL, then rewrites every byte outside the whitelist (base set
/// plus `kind`'s extra allowance) to `_`.
#[must_use]
pub fn sanitize_field(untrusted: Untrusted<&[u8]>, kind: FieldKind) -> Sanitized {
    let raw = untrusted.0;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let mut out = Vec::with_capacity(end);
    for &byte in &raw[..end] {
        if base_allowed(byte) || kind.extra_allowed(byte) {
            out.push(byte);
        } else {
            out.push(b'_');
        }
    }
    Sanitized(String::from_utf8(out).expect("whitelist is a subset of ASCII"))
}

/// The sanitised counterpart to [`RawTriggerServiceParams`]: three fields
/// that have each passed through [`sanitize_field`] and are safe to match
/// against policy or forward to the policy dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerServiceParams {
    /// Sanitised service name.
    pub service_name: Sanitized,
    /// Sanitised target domain name or alias.
    pub target_domain: Sanitized,
    /// Sanitised request identifier.
    pub request_id: Sanitized,
}

impl TriggerServiceParams {
    /// Sanitises every field of a raw, agent-originated record.
    #[must_use]
    pub fn from_raw(raw: RawTriggerServiceParams) -> Self {
        Self {
            service_name: sanitize_field(Untrusted::new(&raw.service_name[..]), FieldKind::ServiceName),
            target_domain: sanitize_field(Untrusted::new(&raw.target_domain[..]), FieldKind::TargetDomain),
            request_id: sanitize_field(Untrusted::new(&raw.request_id[..]), FieldKind::RequestId),
        }
    }
}

const _: () = assert!(TRIGGER_FIELD_LEN > 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_at_first_nul() {
        let mut buf = [b'a'; TRIGGER_FIELD_LEN];
        buf[3] = 0;
        buf[4] = b'x';
        let out = sanitize_field(Untrusted::new(&buf[..]), FieldKind::ServiceName);
        assert_eq!(out.as_str(), "aaa");
    }

    #[test]
    fn rewrites_disallowed_bytes_to_underscore() {
        let mut buf = [0u8; TRIGGER_FIELD_LEN];
        let src = b"qubes.Filecopy;rm -rf /";
        buf[..src.len()].copy_from_slice(src);
        let out = sanitize_field(Untrusted::new(&buf[..]), FieldKind::ServiceName);
        assert_eq!(out.as_str(), "qubes.Filecopy_rm_-rf__");
    }

    #[test]
    fn service_name_allows_plus_but_not_target_domain() {
        let mut buf = [0u8; TRIGGER_FIELD_LEN];
        buf[0] = b'a';
        buf[1] = b'+';
        buf[2] = b'b';
        let as_service = sanitize_field(Untrusted::new(&buf[..]), FieldKind::ServiceName);
        assert_eq!(as_service.as_str(), "a+b");
        let as_target = sanitize_field(Untrusted::new(&buf[..]), FieldKind::TargetDomain);
        assert_eq!(as_target.as_str(), "a_b");
    }

    #[test]
    fn target_domain_allows_at_and_colon() {
        let mut buf = [0u8; TRIGGER_FIELD_LEN];
        let src = b"user@host:1";
        buf[..src.len()].copy_from_slice(src);
        let out = sanitize_field(Untrusted::new(&buf[..]), FieldKind::TargetDomain);
        assert_eq!(out.as_str(), "user@host:1");
    }

    #[test]
    fn distinct_inputs_can_collide_after_sanitisation() {
        let mut a = [0u8; TRIGGER_FIELD_LEN];
        let mut b = [0u8; TRIGGER_FIELD_LEN];
        a[..2].copy_from_slice(b"a;");
        b[..2].copy_from_slice(b"a:");
        let sa = sanitize_field(Untrusted::new(&a[..]), FieldKind::ServiceName);
        let sb = sanitize_field(Untrusted::new(&b[..]), FieldKind::ServiceName);
        assert_eq!(sa, sb);
    }

    #[test]
    fn from_raw_sanitises_all_three_fields() {
        let raw = RawTriggerServiceParams::from_strs("qubes.Filecopy+x", "@default", "req 1");
        let params = TriggerServiceParams::from_raw(raw);
        assert_eq!(params.service_name.as_str(), "qubes.Filecopy+x");
        assert_eq!(params.target_domain.as_str(), "@default");
        assert_eq!(params.request_id.as_str(), "req 1");
    }
}
