//! Fixed-layout header and body records for the qrexec wire protocol.
//!
//! Every record is a [`Header`] (8 bytes: a `u32` type tag, a `u32` length)
//! followed by a body whose shape is determined by the type tag. Bodies are
//! encoded little-endian with fixed-width fields and fixed-size,
//! zero-padded ASCII buffers for string-like fields — this is a from-scratch
//! wire format, not a serde/postcard framing, because the body layouts here
//! must match fixed-size C-struct-like records on both sides of the control
//! channel (see [`crate::channel`]).

use crate::Error;

/// Upper bound on any record body, including framed stdio chunks.
pub const MAX_DATA_CHUNK: u32 = 64 * 1024;

/// Fixed size of the `ident` buffer in [`ServiceParams`].
pub const SERVICE_IDENT_LEN: usize = 32;
/// Fixed size of each string buffer in [`TriggerServiceParams`].
pub const TRIGGER_FIELD_LEN: usize = 32;

/// Protocol version this crate speaks. Bumped on incompatible wire changes.
pub const PROTOCOL_VERSION: u32 = 3;

/// Closed set of record types exchanged on the control channel, the local
/// client socket, and data channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[non_exhaustive]
pub enum MsgType {
    /// Peer-info handshake record, sent first on every new connection.
    Hello = 0x70,
    /// Client requests a command run with its own stdio piped through.
    ExecCmdline = 0x71,
    /// Client requests a command run without stdio piping.
    JustExec = 0x72,
    /// Client (or the disposable side of a triggered service) wants to join
    /// an existing data channel by request identifier.
    ServiceConnect = 0x73,
    /// Daemon tells the agent a triggered service was denied.
    ServiceRefused = 0x74,
    /// Agent asks the daemon to evaluate policy for a named service.
    TriggerService = 0x75,
    /// Agent reports that the connection using a given port has ended.
    ConnectionTerminated = 0x76,
    /// A chunk of stdin data (or, on a service-answering data channel, the
    /// "stdout" direction reinterpreted — see spec §4.8).
    DataStdin = 0x77,
    /// A chunk of stdout data.
    DataStdout = 0x78,
    /// A chunk of stderr data.
    DataStderr = 0x79,
    /// Terminal record on a data channel: the remote process's exit code.
    DataExitCode = 0x7a,
}

impl MsgType {
    /// Decodes a raw type tag, rejecting anything outside the closed set.
    pub fn from_u32(raw: u32) -> Result<Self, Error> {
        Ok(match raw {
            0x70 => Self::Hello,
            0x71 => Self::ExecCmdline,
            0x72 => Self::JustExec,
            0x73 => Self::ServiceConnect,
            0x74 => Self::ServiceRefused,
            0x75 => Self::TriggerService,
            0x76 => Self::ConnectionTerminated,
            0x77 => Self::DataStdin,
            0x78 => Self::DataStdout,
            0x79 => Self::DataStderr,
            0x7a => Self::DataExitCode,
            other => return Err(Error::ProtocolViolation(format!("unknown msg type 0x{other:x}"))),
        })
    }
}

/// The 8-byte record header: a type tag plus a body length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Record type.
    pub msg_type: MsgType,
    /// Body length in bytes. Upper-bounded by [`MAX_DATA_CHUNK`]; exact
    /// per-type length is the caller's responsibility (spec §4.1).
    pub len: u32,
}

impl Header {
    /// Wire size of a header record.
    pub const WIRE_LEN: usize = 8;

    /// Builds a header, rejecting an oversize length up front.
    pub fn new(msg_type: MsgType, len: u32) -> Result<Self, Error> {
        if len > MAX_DATA_CHUNK {
            return Err(Error::ProtocolViolation(format!(
                "body length {len} exceeds MAX_DATA_CHUNK"
            )));
        }
        Ok(Self { msg_type, len })
    }

    pub fn encode(self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..4].copy_from_slice(&(self.msg_type as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn decode(buf: [u8; Self::WIRE_LEN]) -> Result<Self, Error> {
        let raw_type = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
        let len = u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes"));
        let msg_type = MsgType::from_u32(raw_type)?;
        Header::new(msg_type, len)
    }
}

/// Peer-info body exchanged during [`MsgType::Hello`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    /// Protocol version offered by the sending side.
    pub version: u32,
}

impl PeerInfo {
    /// Wire size of this body.
    pub const WIRE_LEN: usize = 4;

    /// Builds a peer-info record advertising [`PROTOCOL_VERSION`].
    #[must_use]
    pub const fn ours() -> Self {
        Self {
            version: PROTOCOL_VERSION,
        }
    }

    pub fn encode(self) -> [u8; Self::WIRE_LEN] {
        self.version.to_le_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let arr: [u8; Self::WIRE_LEN] = buf
            .try_into()
            .map_err(|_| Error::ProtocolViolation("short peer-info body".into()))?;
        Ok(Self {
            version: u32::from_le_bytes(arr),
        })
    }
}

/// Exec-params body: the target domain and data-channel port of a call.
///
/// `connect_port == 0` from a client means "daemon, please allocate one".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecParams {
    /// Domain id the data channel connects to.
    pub connect_domain: i32,
    /// Data-channel port, or 0 to request allocation.
    pub connect_port: u32,
}

impl ExecParams {
    /// Wire size of this body.
    pub const WIRE_LEN: usize = 8;

    pub fn encode(self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..4].copy_from_slice(&self.connect_domain.to_le_bytes());
        buf[4..8].copy_from_slice(&self.connect_port.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != Self::WIRE_LEN {
            return Err(Error::ProtocolViolation("short exec-params body".into()));
        }
        Ok(Self {
            connect_domain: i32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
            connect_port: u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")),
        })
    }
}

/// Service-params body: a fixed-size, zero-terminated ASCII request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceParams {
    /// Raw fixed-size identifier buffer, zero-padded.
    pub ident: [u8; SERVICE_IDENT_LEN],
}

impl ServiceParams {
    /// Wire size of this body.
    pub const WIRE_LEN: usize = SERVICE_IDENT_LEN;

    /// Builds a service-params body from a string, truncating and
    /// zero-terminating it to fit the fixed buffer.
    #[must_use]
    pub fn from_str(ident: &str) -> Self {
        let mut buf = [0u8; SERVICE_IDENT_LEN];
        let bytes = ident.as_bytes();
        let n = bytes.len().min(SERVICE_IDENT_LEN - 1);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self { ident: buf }
    }

    /// Returns the identifier as a `&str`, up to its first NUL byte.
    #[must_use]
    pub fn as_str(&self) -> &str {
        let end = self.ident.iter().position(|&b| b == 0).unwrap_or(self.ident.len());
        std::str::from_utf8(&self.ident[..end]).unwrap_or("")
    }

    pub fn encode(self) -> [u8; Self::WIRE_LEN] {
        self.ident
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let ident: [u8; SERVICE_IDENT_LEN] = buf
            .try_into()
            .map_err(|_| Error::ProtocolViolation("short service-params body".into()))?;
        Ok(Self { ident })
    }
}

/// Encodes an `EXEC_CMDLINE`/`JUST_EXEC` body: the fixed [`ExecParams`]
/// prefix followed by a NUL-terminated command-line string — a flexible
/// array member in the original C struct, so the body's total length
/// varies with `cmdline`'s length (spec §4.4's "adjusting the forwarded
/// record's length accordingly" refers to this tail).
#[must_use]
pub fn encode_exec_request(connect_domain: i32, connect_port: u32, cmdline: &str) -> Vec<u8> {
    let params = ExecParams {
        connect_domain,
        connect_port,
    };
    let mut buf = Vec::with_capacity(ExecParams::WIRE_LEN + cmdline.len() + 1);
    buf.extend_from_slice(&params.encode());
    buf.extend_from_slice(cmdline.as_bytes());
    buf.push(0);
    buf
}

/// Decodes an `EXEC_CMDLINE`/`JUST_EXEC` body produced by
/// [`encode_exec_request`], returning the fixed fields and the
/// NUL-terminated command-line tail as a `String`.
pub fn decode_exec_request(buf: &[u8]) -> Result<(ExecParams, String), Error> {
    if buf.len() < ExecParams::WIRE_LEN + 1 {
        return Err(Error::ProtocolViolation("short exec-cmdline body".into()));
    }
    let params = ExecParams::decode(&buf[..ExecParams::WIRE_LEN])?;
    let tail = &buf[ExecParams::WIRE_LEN..];
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    let cmdline = std::str::from_utf8(&tail[..end])
        .map_err(|_| Error::ProtocolViolation("non-UTF-8 cmdline".into()))?
        .to_owned();
    Ok((params, cmdline))
}

/// Trigger-service body: three fixed-size zero-terminated ASCII buffers as
/// sent by the agent. This is the **untrusted** shape — see
/// [`crate::sanitize`] for the only path that turns it into a
/// [`TriggerServiceParams`] fit for use.
#[derive(Debug, Clone, Copy)]
pub struct RawTriggerServiceParams {
    /// Service name, e.g. `qubes.Filecopy+arg`.
    pub service_name: [u8; TRIGGER_FIELD_LEN],
    /// Target domain name or alias, e.g. `@default`.
    pub target_domain: [u8; TRIGGER_FIELD_LEN],
    /// Request identifier correlating this trigger with a later
    /// `SERVICE_CONNECT`.
    pub request_id: [u8; TRIGGER_FIELD_LEN],
}

impl RawTriggerServiceParams {
    /// Wire size of this body.
    pub const WIRE_LEN: usize = TRIGGER_FIELD_LEN * 3;

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != Self::WIRE_LEN {
            return Err(Error::ProtocolViolation(
                "short trigger-service-params body".into(),
            ));
        }
        let mut service_name = [0u8; TRIGGER_FIELD_LEN];
        let mut target_domain = [0u8; TRIGGER_FIELD_LEN];
        let mut request_id = [0u8; TRIGGER_FIELD_LEN];
        service_name.copy_from_slice(&buf[0..TRIGGER_FIELD_LEN]);
        target_domain.copy_from_slice(&buf[TRIGGER_FIELD_LEN..2 * TRIGGER_FIELD_LEN]);
        request_id.copy_from_slice(&buf[2 * TRIGGER_FIELD_LEN..3 * TRIGGER_FIELD_LEN]);
        Ok(Self {
            service_name,
            target_domain,
            request_id,
        })
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn encode(self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..TRIGGER_FIELD_LEN].copy_from_slice(&self.service_name);
        buf[TRIGGER_FIELD_LEN..2 * TRIGGER_FIELD_LEN].copy_from_slice(&self.target_domain);
        buf[2 * TRIGGER_FIELD_LEN..3 * TRIGGER_FIELD_LEN].copy_from_slice(&self.request_id);
        buf
    }

    /// Builds a raw (unsanitised) record from plain strings, for tests and
    /// for constructing outbound triggers in test harnesses.
    #[cfg(any(test, feature = "test-util"))]
    #[must_use]
    pub fn from_strs(service_name: &str, target_domain: &str, request_id: &str) -> Self {
        fn pack(s: &str) -> [u8; TRIGGER_FIELD_LEN] {
            let mut buf = [0u8; TRIGGER_FIELD_LEN];
            let bytes = s.as_bytes();
            let n = bytes.len().min(TRIGGER_FIELD_LEN - 1);
            buf[..n].copy_from_slice(&bytes[..n]);
            buf
        }
        Self {
            service_name: pack(service_name),
            target_domain: pack(target_domain),
            request_id: pack(request_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_request_round_trips_domain_port_and_cmdline() {
        let body = encode_exec_request(4, 513, "user:echo hi");
        let (params, cmdline) = decode_exec_request(&body).unwrap();
        assert_eq!(params.connect_domain, 4);
        assert_eq!(params.connect_port, 513);
        assert_eq!(cmdline, "user:echo hi");
    }

    #[test]
    fn exec_request_rejects_a_body_shorter_than_the_fixed_prefix() {
        assert!(decode_exec_request(&[0u8; 4]).is_err());
    }
}
