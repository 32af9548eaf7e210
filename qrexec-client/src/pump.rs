//! Bidirectional stdio pump over a paired data channel.
//!
//! Grounded in `qrexec-client.c`'s `handle_input`/`handle_vchan_data`
//! `select()` loop: stdin is read in bounded chunks and forwarded as
//! `DATA_STDIN` records; a zero-length `DATA_STDIN` record signals EOF
//! (half-close) to the remote side, after which stdin is no longer
//! polled. `DATA_STDOUT`/`DATA_STDERR` records are written to the local
//! terminal, through the `-t`/`-T` [`crate::filter::replace_chars`] filter
//! when requested. `DATA_EXIT_CODE` ends the pump and yields the remote
//! process's exit code, truncated to a byte the way `exit()` truncates
//! any C `int` status.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use qrexec_proto::channel::Channel;
use qrexec_proto::message::MsgType;

use crate::error::Error;

/// Which output streams should go through the `-t`/`-T` escape filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterConfig {
    /// Filter `DATA_STDOUT` bytes before writing them (`-t`).
    pub stdout: bool,
    /// Filter `DATA_STDERR` bytes before writing them (`-T`).
    pub stderr: bool,
}

/// Chunk size read from stdin per iteration; bounds how much can be
/// in flight as a single `DATA_STDIN` record (spec §4.1's
/// `MAX_DATA_CHUNK`).
const STDIN_CHUNK: usize = 16 * 1024;

/// Runs the pump until the remote sends `DATA_EXIT_CODE`, returning the
/// process's exit code (truncated to `0..=255`, matching `exit()`'s
/// truncation of any wider status value).
pub async fn run<C, Stdin, Stdout, Stderr>(
    mut channel: C,
    mut stdin: Stdin,
    mut stdout: Stdout,
    mut stderr: Stderr,
    filter: FilterConfig,
) -> Result<i32, Error>
where
    C: Channel,
    Stdin: AsyncRead + Unpin,
    Stdout: AsyncWrite + Unpin,
    Stderr: AsyncWrite + Unpin,
{
    let mut stdin_open = true;
    let mut buf = vec![0u8; STDIN_CHUNK];

    loop {
        tokio::select! {
            n = stdin.read(&mut buf), if stdin_open => {
                match n {
                    Ok(0) => {
                        qrexec_proto::write_record(&mut channel, MsgType::DataStdin, &[]).await?;
                        stdin_open = false;
                    }
                    Ok(len) => {
                        qrexec_proto::write_record(&mut channel, MsgType::DataStdin, &buf[..len]).await?;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        stdin_open = false;
                    }
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            header = qrexec_proto::read_header(&mut channel) => {
                let header = header?;
                let body = qrexec_proto::read_body(&mut channel, header).await?;
                match header.msg_type {
                    MsgType::DataStdout => {
                        write_filtered(&mut stdout, body, filter.stdout).await?;
                    }
                    MsgType::DataStderr => {
                        write_filtered(&mut stderr, body, filter.stderr).await?;
                    }
                    MsgType::DataExitCode => {
                        let raw = decode_exit_code(&body);
                        return Ok(raw & 0xff);
                    }
                    other => {
                        return Err(Error::Protocol(qrexec_proto::Error::ProtocolViolation(format!(
                            "unexpected record {other:?} on data channel"
                        ))));
                    }
                }
            }
        }
    }
}

/// Runs the pump for the responder role: a service call fulfilled by a
/// locally spawned child process instead of a remote one (spec §4.8's
/// "symmetrically by the responder on service invocations"). Directions
/// are swapped relative to [`run`]: `DATA_STDIN` arriving from the peer is
/// written to the child's stdin, the child's stdout is framed as
/// `DATA_STDOUT`, and once the child exits its status becomes a
/// synthetic `DATA_EXIT_CODE` sent back to the peer — the initiator never
/// learns the difference between a remote process and a locally-fulfilled
/// service.
pub async fn run_responder<C, ChildStdin, ChildStdout, ChildStderr>(
    mut channel: C,
    mut child: tokio::process::Child,
    mut child_stdin: Option<ChildStdin>,
    mut child_stdout: ChildStdout,
    mut child_stderr: ChildStderr,
) -> Result<i32, Error>
where
    C: Channel,
    ChildStdin: AsyncWrite + Unpin,
    ChildStdout: AsyncRead + Unpin,
    ChildStderr: AsyncRead + Unpin,
{
    let mut out_buf = vec![0u8; STDIN_CHUNK];
    let mut err_buf = vec![0u8; STDIN_CHUNK];
    let mut stdout_open = true;
    let mut stderr_open = true;

    loop {
        tokio::select! {
            status = child.wait(), if !stdout_open && !stderr_open => {
                let status = status.map_err(Error::Io)?;
                let code = status.code().unwrap_or(1) & 0xff;
                qrexec_proto::write_record(&mut channel, MsgType::DataExitCode, &code.to_le_bytes()).await?;
                return Ok(code);
            }
            n = child_stdout.read(&mut out_buf), if stdout_open => {
                match n {
                    Ok(0) => {
                        qrexec_proto::write_record(&mut channel, MsgType::DataStdout, &[]).await?;
                        stdout_open = false;
                    }
                    Ok(len) => {
                        qrexec_proto::write_record(&mut channel, MsgType::DataStdout, &out_buf[..len]).await?;
                    }
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            n = child_stderr.read(&mut err_buf), if stderr_open => {
                match n {
                    Ok(0) => {
                        stderr_open = false;
                    }
                    Ok(len) => {
                        qrexec_proto::write_record(&mut channel, MsgType::DataStderr, &err_buf[..len]).await?;
                    }
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            header = qrexec_proto::read_header(&mut channel) => {
                let header = header?;
                let body = qrexec_proto::read_body(&mut channel, header).await?;
                match header.msg_type {
                    MsgType::DataStdin => {
                        if body.is_empty() {
                            child_stdin = None;
                        } else if let Some(stdin) = child_stdin.as_mut() {
                            stdin.write_all(&body).await?;
                        }
                    }
                    other => {
                        return Err(Error::Protocol(qrexec_proto::Error::ProtocolViolation(format!(
                            "unexpected record {other:?} on responder data channel"
                        ))));
                    }
                }
            }
        }
    }
}

async fn write_filtered<W: AsyncWrite + Unpin>(writer: &mut W, mut body: Vec<u8>, filter: bool) -> Result<(), Error> {
    if filter {
        crate::filter::replace_chars(&mut body);
    }
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Decodes a `DATA_EXIT_CODE` body. A short record (fewer than 4 bytes,
/// as a truncated or malformed peer might send) is not a protocol
/// violation here — spec §4.8 calls for treating it as exit code 255
/// rather than tearing the connection down over it.
fn decode_exit_code(body: &[u8]) -> i32 {
    match <[u8; 4]>::try_from(body) {
        Ok(arr) => i32::from_le_bytes(arr),
        Err(_) => 255,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrexec_proto::channel::test_util;

    #[tokio::test]
    async fn forwards_stdin_and_reports_exit_code() {
        let (mut remote, local) = test_util::pair(1024);
        let stdin = std::io::Cursor::new(b"hello".to_vec());
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let pump = tokio::spawn(async move {
            run(local, stdin, &mut stdout, &mut stderr, FilterConfig::default())
                .await
                .map(|code| (code, stdout, stderr))
        });

        let header = qrexec_proto::read_header(&mut remote).await.unwrap();
        assert_eq!(header.msg_type, MsgType::DataStdin);
        let body = qrexec_proto::read_body(&mut remote, header).await.unwrap();
        assert_eq!(body, b"hello");

        // stdin EOF -> zero-length DATA_STDIN
        let header = qrexec_proto::read_header(&mut remote).await.unwrap();
        assert_eq!(header.msg_type, MsgType::DataStdin);
        assert_eq!(header.len, 0);

        qrexec_proto::write_record(&mut remote, MsgType::DataStdout, b"out")
            .await
            .unwrap();
        qrexec_proto::write_record(&mut remote, MsgType::DataExitCode, &7i32.to_le_bytes())
            .await
            .unwrap();

        let (code, stdout, _stderr) = pump.await.unwrap().unwrap();
        assert_eq!(code, 7);
        assert_eq!(stdout, b"out");
    }

    #[tokio::test]
    async fn truncates_exit_code_to_a_byte() {
        let (mut remote, local) = test_util::pair(1024);
        let stdin = std::io::Cursor::new(Vec::new());
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let pump = tokio::spawn(async move {
            run(local, stdin, &mut stdout, &mut stderr, FilterConfig::default()).await
        });

        let header = qrexec_proto::read_header(&mut remote).await.unwrap();
        let _ = qrexec_proto::read_body(&mut remote, header).await.unwrap();

        qrexec_proto::write_record(&mut remote, MsgType::DataExitCode, &300i32.to_le_bytes())
            .await
            .unwrap();

        let code = pump.await.unwrap().unwrap();
        assert_eq!(code, 300 & 0xff);
    }

    #[tokio::test]
    async fn a_short_exit_code_record_is_treated_as_255() {
        let (mut remote, local) = test_util::pair(1024);
        let stdin = std::io::Cursor::new(Vec::new());
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let pump = tokio::spawn(async move {
            run(local, stdin, &mut stdout, &mut stderr, FilterConfig::default()).await
        });

        let header = qrexec_proto::read_header(&mut remote).await.unwrap();
        let _ = qrexec_proto::read_body(&mut remote, header).await.unwrap();

        qrexec_proto::write_record(&mut remote, MsgType::DataExitCode, &[7u8])
            .await
            .unwrap();

        let code = pump.await.unwrap().unwrap();
        assert_eq!(code, 255);
    }

    #[tokio::test]
    async fn filters_escape_bytes_from_stdout_when_requested() {
        let (mut remote, local) = test_util::pair(1024);
        let stdin = std::io::Cursor::new(Vec::new());
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let filter = FilterConfig {
            stdout: true,
            stderr: false,
        };

        let pump = tokio::spawn(async move {
            run(local, stdin, &mut stdout, &mut stderr, filter)
                .await
                .map(|code| (code, stdout))
        });

        let header = qrexec_proto::read_header(&mut remote).await.unwrap();
        let _ = qrexec_proto::read_body(&mut remote, header).await.unwrap();

        qrexec_proto::write_record(&mut remote, MsgType::DataStdout, &[0x1b, b'x'])
            .await
            .unwrap();
        qrexec_proto::write_record(&mut remote, MsgType::DataExitCode, &0i32.to_le_bytes())
            .await
            .unwrap();

        let (_code, stdout) = pump.await.unwrap().unwrap();
        assert_eq!(stdout, b"_x");
    }

    #[tokio::test]
    async fn responder_frames_child_stdout_and_reports_its_exit_code() {
        let (mut remote, local) = test_util::pair(1024);

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo hi; exit 3")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let child_stdin = child.stdin.take().unwrap();
        let child_stdout = child.stdout.take().unwrap();
        let child_stderr = child.stderr.take().unwrap();

        let pump = tokio::spawn(run_responder(local, child, Some(child_stdin), child_stdout, child_stderr));

        let header = qrexec_proto::read_header(&mut remote).await.unwrap();
        assert_eq!(header.msg_type, MsgType::DataStdout);
        let body = qrexec_proto::read_body(&mut remote, header).await.unwrap();
        assert_eq!(body, b"hi\n");

        // stdout EOF -> zero-length DATA_STDOUT
        let header = qrexec_proto::read_header(&mut remote).await.unwrap();
        assert_eq!(header.msg_type, MsgType::DataStdout);
        assert_eq!(header.len, 0);

        let header = qrexec_proto::read_header(&mut remote).await.unwrap();
        assert_eq!(header.msg_type, MsgType::DataExitCode);
        let body = qrexec_proto::read_body(&mut remote, header).await.unwrap();
        let code = i32::from_le_bytes(body.try_into().unwrap());
        assert_eq!(code, 3);

        pump.await.unwrap().unwrap();
    }
}
