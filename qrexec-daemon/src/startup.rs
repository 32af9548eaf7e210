//! Double-fork startup banner and readiness signalling.
//!
//! Grounded in `qrexec-daemon.c`'s `init()`: the parent process prints
//! `Waiting for VM's qrexec agent.....`, forks, and waits (with a timeout)
//! for the child to `SIGUSR1` it once the agent's control channel is up —
//! at which point the parent exits `0`. If the agent never connects within
//! `QREXEC_STARTUP_TIMEOUT` seconds the parent exits `3`; any earlier setup
//! failure in the child exits `1`. `QREXEC_STARTUP_NOWAIT=1` skips all of
//! this and runs the daemon directly in the foreground.
//!
//! All raw libc calls are confined to this module, the way `bux::sys` and
//! `bux::watchdog` confine theirs.

#![allow(unsafe_code)]

use std::time::Duration;

/// Exit code used when the parent gives up waiting for readiness.
pub const EXIT_STARTUP_TIMEOUT: i32 = 3;
/// Exit code used when the child fails before it can become ready.
pub const EXIT_CHILD_SETUP_FAILED: i32 = 1;

/// Default number of seconds the parent waits for the readiness signal,
/// overridden by `QREXEC_STARTUP_TIMEOUT` (spec §6).
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// What the forked child should do, after a successful double fork, before
/// signalling readiness.
pub enum Outcome {
    /// This process is the detached child; it should run the daemon and
    /// call [`signal_ready`] with `parent_pid` once its control socket is
    /// listening.
    Child {
        /// PID of the original parent process, waiting on `SIGUSR1`.
        parent_pid: libc::pid_t,
    },
    /// This process is the original parent; it has already waited for
    /// (or timed out on) the child's readiness signal and should exit
    /// with the given code.
    Parent {
        /// Process exit code the parent should use.
        exit_code: i32,
    },
}

/// Reads `QREXEC_STARTUP_TIMEOUT` (seconds) from the environment, falling
/// back to [`DEFAULT_STARTUP_TIMEOUT`].
#[must_use]
pub fn startup_timeout() -> Duration {
    std::env::var("QREXEC_STARTUP_TIMEOUT")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(DEFAULT_STARTUP_TIMEOUT, Duration::from_secs)
}

/// Whether `QREXEC_STARTUP_NOWAIT=1` is set, requesting the double-fork
/// dance be skipped entirely.
#[must_use]
pub fn startup_nowait() -> bool {
    std::env::var("QREXEC_STARTUP_NOWAIT").as_deref() == Ok("1")
}

/// Performs the double fork and, in the parent, blocks for up to
/// `timeout` waiting for a `SIGUSR1` from the child.
///
/// Returns [`Outcome::Child`] in the detached child process; the caller
/// there runs the daemon and must call [`signal_ready`] once its listening
/// socket is up, then continue running (it does not exit). Returns
/// [`Outcome::Parent`] in the original process, which should `exit` with
/// the contained code.
///
/// # Safety
///
/// Must be called before any threads are spawned: `fork()` in a
/// multi-threaded process only continues the calling thread in the child,
/// which is unsound to rely on once a tokio runtime exists.
pub unsafe fn double_fork(timeout: Duration) -> Outcome {
    // SAFETY: caller guarantees no other threads exist yet.
    let parent_pid = unsafe { libc::getpid() };

    install_sigusr1_handler();

    // SAFETY: fork() is async-signal-safe; the precondition (no other
    // threads) is the caller's responsibility per this function's contract.
    let first = unsafe { libc::fork() };
    if first < 0 {
        return Outcome::Parent {
            exit_code: EXIT_CHILD_SETUP_FAILED,
        };
    }
    if first > 0 {
        // Original parent: wait for SIGUSR1 from the (grand)child, or time out.
        let exit_code = wait_for_ready(parent_pid, timeout);
        return Outcome::Parent { exit_code };
    }

    // First child: detach a session and fork again so the daemon is
    // reparented to init/systemd rather than staying a child of the
    // original invoker.
    // SAFETY: single-threaded at this point, same as the parent's fork.
    unsafe { libc::setsid() };
    // SAFETY: same precondition as the first fork.
    let second = unsafe { libc::fork() };
    if second > 0 {
        // Intermediate process: nothing left to do but exit quietly.
        std::process::exit(0);
    }
    if second < 0 {
        std::process::exit(EXIT_CHILD_SETUP_FAILED);
    }

    Outcome::Child { parent_pid }
}

static READY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

extern "C" fn on_sigusr1(_: libc::c_int) {
    READY.store(true, std::sync::atomic::Ordering::SeqCst);
}

fn install_sigusr1_handler() {
    // SAFETY: installs a minimal async-signal-safe handler (an atomic
    // store) for SIGUSR1; `sigaction` with a plain function pointer and no
    // flags is the standard safe pattern for this.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigusr1 as usize;
        libc::sigemptyset(&raw mut action.sa_mask);
        libc::sigaction(libc::SIGUSR1, &raw const action, std::ptr::null_mut());
    }
}

fn wait_for_ready(_parent_pid: libc::pid_t, timeout: Duration) -> i32 {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if READY.load(std::sync::atomic::Ordering::SeqCst) {
            return 0;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    EXIT_STARTUP_TIMEOUT
}

/// Sends `SIGUSR1` to the process this daemon was originally invoked from,
/// indicating the control socket is ready. Called once from the detached
/// child after [`double_fork`] returns [`Outcome::Child`] and the socket
/// is listening.
///
/// # Safety
///
/// `target_pid` must still refer to the waiting ancestor process.
pub unsafe fn signal_ready(target_pid: libc::pid_t) {
    // SAFETY: kill() with a valid pid and a non-fatal signal is safe to
    // call from any point in the child's lifetime.
    unsafe {
        libc::kill(target_pid, libc::SIGUSR1);
    }
}
