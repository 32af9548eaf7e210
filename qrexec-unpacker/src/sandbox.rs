//! Privilege drop and chroot setup for the incoming file-copy transfer.
//!
//! Grounded in `qfile-dom0-unpacker.c`'s `prepare_creds_return_uid` and the
//! `mkdir`/`chdir`/`chroot`/`setuid` sequence in `main`: resolve the target
//! user (by name, falling back to a numeric uid), set `$HOME`/`$USER`,
//! adopt the user's gid and supplementary groups, raise `fsuid` so the
//! incoming directory can be created and written as that user, then chroot
//! into it and only at the very end drop the real uid — `setfsuid` first
//! is deliberate: it lets file creation inside the chroot happen as the
//! target user while the process is still privileged enough to chroot.
//!
//! All raw libc/nix syscalls live in this module, the way `bux::sys`
//! confines its `krun_*` FFI calls.

#![allow(unsafe_code)]

use std::path::Path;

use nix::unistd::{Gid, Uid, User};

use crate::error::Error;

fn privilege(op: &'static str, result: nix::Result<()>) -> Result<(), Error> {
    result.map_err(|source| Error::Privilege { op, source })
}

/// Resolves `spec` as a user name first, then as a numeric uid, matching
/// `prepare_creds_return_uid`'s `getpwnam` → `getpwuid(atoi(...))` fallback.
pub fn resolve_user(spec: &str) -> Result<User, Error> {
    if let Some(user) = User::from_name(spec).map_err(|source| Error::Privilege {
        op: "getpwnam",
        source,
    })? {
        return Ok(user);
    }
    if let Ok(uid) = spec.parse::<u32>() {
        if let Some(user) = User::from_uid(Uid::from_raw(uid)).map_err(|source| Error::Privilege {
            op: "getpwuid",
            source,
        })? {
            return Ok(user);
        }
    }
    Err(Error::UnknownUser(spec.to_owned()))
}

/// Sets `$HOME`/`$USER`, the process gid and supplementary groups, and
/// raises `fsuid` to `user`. Must run before [`enter_chroot`], while the
/// process still has privilege to change these.
pub fn adopt_user_environment(user: &User) -> Result<(), Error> {
    // SAFETY: `std::env::set_var` from a single-threaded early-startup
    // context, before any other thread could observe a torn read — the
    // same precondition `qrexec-daemon`'s `double_fork` documents for its
    // own pre-runtime setup.
    unsafe {
        std::env::set_var("HOME", &user.dir);
        std::env::set_var("USER", &user.name);
    }

    privilege("setgid", nix::unistd::setgid(user.gid))?;
    privilege(
        "initgroups",
        nix::unistd::initgroups(
            std::ffi::CString::new(user.name.as_str())
                .expect("passwd usernames are NUL-free")
                .as_c_str(),
            user.gid,
        ),
    )?;
    set_fsuid(user.uid);
    Ok(())
}

/// Raises the filesystem uid to `uid` (`setfsuid(2)`), so files created
/// from here on are owned by the target user. `setfsuid` has no error
/// return distinguishable from success (it always returns the previous
/// fsuid), matching the original's best-effort treatment.
fn set_fsuid(uid: Uid) {
    // SAFETY: `setfsuid` takes a plain integer uid and has no memory-safety
    // precondition; it is a simple per-thread-credential syscall.
    unsafe {
        libc::setfsuid(uid.as_raw());
    }
}

/// Creates `dir` with mode `0700` if it doesn't already exist, matching
/// `mkdir(incoming_dir, 0700)` (the original ignores a pre-existing
/// directory's `EEXIST`, relying on the caller to have chosen a fresh
/// per-transfer path).
pub fn prepare_incoming_dir(dir: &Path) -> Result<(), Error> {
    use std::os::unix::fs::DirBuilderExt;
    match std::fs::DirBuilder::new().mode(0o700).create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// `chdir(dir)` then `chroot(dir)`, in that order — `chroot` alone would
/// leave the working directory outside the new root.
pub fn enter_chroot(dir: &Path) -> Result<(), Error> {
    privilege("chdir", nix::unistd::chdir(dir))?;
    privilege("chroot", nix::unistd::chroot(dir))?;
    Ok(())
}

/// Drops the real uid to `uid` (`setuid(2)`). Must run last, after
/// [`enter_chroot`]: once this succeeds the process can never regain
/// privilege, per `setuid`'s usual irrevocability when dropping from root.
pub fn drop_real_uid(uid: Uid) -> Result<(), Error> {
    privilege("setuid", nix::unistd::setuid(uid))
}

/// Bytes free on the filesystem containing `dir`, read via `statvfs(2)`.
/// Called after [`enter_chroot`] in `main`, the same ordering the original
/// uses (even though `incoming_dir`'s absolute path is, post-chroot, being
/// re-resolved under the new root — harmless since it is the new root
/// itself).
pub fn free_space_bytes(dir: &Path) -> Result<u64, Error> {
    let stat = nix::sys::statvfs::statvfs(dir).map_err(|source| Error::Privilege {
        op: "statvfs",
        source,
    })?;
    Ok(stat.blocks_free() * stat.fragment_size())
}
