//! Linux user and mount namespace handling.

// Some of the code in this file is inspired by Birdcage:
// https://github.com/phylum-dev/birdcage/blob/main/src/linux/namespaces.rs

use std::path::Path;
use std::{env, fs, io};

use rustix::mount;
use rustix::thread::{self, UnshareFlags};

use crate::config::Identity;

/// Process-wide kernel operations used while entering the jail.
///
/// Every method acts on the calling process.
pub trait Host {
    /// Move into a new, unmapped user namespace.
    fn unshare_user(&mut self) -> io::Result<()>;

    /// Move into a new mount namespace.
    fn unshare_mount(&mut self) -> io::Result<()>;

    /// Map the calling user and group to root in its own user namespace.
    fn map_self(&mut self, outside_uid: u32, outside_gid: u32) -> io::Result<()>;

    /// Bind mount `source` on top of `target`.
    fn bind_mount(&mut self, source: &Path, target: &Path) -> io::Result<()>;

    /// Change the root directory to `path` and move to the new root.
    fn chroot(&mut self, path: &Path) -> io::Result<()>;

    /// Change the working directory.
    fn chdir(&mut self, path: &Path) -> io::Result<()>;

    /// Set real, effective and saved uid and gid.
    fn set_identity(&mut self, identity: Identity) -> io::Result<()>;
}

/// The running Linux kernel.
pub struct Linux;

impl Host for Linux {
    fn unshare_user(&mut self) -> io::Result<()> {
        thread::unshare(UnshareFlags::NEWUSER)?;
        Ok(())
    }

    fn unshare_mount(&mut self) -> io::Result<()> {
        thread::unshare(UnshareFlags::NEWNS)?;
        Ok(())
    }

    fn map_self(&mut self, outside_uid: u32, outside_gid: u32) -> io::Result<()> {
        map_ids(outside_uid, outside_gid)
    }

    fn bind_mount(&mut self, source: &Path, target: &Path) -> io::Result<()> {
        mount::mount_bind(source, target)?;
        Ok(())
    }

    fn chroot(&mut self, path: &Path) -> io::Result<()> {
        rustix::process::chroot(path)?;
        env::set_current_dir("/")
    }

    fn chdir(&mut self, path: &Path) -> io::Result<()> {
        env::set_current_dir(path)
    }

    fn set_identity(&mut self, identity: Identity) -> io::Result<()> {
        // The group has to change first, since dropping the uid loses CAP_SETGID.
        let Identity { uid, gid } = identity;
        if unsafe { libc::setresgid(gid, gid, gid) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::setresuid(uid, uid, uid) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Update /proc uid/gid maps of the current process.
///
/// Without the setuid map helpers, a process may only map its own outside
/// ids into its user namespace.
fn map_ids(outside_uid: u32, outside_gid: u32) -> io::Result<()> {
    let uid_map = format!("0 {outside_uid} 1\n");
    let gid_map = format!("0 {outside_gid} 1\n");
    fs::write("/proc/self/uid_map", uid_map.as_bytes())?;
    fs::write("/proc/self/setgroups", b"deny")?;
    fs::write("/proc/self/gid_map", gid_map.as_bytes())?;
    Ok(())
}
