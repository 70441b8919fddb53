//! Jail entry.
//!
//! The calling process becomes the jailed "primary" process. When subordinate
//! ids are mapped, a helper is forked first which stays behind in the original
//! user namespace, since only a process outside of the new namespace may
//! write its id maps:
//!
//! ```text
//!  primary                              helper
//!     │ fork()                             │
//!     │───────────────────────────────────>│
//!     │ unshare(CLONE_NEWUSER)             │
//!     │            Request::Unshared       │
//!     │───────────────────────────────────>│ newuidmap, setgroups, newgidmap
//!     │            Reply::Mapped           │
//!     │<───────────────────────────────────│ _exit
//!     │ waitpid()                          ┴
//!     │ unshare(CLONE_NEWNS)
//!     │ bind mounts, qemu, chroot, chdir, setresgid/setresuid
//!     ┴
//! ```

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{IdMapping, JailConfig, Severity};
use crate::error::JailError;
use crate::handshake::{self, Endpoint, Reply, Request};
use crate::helper::{self, HelperPlan, SetuidTools};
use crate::mounts::{self, MountReport};
use crate::namespaces::{Host, Linux};

/// Progress of the jail setup, in order.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Stage {
    Init,
    UserNamespace,
    Mapped,
    MountNamespace,
    Mounted,
    Chrooted,
    Ready,
}

/// State of the calling process during and after jail entry.
#[derive(Debug)]
pub struct JailContext {
    stage: Stage,
    /// Whether the process has its own mount namespace.
    pub mount_namespace: bool,
    pub mounts: MountReport,
}

impl JailContext {
    fn new() -> Self {
        Self { stage: Stage::Init, mount_namespace: false, mounts: MountReport::default() }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, stage: Stage) {
        debug_assert!(stage > self.stage, "jail stage {stage:?} after {:?}", self.stage);
        debug!("Jail stage: {stage:?}");
        self.stage = stage;
    }
}

/// Source of the id maps for the new user namespace.
pub trait IdMapSource {
    /// Map ids into the freshly unshared user namespace.
    fn map(&mut self, host: &mut impl Host) -> Result<(), JailError>;

    /// Give up before the user namespace was created.
    fn abort(&mut self);
}

/// Map only the calling user and group, without any helper.
pub struct SelfMap {
    pub uid: u32,
    pub gid: u32,
}

impl IdMapSource for SelfMap {
    fn map(&mut self, host: &mut impl Host) -> Result<(), JailError> {
        host.map_self(self.uid, self.gid).map_err(JailError::IdMapWriteFailed)
    }

    fn abort(&mut self) {}
}

/// Primary side of the handshake with the id map helper.
pub struct HelperHandshake<E: Endpoint> {
    endpoint: E,
    helper: Option<HelperChild>,
    timeout: Option<Duration>,
}

impl<E: Endpoint> HelperHandshake<E> {
    /// Talk to a helper through `endpoint`.
    ///
    /// The `helper` process, if any, is reaped once the handshake is over.
    pub fn new(endpoint: E, helper: Option<HelperChild>, timeout: Option<Duration>) -> Self {
        Self { endpoint, helper, timeout }
    }

    fn reap(&mut self) {
        if let Some(helper) = self.helper.take() {
            helper.wait();
        }
    }
}

impl<E: Endpoint> IdMapSource for HelperHandshake<E> {
    fn map(&mut self, _host: &mut impl Host) -> Result<(), JailError> {
        debug!("Waiting for helper to set my uid/gid map");
        self.endpoint.send_request(Request::Unshared).map_err(JailError::Handshake)?;

        let reply = self.endpoint.recv_reply(self.timeout);
        if let Err(err) = &reply {
            if err.kind() == io::ErrorKind::TimedOut {
                if let Some(helper) = self.helper.take() {
                    helper.kill();
                }
                return Err(JailError::HandshakeTimeout(self.timeout.unwrap_or_default()));
            }
        }
        self.reap();

        match reply.map_err(JailError::Handshake)? {
            Reply::Mapped => {
                debug!("Helper has finished setting my uid/gid map");
                Ok(())
            },
            Reply::Failed(failure) => Err(failure.into()),
        }
    }

    fn abort(&mut self) {
        if let Err(err) = self.endpoint.send_request(Request::Abort) {
            warn!("Failed to notify helper: {err}");
        }
        self.reap();
    }
}

impl<E: Endpoint> Drop for HelperHandshake<E> {
    fn drop(&mut self) {
        if let Some(helper) = self.helper.take() {
            helper.kill();
        }
    }
}

/// Forked id map helper process.
#[derive(Debug)]
pub struct HelperChild {
    pid: libc::pid_t,
}

impl HelperChild {
    /// Wait for the helper to exit.
    fn wait(self) {
        let mut status = 0;
        loop {
            let ret = unsafe { libc::waitpid(self.pid, &mut status, 0) };
            if ret != -1 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("Failed to reap helper {}: {err}", self.pid);
                return;
            }
        }

        if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
            debug!("Helper {} exited", self.pid);
        } else {
            warn!("Helper {} exited abnormally (wait status {status:#x})", self.pid);
        }
    }

    /// Terminate and reap the helper.
    fn kill(self) {
        unsafe { libc::kill(self.pid, libc::SIGKILL) };
        self.wait();
    }
}

/// Enter the jail described by `config`.
///
/// On success the calling process is chrooted inside new user and mount
/// namespaces, running as `config.identity`.
pub fn enter(config: &JailConfig) -> Result<JailContext, JailError> {
    let uid = rustix::process::getuid().as_raw();
    let gid = rustix::process::getgid().as_raw();
    debug!("Before unshare, uid={uid}, gid={gid}");

    match config.id_mapping {
        IdMapping::SelfOnly => run_primary(config, &mut Linux, &mut SelfMap { uid, gid }),
        IdMapping::Subordinate => {
            let tools = SetuidTools::locate()?;
            let username = helper::username(uid).unwrap_or_else(|| uid.to_string());
            let plan = HelperPlan::new(config, std::process::id(), uid, gid, username);

            let (primary_end, helper_end) = handshake::pipes().map_err(JailError::HelperSpawn)?;

            // The process must still be single-threaded here, the user namespace
            // can't be unshared otherwise.
            match unsafe { libc::fork() } {
                -1 => Err(JailError::HelperSpawn(io::Error::last_os_error())),
                0 => {
                    drop(primary_end);
                    helper::run_forked(helper_end, tools, &plan)
                },
                pid => {
                    drop(helper_end);
                    let child = HelperChild { pid };
                    let mut handshake =
                        HelperHandshake::new(primary_end, Some(child), config.handshake_timeout);
                    run_primary(config, &mut Linux, &mut handshake)
                },
            }
        },
    }
}

/// Drive the primary process through all jail setup steps.
pub fn run_primary(
    config: &JailConfig,
    host: &mut impl Host,
    maps: &mut impl IdMapSource,
) -> Result<JailContext, JailError> {
    let mut context = JailContext::new();

    if !config.rootfs.is_dir() {
        maps.abort();
        let error = io::Error::new(io::ErrorKind::NotFound, "not a directory");
        return Err(JailError::ChrootFailed { path: config.rootfs.clone(), error });
    }

    if let Err(err) = host.unshare_user() {
        maps.abort();
        return Err(JailError::UnshareFailed(err));
    }
    context.advance(Stage::UserNamespace);

    maps.map(host)?;
    context.advance(Stage::Mapped);

    match host.unshare_mount() {
        Ok(()) => context.mount_namespace = true,
        Err(err) => {
            let err = JailError::MountUnshareFailed(err);
            soft_failure(config.severities.mount_namespace, err)?;
        },
    }
    context.advance(Stage::MountNamespace);

    let report = mounts::mount_all(host, &config.binds, &config.rootfs)?;
    context.mounts = match config.severities.bind_mount {
        Severity::Fatal => report.strict()?,
        Severity::Warn => report,
    };

    if let Some(qemu) = &config.qemu {
        install_qemu(qemu, &config.rootfs)
            .map_err(|error| JailError::QemuInstallFailed { path: qemu.clone(), error })?;
    }
    context.advance(Stage::Mounted);

    host.chroot(&config.rootfs)
        .map_err(|error| JailError::ChrootFailed { path: config.rootfs.clone(), error })?;
    context.advance(Stage::Chrooted);

    host.chdir(&config.cwd)
        .map_err(|error| JailError::ChdirFailed { path: config.cwd.clone(), error })?;

    let identity = config.identity;
    if let Err(error) = host.set_identity(identity) {
        let err = JailError::PrivilegeDropFailed { uid: identity.uid, gid: identity.gid, error };
        soft_failure(config.severities.privilege_drop, err)?;
    }
    context.advance(Stage::Ready);

    info!("Entered jail {:?} as {}:{}", config.rootfs, identity.uid, identity.gid);

    Ok(context)
}

/// Abort on fatal errors, only log the rest.
fn soft_failure(severity: Severity, err: JailError) -> Result<(), JailError> {
    match severity {
        Severity::Fatal => Err(err),
        Severity::Warn => {
            error!("{err}");
            Ok(())
        },
    }
}

/// Copy a static interpreter to the same location inside the jail.
fn install_qemu(qemu: &Path, rootfs: &Path) -> io::Result<()> {
    let target = mounts::rootfs_path(rootfs, qemu);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    debug!("Installing {qemu:?}");
    fs::copy(qemu, &target)?;
    fs::set_permissions(&target, Permissions::from_mode(0o755))?;

    Ok(())
}
