//! Jail entry errors.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::helper::HelperFailure;

/// Jail entry error.
#[derive(thiserror::Error, Debug)]
pub enum JailError {
    #[error("failed to unshare user namespace: {0}")]
    UnshareFailed(#[source] io::Error),
    #[error("failed to unshare mount namespace: {0}")]
    MountUnshareFailed(#[source] io::Error),
    #[error("no subordinate id range allotted to this user")]
    IdResolutionFailed,
    #[error("requested id range is outside of the allotted subordinate range")]
    IdRangeInvalid,
    #[error("setuid id map helper failed")]
    IdMapHelperFailed,
    #[error("failed to write id maps of the user namespace: {0}")]
    IdMapWriteFailed(#[source] io::Error),
    #[error("required program {0:?} not found in PATH")]
    MissingTool(&'static str),
    #[error("bind source {0:?} does not exist")]
    BindSourceMissing(PathBuf),
    #[error("bind mount of {from:?} on {to:?} failed: {error}")]
    BindMountFailed { from: PathBuf, to: PathBuf, error: io::Error },
    #[error("failed to install {path:?} into the jail: {error}")]
    QemuInstallFailed { path: PathBuf, error: io::Error },
    #[error("failed to chroot into {path:?}: {error}")]
    ChrootFailed { path: PathBuf, error: io::Error },
    #[error("failed to change directory to {path:?}: {error}")]
    ChdirFailed { path: PathBuf, error: io::Error },
    #[error("failed to drop privileges to {uid}:{gid}: {error}")]
    PrivilegeDropFailed { uid: u32, gid: u32, error: io::Error },
    #[error("failed to fork id map helper: {0}")]
    HelperSpawn(#[source] io::Error),
    #[error("id map helper did not answer within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("handshake with id map helper failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to launch {path:?}: {error}")]
    Exec { path: PathBuf, error: io::Error },
}

impl From<HelperFailure> for JailError {
    fn from(failure: HelperFailure) -> Self {
        match failure {
            HelperFailure::Resolution => Self::IdResolutionFailed,
            HelperFailure::Range => Self::IdRangeInvalid,
            HelperFailure::MapTool => Self::IdMapHelperFailed,
            HelperFailure::Protocol => Self::Handshake(io::Error::new(
                io::ErrorKind::InvalidData,
                "helper received an unexpected token",
            )),
        }
    }
}
