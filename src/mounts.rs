//! Bind mounts into the jail root.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::BindSpec;
use crate::error::JailError;
use crate::namespaces::Host;

/// Outcome of a single bind mount.
///
/// Only [`JailError::BindMountFailed`] is ever stored as an error.
pub type MountResult = Result<PathBuf, JailError>;

/// Outcome of all requested bind mounts, in request order.
#[derive(Debug, Default)]
pub struct MountReport {
    pub results: Vec<MountResult>,
}

impl MountReport {
    /// Mountpoints which were successfully bound.
    pub fn mounted(&self) -> impl Iterator<Item = &PathBuf> {
        self.results.iter().filter_map(|result| result.as_ref().ok())
    }

    /// Bind mounts which failed.
    pub fn failures(&self) -> impl Iterator<Item = &JailError> {
        self.results.iter().filter_map(|result| result.as_ref().err())
    }

    /// Turn the first failed mount into an error.
    pub fn strict(self) -> Result<Self, JailError> {
        let mounted = self.results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(Self { results: mounted.into_iter().map(Ok).collect() })
    }
}

/// Perform all bind mounts in order.
///
/// Failed mounts are recorded and skipped, a missing bind source aborts.
pub fn mount_all(
    host: &mut impl Host,
    binds: &[BindSpec],
    rootfs: &Path,
) -> Result<MountReport, JailError> {
    let mut report = MountReport::default();
    for spec in binds {
        match mount_bind(host, spec, rootfs) {
            Err(err @ JailError::BindMountFailed { .. }) => {
                warn!("{err}");
                report.results.push(Err(err));
            },
            result => report.results.push(Ok(result?)),
        }
    }
    Ok(report)
}

/// Bind mount `spec.source` to `spec.dest` below `rootfs`.
///
/// Missing mountpoints are created to match the type of the source.
pub fn mount_bind(host: &mut impl Host, spec: &BindSpec, rootfs: &Path) -> MountResult {
    let target = rootfs_path(rootfs, &spec.dest);
    debug!("Binding: {:?} -> {:?}", spec.source, target);

    if !spec.source.exists() {
        return Err(JailError::BindSourceMissing(spec.source.clone()));
    }

    let failed = |error| JailError::BindMountFailed {
        from: spec.source.clone(),
        to: target.clone(),
        error,
    };

    if spec.source.is_dir() {
        ensure_dir(&target, &spec.source).map_err(failed)?;
    } else {
        ensure_file(&target, &spec.source).map_err(failed)?;
    }

    host.bind_mount(&spec.source, &target).map_err(failed)?;

    Ok(target)
}

/// Resolve `path` relative to `rootfs`, even if it is absolute.
pub fn rootfs_path(rootfs: &Path, path: &Path) -> PathBuf {
    let relative = path.strip_prefix("/").unwrap_or(path);
    rootfs.join(relative)
}

/// Ensure `path` is a directory, replacing a regular file in its place.
fn ensure_dir(path: &Path, source: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }

    if path.exists() {
        warn!("Removing rootfs bind target {path:?} because it is not a directory");
        fs::remove_file(path)?;
    }

    warn!("Creating rootfs directory {path:?} because it is needed to bind mount {source:?}");
    fs::create_dir_all(path)
}

/// Ensure `path` exists and its parent is a directory.
fn ensure_file(path: &Path, source: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent, source)?;
    }

    if !path.exists() {
        warn!("Creating rootfs file {path:?} because it is a mountpoint for {source:?}");
        File::create(path)?;
    }

    Ok(())
}
