//! Subordinate id range lookup.
//!
//! See subuid(5) for the format of `/etc/subuid` and `/etc/subgid`.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::{fs, io};

use serde::{Deserialize, Serialize};

/// System subordinate uid file.
pub const SUBUID_PATH: &str = "/etc/subuid";

/// System subordinate gid file.
pub const SUBGID_PATH: &str = "/etc/subgid";

/// Contiguous range of ids outside the namespace.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
#[serde(from = "(u32, u32)", into = "(u32, u32)")]
pub struct IdRange {
    pub start: u32,
    pub count: u32,
}

impl IdRange {
    pub fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    /// First id past the end of the range.
    fn end(&self) -> u64 {
        self.start as u64 + self.count as u64
    }
}

impl From<(u32, u32)> for IdRange {
    fn from((start, count): (u32, u32)) -> Self {
        Self::new(start, count)
    }
}

impl From<IdRange> for (u32, u32) {
    fn from(range: IdRange) -> Self {
        (range.start, range.count)
    }
}

impl Display for IdRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.start, self.count)
    }
}

/// Find the subordinate id range allotted to a user.
///
/// Records are `name_or_uid:start:count`; the first record whose name matches
/// `username` or whose numeric owner matches `uid` wins.
pub fn resolve(path: impl AsRef<Path>, username: &str, uid: u32) -> Result<IdRange, ResolveError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|error| ResolveError::Read { path: path.into(), error })?;

    for line in content.lines() {
        let mut fields = line.trim().split(':');
        let (Some(owner), Some(start), Some(count)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        let matches = owner == username || owner.parse::<u32>().is_ok_and(|owner| owner == uid);
        if !matches {
            continue;
        }

        let start = start.parse().map_err(|_| ResolveError::Malformed(line.into()))?;
        let count = count.parse().map_err(|_| ResolveError::Malformed(line.into()))?;
        return Ok(IdRange::new(start, count));
    }

    Err(ResolveError::NotFound { path: path.into(), username: username.into(), uid })
}

/// Check that `requested` lies entirely within `allowed`.
///
/// Id 0 is always mapped to the calling user, so ranges must start above it.
pub fn validate(requested: IdRange, allowed: IdRange) -> Result<(), RangeError> {
    if requested.start == 0 || requested.count == 0 {
        return Err(RangeError::Empty(requested));
    }

    if requested.start < allowed.start || requested.end() > allowed.end() {
        return Err(RangeError::OutOfBounds { requested, allowed });
    }

    Ok(())
}

/// Subordinate id lookup error.
#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("failed to read {path:?}: {error}")]
    Read { path: PathBuf, error: io::Error },
    #[error("malformed subordinate id record {0:?}")]
    Malformed(String),
    #[error("user {username}({uid}) not found in subordinate id file {path:?}")]
    NotFound { path: PathBuf, username: String, uid: u32 },
}

/// Invalid id range request.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RangeError {
    #[error("id ranges must satisfy start > 0 and count > 0, got {0}")]
    Empty(IdRange),
    #[error("id range {requested} is not contained in the allowed range {allowed}")]
    OutOfBounds { requested: IdRange, allowed: IdRange },
}
