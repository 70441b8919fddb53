//! Id map helper process.
//!
//! The helper stays in the original user namespace. Once the primary process
//! has unshared its user namespace, the helper maps the user's subordinate id
//! ranges into it using the setuid-root `newuidmap` and `newgidmap` programs.

use std::ffi::CStr;
use std::fmt::{self, Display, Formatter};
use std::mem::MaybeUninit;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::{env, fs, io, ptr};

use tracing::{debug, error};

use crate::config::JailConfig;
use crate::error::JailError;
use crate::handshake::{Endpoint, Reply, Request};
use crate::subid::{self, IdRange};

/// Reason the helper could not map the primary's ids.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HelperFailure {
    /// No subordinate range for the user.
    Resolution,
    /// Requested range outside of the allotment.
    Range,
    /// A setuid tool or the setgroups write failed.
    MapTool,
    /// The primary sent garbage or vanished.
    Protocol,
}

impl From<HelperFailure> for u8 {
    fn from(failure: HelperFailure) -> Self {
        match failure {
            HelperFailure::Resolution => b'r',
            HelperFailure::Range => b'v',
            HelperFailure::MapTool => b'm',
            HelperFailure::Protocol => b'p',
        }
    }
}

impl TryFrom<u8> for HelperFailure {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'r' => Ok(Self::Resolution),
            b'v' => Ok(Self::Range),
            b'm' => Ok(Self::MapTool),
            b'p' => Ok(Self::Protocol),
            byte => Err(byte),
        }
    }
}

/// Which of the two id maps is written.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MapKind {
    Uid,
    Gid,
}

impl MapKind {
    /// Name of the setuid program writing this map.
    pub fn program(&self) -> &'static str {
        match self {
            Self::Uid => "newuidmap",
            Self::Gid => "newgidmap",
        }
    }
}

/// Namespace id map: id 0 is the calling user, ids from 1 are its subordinates.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct IdMap {
    pub outside_self: u32,
    pub range: IdRange,
}

impl IdMap {
    /// Arguments for `newuidmap`/`newgidmap` targeting `pid`.
    pub fn args(&self, pid: u32) -> [String; 7] {
        [
            pid.to_string(),
            "0".into(),
            self.outside_self.to_string(),
            "1".into(),
            "1".into(),
            self.range.start.to_string(),
            self.range.count.to_string(),
        ]
    }
}

impl Display for IdMap {
    /// Format in the kernel's `uid_map` syntax.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "0 {} 1", self.outside_self)?;
        writeln!(f, "1 {} {}", self.range.start, self.range.count)
    }
}

/// Writer for another process' id maps.
pub trait IdMapper {
    fn write_map(&mut self, kind: MapKind, pid: u32, map: &IdMap) -> io::Result<()>;

    /// Disable `setgroups(2)` in the namespace of `pid`.
    fn deny_setgroups(&mut self, pid: u32) -> io::Result<()>;
}

/// Id mapper using the system's setuid-root tools.
pub struct SetuidTools {
    newuidmap: PathBuf,
    newgidmap: PathBuf,
}

impl SetuidTools {
    /// Find `newuidmap` and `newgidmap` in `PATH`.
    pub fn locate() -> Result<Self, JailError> {
        let find = |kind: MapKind| {
            let program = kind.program();
            find_in_path(program).ok_or(JailError::MissingTool(program))
        };
        Ok(Self { newuidmap: find(MapKind::Uid)?, newgidmap: find(MapKind::Gid)? })
    }
}

impl IdMapper for SetuidTools {
    fn write_map(&mut self, kind: MapKind, pid: u32, map: &IdMap) -> io::Result<()> {
        let program = match kind {
            MapKind::Uid => &self.newuidmap,
            MapKind::Gid => &self.newgidmap,
        };
        debug!("Calling {program:?}");

        let status = Command::new(program).args(map.args(pid)).status()?;
        if !status.success() {
            return Err(io::Error::other(format!("{} failed: {status}", kind.program())));
        }

        Ok(())
    }

    fn deny_setgroups(&mut self, pid: u32) -> io::Result<()> {
        let path = format!("/proc/{pid}/setgroups");
        debug!("Writing: {path}");
        fs::write(path, b"deny\n")
    }
}

/// Everything the helper needs to know about the primary.
#[derive(Clone, Debug)]
pub struct HelperPlan {
    /// Process owning the new user namespace.
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub uid_range: Option<IdRange>,
    pub gid_range: Option<IdRange>,
    pub subuid_path: PathBuf,
    pub subgid_path: PathBuf,
}

impl HelperPlan {
    pub fn new(config: &JailConfig, pid: u32, uid: u32, gid: u32, username: String) -> Self {
        Self {
            pid,
            uid,
            gid,
            username,
            uid_range: config.uid_range,
            gid_range: config.gid_range,
            subuid_path: config.subuid_path.clone(),
            subgid_path: config.subgid_path.clone(),
        }
    }

    /// Resolve the range to map, validating explicitly requested ranges.
    fn range(&self, path: &Path, requested: Option<IdRange>) -> Result<IdRange, HelperFailure> {
        let allotted = subid::resolve(path, &self.username, self.uid).map_err(|err| {
            error!("{err}");
            HelperFailure::Resolution
        })?;

        match requested {
            Some(requested) => {
                subid::validate(requested, allotted).map_err(|err| {
                    error!("{err}");
                    HelperFailure::Range
                })?;
                Ok(requested)
            },
            None => Ok(allotted),
        }
    }
}

/// Serve one handshake from the helper side.
///
/// Waits for the primary to unshare its user namespace, writes its id maps and
/// replies with the outcome. Nothing is mapped if the primary aborts.
pub fn serve(
    endpoint: &mut impl Endpoint,
    mapper: &mut impl IdMapper,
    plan: &HelperPlan,
) -> Result<(), HelperFailure> {
    let result = match endpoint.recv_request() {
        Ok(Request::Unshared) => map_ids(mapper, plan),
        Ok(Request::Abort) => {
            debug!("Primary aborted before mapping");
            return Ok(());
        },
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            error!("Primary exited during handshake");
            return Err(HelperFailure::Protocol);
        },
        Err(err) => {
            error!("Invalid handshake request: {err}");
            Err(HelperFailure::Protocol)
        },
    };

    let reply = match result {
        Ok(()) => Reply::Mapped,
        Err(failure) => Reply::Failed(failure),
    };
    if let Err(err) = endpoint.send_reply(reply) {
        error!("Failed to answer primary: {err}");
        return Err(HelperFailure::Protocol);
    }

    result
}

/// Resolve and write both id maps of the primary.
///
/// Both ranges are validated before anything is written.
fn map_ids(mapper: &mut impl IdMapper, plan: &HelperPlan) -> Result<(), HelperFailure> {
    let uid_range = plan.range(&plan.subuid_path, plan.uid_range)?;
    let gid_range = plan.range(&plan.subgid_path, plan.gid_range)?;
    let uid_map = IdMap { outside_self: plan.uid, range: uid_range };
    let gid_map = IdMap { outside_self: plan.gid, range: gid_range };

    let map_failed = |err: io::Error| {
        error!("{err}");
        HelperFailure::MapTool
    };
    mapper.write_map(MapKind::Uid, plan.pid, &uid_map).map_err(map_failed)?;
    mapper.deny_setgroups(plan.pid).map_err(map_failed)?;
    mapper.write_map(MapKind::Gid, plan.pid, &gid_map).map_err(map_failed)?;

    Ok(())
}

/// Run the helper in a freshly forked child and exit.
///
/// The process is left through `_exit` so nothing inherited from the
/// primary, like buffered output or destructors, runs twice.
pub fn run_forked(mut endpoint: impl Endpoint, mut mapper: impl IdMapper, plan: &HelperPlan) -> ! {
    let code = match serve(&mut endpoint, &mut mapper, plan) {
        Ok(()) => 0,
        Err(_) => 1,
    };
    drop(endpoint);
    unsafe { libc::_exit(code) }
}

/// Look up the login name of `uid`.
pub fn username(uid: u32) -> Option<String> {
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut passwd = MaybeUninit::<libc::passwd>::uninit();
    let mut result = ptr::null_mut();

    let ret = unsafe {
        libc::getpwuid_r(uid, passwd.as_mut_ptr(), buf.as_mut_ptr(), buf.len(), &mut result)
    };
    if ret != 0 || result.is_null() {
        return None;
    }

    let name = unsafe { CStr::from_ptr((*result).pw_name) };
    Some(name.to_string_lossy().into_owned())
}

/// Find an executable file in `PATH`.
fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path).map(|dir| dir.join(program)).find(|candidate| candidate.is_file())
}


#[cfg(test)]
mod tests {
    use std::thread;

    use super::testing::RecordingMapper;
    use super::*;
    use crate::handshake::testing::channels;
    use crate::namespaces::testing::Event;

    fn plan(subuid: &tempfile::NamedTempFile, uid_range: Option<IdRange>) -> HelperPlan {
        HelperPlan {
            pid: 4242,
            uid: 1000,
            gid: 1000,
            username: "alice".into(),
            uid_range,
            gid_range: None,
            subuid_path: subuid.path().into(),
            subgid_path: subuid.path().into(),
        }
    }

    fn subid_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), "alice:100000:65536\n").unwrap();
        file
    }

    #[test]
    fn id_map_format() {
        let map = IdMap { outside_self: 1000, range: IdRange::new(100000, 65536) };
        assert_eq!(map.to_string(), "0 1000 1\n1 100000 65536\n");
        assert_eq!(map.args(4242), ["4242", "0", "1000", "1", "1", "100000", "65536"]);
    }

    #[test]
    fn failure_tokens() {
        for byte in [b'r', b'v', b'm', b'p'] {
            assert_eq!(u8::from(HelperFailure::try_from(byte).unwrap()), byte);
        }
        assert_eq!(HelperFailure::try_from(b'#'), Err(b'#'));
    }

    #[test]
    fn maps_written_in_order() {
        let subuid = subid_file();
        let plan = plan(&subuid, None);
        let mut mapper = RecordingMapper::default();
        let (mut primary, mut helper) = channels();

        primary.send_request(Request::Unshared).unwrap();
        serve(&mut helper, &mut mapper, &plan).unwrap();

        assert_eq!(primary.recv_reply(None).unwrap(), Reply::Mapped);
        assert_eq!(mapper.log.lock().unwrap().clone(), vec![
            Event::WriteMap("newuidmap 4242: 0 1000 1\n1 100000 65536\n".into()),
            Event::DenySetgroups(4242),
            Event::WriteMap("newgidmap 4242: 0 1000 1\n1 100000 65536\n".into()),
        ]);
    }

    #[test]
    fn invalid_range_reported() {
        let subuid = subid_file();
        let plan = plan(&subuid, Some(IdRange::new(50, 10)));
        let mut mapper = RecordingMapper::default();
        let (mut primary, mut helper) = channels();

        primary.send_request(Request::Unshared).unwrap();
        let result = serve(&mut helper, &mut mapper, &plan);

        assert_eq!(result, Err(HelperFailure::Range));
        assert_eq!(primary.recv_reply(None).unwrap(), Reply::Failed(HelperFailure::Range));
        assert!(mapper.log.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_user_reported() {
        let subuid = subid_file();
        let mut plan = plan(&subuid, None);
        plan.username = "bob".into();
        plan.uid = 1001;
        let (mut primary, mut helper) = channels();

        primary.send_request(Request::Unshared).unwrap();
        let result = serve(&mut helper, &mut RecordingMapper::default(), &plan);

        assert_eq!(result, Err(HelperFailure::Resolution));
        assert_eq!(primary.recv_reply(None).unwrap(), Reply::Failed(HelperFailure::Resolution));
    }

    #[test]
    fn tool_failure_reported() {
        let subuid = subid_file();
        let plan = plan(&subuid, None);
        let mut mapper = RecordingMapper { fail: true, ..RecordingMapper::default() };
        let (mut primary, mut helper) = channels();

        primary.send_request(Request::Unshared).unwrap();
        let result = serve(&mut helper, &mut mapper, &plan);

        assert_eq!(result, Err(HelperFailure::MapTool));
        assert_eq!(primary.recv_reply(None).unwrap(), Reply::Failed(HelperFailure::MapTool));
    }

    #[test]
    fn abort_maps_nothing() {
        let subuid = subid_file();
        let plan = plan(&subuid, None);
        let mut mapper = RecordingMapper::default();
        let (mut primary, mut helper) = channels();

        let handle = thread::spawn(move || {
            let result = serve(&mut helper, &mut mapper, &plan);
            let mapped = mapper.log.lock().unwrap().len();
            (result, mapped)
        });
        primary.send_request(Request::Abort).unwrap();

        assert_eq!(handle.join().unwrap(), (Ok(()), 0));
    }

    #[test]
    fn primary_gone() {
        let subuid = subid_file();
        let plan = plan(&subuid, None);
        let (primary, mut helper) = channels();
        drop(primary);

        let result = serve(&mut helper, &mut RecordingMapper::default(), &plan);
        assert_eq!(result, Err(HelperFailure::Protocol));
    }

    #[test]
    fn locate_missing_tools() {
        // PATH is process global, so only the lookup helper is exercised here.
        assert_eq!(find_in_path("userjail-definitely-not-installed"), None);
    }
}
