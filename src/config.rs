//! Jail configuration.
//!
//! Configuration is layered: built-in defaults, then a JSON file with `//`
//! comments, then command line overrides.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::JailError;
use crate::exec::ExecSpec;
use crate::subid::{self, IdRange, RangeError};

/// Name of the configuration directory below `$XDG_CONFIG_HOME`.
const XDG_PREFIX: &str = "userjail";

/// Default wait for the id map helper, in seconds.
const DEFAULT_HANDSHAKE_TIMEOUT: u64 = 30;

/// Longest accepted wait for the id map helper, in seconds.
const MAX_HANDSHAKE_TIMEOUT: u64 = 24 * 60 * 60;

/// Everything required to enter a jail.
#[derive(Clone, Debug)]
pub struct JailConfig {
    pub rootfs: PathBuf,
    pub binds: Vec<BindSpec>,
    pub qemu: Option<PathBuf>,
    pub identity: Identity,
    pub uid_range: Option<IdRange>,
    pub gid_range: Option<IdRange>,
    pub cwd: PathBuf,
    pub id_mapping: IdMapping,
    pub handshake_timeout: Option<Duration>,
    pub severities: Severities,
    pub subuid_path: PathBuf,
    pub subgid_path: PathBuf,
}

impl JailConfig {
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            binds: Vec::new(),
            qemu: None,
            identity: Identity::default(),
            uid_range: None,
            gid_range: None,
            cwd: PathBuf::from("/"),
            id_mapping: IdMapping::default(),
            handshake_timeout: Some(Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT)),
            severities: Severities::default(),
            subuid_path: PathBuf::from(subid::SUBUID_PATH),
            subgid_path: PathBuf::from(subid::SUBGID_PATH),
        }
    }
}

/// Bind mount of a host path into the jail.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BindSpec {
    pub source: PathBuf,
    /// Destination, relative to the jail root.
    pub dest: PathBuf,
}

impl BindSpec {
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self { source: source.into(), dest: dest.into() }
    }

    /// Create a bind mount whose destination can't escape the jail root.
    pub fn checked(
        source: impl Into<PathBuf>,
        dest: impl Into<PathBuf>,
    ) -> Result<Self, JailError> {
        let spec = Self::new(source, dest);
        if spec.dest.components().any(|component| component == Component::ParentDir) {
            return Err(JailError::Config(format!(
                "bind destination {:?} must not contain \"..\"",
                spec.dest
            )));
        }
        Ok(spec)
    }
}

impl FromStr for BindSpec {
    type Err = JailError;

    /// Parse either `path` or `source:dest`.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (source, dest) = spec.split_once(':').unwrap_or((spec, spec));
        if source.is_empty() || dest.is_empty() || dest.contains(':') {
            return Err(JailError::Config(format!("invalid bind specification {spec:?}")));
        }
        Self::checked(source, dest)
    }
}

impl<'de> Deserialize<'de> for BindSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Spec(String),
            Pair(PathBuf, PathBuf),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Spec(spec) => spec.parse().map_err(serde::de::Error::custom),
            Raw::Pair(source, dest) => {
                Self::checked(source, dest).map_err(serde::de::Error::custom)
            },
        }
    }
}

/// User and group assumed inside the jail.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Default, Debug)]
#[serde(from = "(u32, u32)", into = "(u32, u32)")]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl From<(u32, u32)> for Identity {
    fn from((uid, gid): (u32, u32)) -> Self {
        Self { uid, gid }
    }
}

impl From<Identity> for (u32, u32) {
    fn from(identity: Identity) -> Self {
        (identity.uid, identity.gid)
    }
}

/// Source of the namespace's uid/gid maps.
#[derive(Serialize, Deserialize, clap::ValueEnum, Copy, Clone, PartialEq, Eq, Default, Debug)]
#[serde(rename_all = "lowercase")]
pub enum IdMapping {
    /// Map the user's subordinate ranges through `newuidmap`/`newgidmap`.
    #[default]
    Subordinate,
    /// Map only the calling user to root, without any setuid helpers.
    #[serde(rename = "self")]
    #[value(name = "self")]
    SelfOnly,
}

/// How a failed jail setup step is handled.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Fatal,
    Warn,
}

/// Severity of the setup steps which may be allowed to fail.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
#[serde(default)]
pub struct Severities {
    pub mount_namespace: Severity,
    pub bind_mount: Severity,
    pub privilege_drop: Severity,
}

impl Default for Severities {
    fn default() -> Self {
        Self {
            mount_namespace: Severity::Warn,
            bind_mount: Severity::Warn,
            privilege_drop: Severity::Fatal,
        }
    }
}

/// One configuration layer, as read from a file or the command line.
#[derive(Deserialize, Default, Debug)]
pub struct ConfigFile {
    pub rootfs: Option<PathBuf>,
    pub binds: Option<Vec<BindSpec>>,
    pub qemu: Option<PathBuf>,
    pub identity: Option<Identity>,
    pub uid_range: Option<IdRange>,
    pub gid_range: Option<IdRange>,
    pub cwd: Option<PathBuf>,
    pub id_mapping: Option<IdMapping>,
    /// Seconds to wait for the id map helper, `0` waits forever.
    pub handshake_timeout: Option<u64>,
    pub severities: Option<Severities>,
    pub exbin: Option<PathBuf>,
    pub argv: Option<Vec<String>>,
    /// `Some(None)` inherits the host environment.
    #[serde(default, deserialize_with = "explicit")]
    pub env: Option<Option<BTreeMap<String, Value>>>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl ConfigFile {
    /// Load a configuration layer from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, JailError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| JailError::Config(format!("failed to read {path:?}: {err}")))?;
        Self::parse(&text).map_err(|err| JailError::Config(format!("{path:?}: {err}")))
    }

    /// Parse JSON with `//` line comments.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(&strip_comments(text))
    }

    /// Apply all values set in `overrides` on top of this layer.
    pub fn merge(self, overrides: Self) -> Self {
        let mut unknown = self.unknown;
        unknown.extend(overrides.unknown);

        Self {
            rootfs: overrides.rootfs.or(self.rootfs),
            binds: overrides.binds.or(self.binds),
            qemu: overrides.qemu.or(self.qemu),
            identity: overrides.identity.or(self.identity),
            uid_range: overrides.uid_range.or(self.uid_range),
            gid_range: overrides.gid_range.or(self.gid_range),
            cwd: overrides.cwd.or(self.cwd),
            id_mapping: overrides.id_mapping.or(self.id_mapping),
            handshake_timeout: overrides.handshake_timeout.or(self.handshake_timeout),
            severities: overrides.severities.or(self.severities),
            exbin: overrides.exbin.or(self.exbin),
            argv: overrides.argv.or(self.argv),
            env: overrides.env.or(self.env),
            unknown,
        }
    }

    /// Validate the merged layers and split them into jail and exec settings.
    pub fn build(self) -> Result<(JailConfig, ExecSpec), JailError> {
        let unknown: Vec<_> = self.unknown.keys().filter(|key| !key.starts_with('_')).collect();
        if !unknown.is_empty() {
            let keys: Vec<_> = unknown.iter().map(|key| key.as_str()).collect();
            warn!("Unrecognized config variables: {}", keys.join(", "));
        }

        let rootfs = self.rootfs.ok_or_else(|| JailError::Config("no rootfs specified".into()))?;
        if !rootfs.is_absolute() {
            return Err(JailError::Config(format!("rootfs {rootfs:?} must be an absolute path")));
        }

        for range in [self.uid_range, self.gid_range].into_iter().flatten() {
            if let Err(err @ RangeError::Empty(_)) = subid::validate(range, range) {
                return Err(JailError::Config(err.to_string()));
            }
        }

        let id_mapping = self.id_mapping.unwrap_or_default();
        let identity = self.identity.unwrap_or_default();
        if id_mapping == IdMapping::SelfOnly {
            if identity != Identity::default() {
                return Err(JailError::Config(
                    "only identity [0, 0] is mapped with the \"self\" id mapping".into(),
                ));
            }
            if self.uid_range.is_some() || self.gid_range.is_some() {
                warn!("Ignoring uid_range/gid_range with the \"self\" id mapping");
            }
        }

        let cwd = self.cwd.unwrap_or_else(|| PathBuf::from("/"));
        if !cwd.is_absolute() {
            return Err(JailError::Config(format!("cwd {cwd:?} must be an absolute path")));
        }

        let handshake_timeout = match self.handshake_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT) {
            0 => None,
            secs @ 1..=MAX_HANDSHAKE_TIMEOUT => Some(Duration::from_secs(secs)),
            secs => {
                return Err(JailError::Config(format!(
                    "handshake_timeout of {secs}s exceeds {MAX_HANDSHAKE_TIMEOUT}s, use 0 to wait \
                     forever"
                )));
            },
        };

        let jail = JailConfig {
            binds: self.binds.unwrap_or_default(),
            qemu: self.qemu,
            identity,
            uid_range: self.uid_range,
            gid_range: self.gid_range,
            cwd,
            id_mapping,
            handshake_timeout,
            severities: self.severities.unwrap_or_default(),
            ..JailConfig::new(rootfs)
        };

        let env = self.env.map(|env| env.map(flatten_env));
        let exec = ExecSpec::new(self.exbin, self.argv, env);

        Ok((jail, exec))
    }
}

/// Default configuration file location, if one exists.
pub fn default_path() -> Option<PathBuf> {
    let dirs = xdg::BaseDirectories::with_prefix(XDG_PREFIX).ok()?;
    dirs.find_config_file("config.json")
}

/// Write the default configuration as commented JSON.
pub fn dump_default(mut out: impl Write) -> io::Result<()> {
    let exec = ExecSpec::default();
    let env: BTreeMap<_, _> = exec.env.unwrap_or_default().into_iter().collect();
    let entries = [
        ("rootfs", "The directory to chroot into", Value::Null),
        (
            "binds",
            "List of paths to bind into the new root directory, either \"path\" or \
             \"source:dest\". These binds are done inside a mount namespace and will not be \
             reflected outside the process tree started by this program.",
            json!([]),
        ),
        (
            "qemu",
            "If specified, path to a static qemu interpreter that is copied into the jail",
            Value::Null,
        ),
        (
            "identity",
            "After entering the jail, assume this [uid, gid]. [0, 0] for root.",
            json!([0, 0]),
        ),
        (
            "uid_range",
            "uids in the namespace starting at 1 are mapped to uids outside the namespace \
             starting with this value and up to this many ids. The range must lie within your \
             allowed subordinate uids (see /etc/subuid). Defaults to the whole allotment.",
            Value::Null,
        ),
        ("gid_range", "Same as uid_range, but for gids (see /etc/subgid).", Value::Null),
        ("cwd", "Absolute working directory inside the jail", json!("/")),
        (
            "id_mapping",
            "\"subordinate\" maps subordinate ranges through newuidmap/newgidmap, \"self\" only \
             maps your own user to root without any setuid helpers",
            json!("subordinate"),
        ),
        (
            "handshake_timeout",
            "Seconds to wait for the id map helper, at most one day, 0 waits forever",
            json!(DEFAULT_HANDSHAKE_TIMEOUT),
        ),
        (
            "severities",
            "Whether a failure of these steps aborts (\"fatal\") or only logs (\"warn\")",
            serde_json::to_value(Severities::default()).map_err(io::Error::other)?,
        ),
        ("exbin", "The path of the program to execute", json!(exec.exbin)),
        ("argv", "The argument vector of the executed program", json!(exec.argv)),
        (
            "env",
            "The environment of the executed program, null inherits the host environment. \
             List values are joined with ':'.",
            json!(env),
        ),
    ];

    writeln!(out, "{{")?;
    for (i, (key, doc, value)) in entries.iter().enumerate() {
        for line in wrap(doc, 76) {
            writeln!(out, "  // {line}")?;
        }
        let value = serde_json::to_string(value).map_err(io::Error::other)?;
        let separator = if i + 1 == entries.len() { "" } else { "," };
        writeln!(out, "  \"{key}\": {value}{separator}")?;
        if i + 1 != entries.len() {
            writeln!(out)?;
        }
    }
    writeln!(out, "}}")?;

    Ok(())
}

/// Remove `//` comments outside of string literals.
fn strip_comments(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    for line in text.lines() {
        let mut in_string = false;
        let mut escaped = false;
        let mut end = line.len();
        let mut chars = line.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            match c {
                _ if escaped => escaped = false,
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                '/' if !in_string && chars.peek().is_some_and(|(_, next)| *next == '/') => {
                    end = i;
                    break;
                },
                _ => (),
            }
        }
        stripped.push_str(line[..end].trim_end());
        stripped.push('\n');
    }
    stripped
}

/// Convert environment values to strings, joining lists with `:`.
fn flatten_env(env: BTreeMap<String, Value>) -> Vec<(String, String)> {
    env.into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(value) => value,
                Value::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(item) => item,
                        item => item.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(":"),
                value => value.to_string(),
            };
            (key, value)
        })
        .collect()
}

/// Deserialize a present value, distinguishing `null` from a missing key.
fn explicit<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Greedy word wrap.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    for word in text.split_whitespace() {
        if !line.is_empty() && line.len() + word.len() + 1 > width {
            lines.push(std::mem::take(&mut line));
        }
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(word);
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_spec_parsing() {
        let same: BindSpec = "/etc/resolv.conf".parse().unwrap();
        assert_eq!(same, BindSpec::new("/etc/resolv.conf", "/etc/resolv.conf"));

        let pair: BindSpec = "/home/alice/src:/src".parse().unwrap();
        assert_eq!(pair, BindSpec::new("/home/alice/src", "/src"));

        assert!("/a:/b:/c".parse::<BindSpec>().is_err());
        assert!(":/b".parse::<BindSpec>().is_err());
    }

    #[test]
    fn bind_dest_stays_in_rootfs() {
        assert!("/home:../../home".parse::<BindSpec>().is_err());
        assert!("/srv:/../x".parse::<BindSpec>().is_err());
        assert!("/a/../b".parse::<BindSpec>().is_err());
        assert!("/src:/opt/src..old".parse::<BindSpec>().is_ok());

        let pair = ConfigFile::parse(r#"{ "binds": [["/home", "/opt/../../home"]] }"#);
        assert!(pair.is_err());
    }

    #[test]
    fn comments_stripped_outside_strings() {
        let text = "{\n  // leading\n  \"url\": \"http://example.com\", // trailing\n  \"a\": 1\n}";
        let stripped = strip_comments(text);
        assert_eq!(stripped, "{\n\n  \"url\": \"http://example.com\",\n  \"a\": 1\n}\n");
    }

    #[test]
    fn parse_file() {
        let text = r#"{
            // The directory to chroot into
            "rootfs": "/tmp/trusty_arm64",
            "binds": ["/dev/urandom", "/src:/opt/src", ["/etc/hosts", "/etc/hosts"]],
            "qemu": "/usr/bin/qemu-aarch64-static",
            "identity": [0, 0],
            "uid_range": [100000, 65536],
            "gid_range": [100000, 65536],
            "severities": { "privilege_drop": "warn" },
            "env": { "PATH": ["/usr/bin", "/bin"], "LC_ALL": "C" },
            "_private": true
        }"#;
        let file = ConfigFile::parse(text).unwrap();
        let (jail, exec) = file.build().unwrap();

        assert_eq!(jail.rootfs, PathBuf::from("/tmp/trusty_arm64"));
        assert_eq!(jail.binds, vec![
            BindSpec::new("/dev/urandom", "/dev/urandom"),
            BindSpec::new("/src", "/opt/src"),
            BindSpec::new("/etc/hosts", "/etc/hosts"),
        ]);
        assert_eq!(jail.qemu, Some(PathBuf::from("/usr/bin/qemu-aarch64-static")));
        assert_eq!(jail.uid_range, Some(IdRange::new(100000, 65536)));
        assert_eq!(jail.cwd, PathBuf::from("/"));
        assert_eq!(jail.severities.privilege_drop, Severity::Warn);
        assert_eq!(jail.severities.mount_namespace, Severity::Warn);
        assert_eq!(jail.handshake_timeout, Some(Duration::from_secs(30)));

        let env = exec.env.unwrap();
        assert!(env.contains(&("PATH".into(), "/usr/bin:/bin".into())));
        assert!(env.contains(&("LC_ALL".into(), "C".into())));
    }

    #[test]
    fn null_env_inherits() {
        let file = ConfigFile::parse(r#"{ "rootfs": "/r", "env": null }"#).unwrap();
        let (_, exec) = file.build().unwrap();
        assert_eq!(exec.env, None);

        let file = ConfigFile::parse(r#"{ "rootfs": "/r" }"#).unwrap();
        let (_, exec) = file.build().unwrap();
        assert!(exec.env.is_some());
    }

    #[test]
    fn overrides_win() {
        let text = r#"{ "rootfs": "/a", "cwd": "/home", "qemu": "/q" }"#;
        let file = ConfigFile::parse(text).unwrap();
        let cli = ConfigFile {
            rootfs: Some("/b".into()),
            handshake_timeout: Some(0),
            ..ConfigFile::default()
        };
        let (jail, _) = file.merge(cli).build().unwrap();
        assert_eq!(jail.rootfs, PathBuf::from("/b"));
        assert_eq!(jail.cwd, PathBuf::from("/home"));
        assert_eq!(jail.qemu, Some(PathBuf::from("/q")));
        assert_eq!(jail.handshake_timeout, None);
    }

    #[test]
    fn build_rejects_invalid() {
        let missing_root = ConfigFile::default();
        assert!(matches!(missing_root.build(), Err(JailError::Config(_))));

        let relative = ConfigFile::parse(r#"{ "rootfs": "rootfs" }"#).unwrap();
        assert!(matches!(relative.build(), Err(JailError::Config(_))));

        let empty_range = ConfigFile::parse(r#"{ "rootfs": "/r", "uid_range": [0, 10] }"#).unwrap();
        assert!(matches!(empty_range.build(), Err(JailError::Config(_))));

        let text = r#"{ "rootfs": "/r", "id_mapping": "self", "identity": [1000, 1000] }"#;
        let self_user = ConfigFile::parse(text).unwrap();
        assert!(matches!(self_user.build(), Err(JailError::Config(_))));

        let text = r#"{ "rootfs": "/r", "cwd": "home/user" }"#;
        let relative_cwd = ConfigFile::parse(text).unwrap();
        assert!(matches!(relative_cwd.build(), Err(JailError::Config(_))));
    }

    #[test]
    fn handshake_timeout_bounds() {
        let text = r#"{ "rootfs": "/r", "handshake_timeout": 18446744073709551615 }"#;
        let huge = ConfigFile::parse(text).unwrap();
        assert!(matches!(huge.build(), Err(JailError::Config(_))));

        let text = r#"{ "rootfs": "/r", "handshake_timeout": 86400 }"#;
        let (jail, _) = ConfigFile::parse(text).unwrap().build().unwrap();
        assert_eq!(jail.handshake_timeout, Some(Duration::from_secs(86400)));
    }

    #[test]
    fn dumped_default_parses() {
        let mut dump = Vec::new();
        dump_default(&mut dump).unwrap();
        let text = String::from_utf8(dump).unwrap();

        let file = ConfigFile::parse(&text).unwrap();
        assert!(file.unknown.is_empty());
        assert_eq!(file.identity, Some(Identity::default()));
        assert_eq!(file.id_mapping, Some(IdMapping::Subordinate));
        assert_eq!(file.severities, Some(Severities::default()));
    }
}
