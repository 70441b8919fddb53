//! Command line interface.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde_json::Value;

use crate::config::{BindSpec, ConfigFile, IdMapping, Identity};
use crate::subid::IdRange;

/// Chroot without root privileges.
///
/// Automates the construction of user and mount namespaces in order to create
/// chroot jails without root. This requires the newuidmap and newgidmap
/// set-uid-root helpers, unless only a single user id is mapped.
#[derive(Parser, Debug)]
#[command(name = "userjail", version, about)]
pub struct Cli {
    /// Path of the rootfs to enter.
    pub rootfs: Option<PathBuf>,

    /// Path to config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Dump default config and exit.
    #[arg(long)]
    pub dump_config: bool,

    /// Set the verbosity of messages.
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Run the program as a subprocess instead of replacing this process.
    #[arg(short, long)]
    pub subprocess: bool,

    /// Paths to bind into the new root, as `path` or `source:dest`.
    #[arg(long, num_args = 1..)]
    pub binds: Option<Vec<BindSpec>>,

    /// Static qemu interpreter to copy into the jail.
    #[arg(long)]
    pub qemu: Option<PathBuf>,

    /// After entering the jail, assume this uid and gid.
    #[arg(long, num_args = 2, value_names = ["UID", "GID"])]
    pub identity: Option<Vec<u32>>,

    /// Outside uids mapped to the jail's uids starting at 1.
    #[arg(long, num_args = 2, value_names = ["START", "COUNT"])]
    pub uid_range: Option<Vec<u32>>,

    /// Outside gids mapped to the jail's gids starting at 1.
    #[arg(long, num_args = 2, value_names = ["START", "COUNT"])]
    pub gid_range: Option<Vec<u32>>,

    /// Working directory inside the jail.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Source of the namespace's id maps.
    #[arg(long, value_enum)]
    pub id_mapping: Option<IdMapping>,

    /// Seconds to wait for the id map helper, 0 waits forever.
    #[arg(long, value_name = "SECONDS")]
    pub handshake_timeout: Option<u64>,

    /// The path of the program to execute.
    #[arg(long)]
    pub exbin: Option<PathBuf>,

    /// The argument vector of the executed program.
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub argv: Option<Vec<String>>,

    /// Environment of the executed program, as `KEY=VALUE`.
    #[arg(long, num_args = 1.., value_parser = parse_env)]
    pub env: Option<Vec<(String, String)>>,
}

impl Cli {
    /// Configuration layer of all options set on the command line.
    pub fn overrides(&self) -> ConfigFile {
        let pair = |values: &Vec<u32>| (values[0], values[1]);
        let env = self.env.as_ref().map(|env| {
            let env = env.iter().map(|(key, value)| (key.clone(), Value::String(value.clone())));
            Some(env.collect::<BTreeMap<_, _>>())
        });

        ConfigFile {
            rootfs: self.rootfs.clone(),
            binds: self.binds.clone(),
            qemu: self.qemu.clone(),
            identity: self.identity.as_ref().map(|ids| Identity::from(pair(ids))),
            uid_range: self.uid_range.as_ref().map(|range| IdRange::from(pair(range))),
            gid_range: self.gid_range.as_ref().map(|range| IdRange::from(pair(range))),
            cwd: self.cwd.clone(),
            id_mapping: self.id_mapping,
            handshake_timeout: self.handshake_timeout,
            severities: None,
            exbin: self.exbin.clone(),
            argv: self.argv.clone(),
            env,
            unknown: BTreeMap::new(),
        }
    }
}

/// Log verbosity.
#[derive(ValueEnum, Copy, Clone, PartialEq, Eq, Debug)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

fn parse_env(var: &str) -> Result<(String, String), String> {
    match var.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.into(), value.into())),
        _ => Err(format!("expected KEY=VALUE, got {var:?}")),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides() {
        let cli = Cli::parse_from([
            "userjail",
            "/tmp/r",
            "--identity",
            "1000",
            "100",
            "--uid-range",
            "100000",
            "65536",
            "--binds",
            "/dev/urandom",
            "/src:/opt/src",
            "--env",
            "LC_ALL=C",
        ]);
        let file = cli.overrides();

        assert_eq!(file.rootfs, Some(PathBuf::from("/tmp/r")));
        assert_eq!(file.identity, Some(Identity { uid: 1000, gid: 100 }));
        assert_eq!(file.uid_range, Some(IdRange::new(100000, 65536)));
        assert_eq!(file.gid_range, None);
        assert_eq!(file.binds.unwrap()[1], BindSpec::new("/src", "/opt/src"));

        let env = file.env.unwrap().unwrap();
        assert_eq!(env.get("LC_ALL"), Some(&Value::String("C".into())));
    }

    #[test]
    fn invalid_env() {
        assert!(Cli::try_parse_from(["userjail", "--env", "NOVALUE"]).is_err());
        assert!(Cli::try_parse_from(["userjail", "--env", "=x"]).is_err());
    }
}
