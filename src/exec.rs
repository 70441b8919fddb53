//! Launching the program inside the jail.

use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus};

use crate::error::JailError;

/// Default program started inside the jail.
const DEFAULT_BIN: &str = "/bin/bash";

/// Exit status of a child which could not enter the jail.
const ENTER_FAILED: i32 = 1;

/// Exit status of a child whose program could not be started.
const EXEC_FAILED: i32 = 127;

/// Default `PATH` inside the jail.
const DEFAULT_PATH: &[&str] = &["/usr/sbin", "/usr/bin", "/sbin", "/bin"];

/// Program, arguments and environment to run after entering the jail.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExecSpec {
    pub exbin: PathBuf,
    /// Full argument vector, including `argv[0]`.
    pub argv: Vec<String>,
    /// Environment, `None` inherits the host environment.
    pub env: Option<Vec<(String, String)>>,
}

impl Default for ExecSpec {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

impl ExecSpec {
    /// Fill in defaults for all unspecified settings.
    ///
    /// Without an explicit `argv`, `argv[0]` is the file name of `exbin`.
    pub fn new(
        exbin: Option<PathBuf>,
        argv: Option<Vec<String>>,
        env: Option<Option<Vec<(String, String)>>>,
    ) -> Self {
        let exbin = exbin.unwrap_or_else(|| PathBuf::from(DEFAULT_BIN));
        let argv = argv.filter(|argv| !argv.is_empty()).unwrap_or_else(|| {
            let name = exbin.file_name().map(|name| name.to_string_lossy().into_owned());
            vec![name.unwrap_or_else(|| "bash".into())]
        });
        let env =
            env.unwrap_or_else(|| Some(vec![("PATH".into(), DEFAULT_PATH.join(":"))]));
        Self { exbin, argv, env }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.exbin);
        command.arg0(&self.argv[0]).args(&self.argv[1..]);
        if let Some(env) = &self.env {
            command.env_clear().envs(env.iter().map(|(key, value)| (key, value)));
        }
        command
    }

    /// Replace the current process with the program.
    ///
    /// This only returns if the program could not be started.
    pub fn exec(&self) -> JailError {
        let error = self.command().exec();
        JailError::Exec { path: self.exbin.clone(), error }
    }

    /// Run the program in a child process and wait for it to exit.
    ///
    /// Only the child calls `enter` before replacing itself with the program,
    /// the calling process stays outside of the jail.
    pub fn spawn<F>(&self, enter: F) -> Result<ExitStatus, JailError>
    where
        F: FnOnce() -> Result<(), JailError>,
    {
        let exec_error = |error| JailError::Exec { path: self.exbin.clone(), error };

        let pid = match unsafe { libc::fork() } {
            -1 => return Err(exec_error(io::Error::last_os_error())),
            0 => {
                let code = match enter() {
                    Ok(()) => {
                        eprintln!("Error: {}", self.exec());
                        EXEC_FAILED
                    },
                    Err(err) => {
                        eprintln!("Error: {err}");
                        ENTER_FAILED
                    },
                };
                unsafe { libc::_exit(code) }
            },
            pid => pid,
        };

        let mut status = 0;
        loop {
            let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
            if ret != -1 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(exec_error(err));
            }
        }

        Ok(ExitStatus::from_raw(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let spec = ExecSpec::default();
        assert_eq!(spec.exbin, PathBuf::from("/bin/bash"));
        assert_eq!(spec.argv, vec!["bash".to_string()]);
        assert_eq!(spec.env, Some(vec![("PATH".into(), "/usr/sbin:/usr/bin:/sbin:/bin".into())]));
    }

    #[test]
    fn argv_from_exbin() {
        let spec = ExecSpec::new(Some("/usr/bin/python3".into()), None, Some(None));
        assert_eq!(spec.argv, vec!["python3".to_string()]);
        assert_eq!(spec.env, None);
    }

    #[test]
    fn spawn_reports_status() {
        let spec = ExecSpec::new(
            Some("/bin/sh".into()),
            Some(vec!["sh".into(), "-c".into(), "exit 3".into()]),
            None,
        );
        assert_eq!(spec.spawn(|| Ok(())).unwrap().code(), Some(3));
    }

    #[test]
    fn spawn_missing_program() {
        let spec = ExecSpec::new(Some("/nonexistent/program".into()), None, None);
        assert_eq!(spec.spawn(|| Ok(())).unwrap().code(), Some(EXEC_FAILED));
    }

    #[test]
    fn spawn_enters_only_in_child() {
        let marker = tempfile::tempdir().unwrap();
        let entered = marker.path().join("entered");
        let spec = ExecSpec::new(
            Some("/bin/sh".into()),
            Some(vec!["sh".into(), "-c".into(), "exit 0".into()]),
            None,
        );

        let status = spec.spawn(|| {
            std::fs::write(&entered, std::process::id().to_string()).unwrap();
            Err(JailError::Config("no jail".into()))
        });

        assert_eq!(status.unwrap().code(), Some(ENTER_FAILED));
        let child_pid = std::fs::read_to_string(&entered).unwrap();
        assert_ne!(child_pid, std::process::id().to_string());
    }
}
