use std::{io, process};

use clap::Parser;
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use crate::cli::{Cli, LogLevel};
use crate::config::{ConfigFile, JailConfig};
use crate::error::JailError;

mod cli;
mod config;
mod error;
mod exec;
mod handshake;
mod helper;
mod jail;
mod mounts;
mod namespaces;
mod subid;

fn main() {
    let cli = Cli::parse();

    if cli.dump_config {
        if let Err(err) = config::dump_default(io::stdout().lock()) {
            eprintln!("Failed to dump config: {err}");
            process::exit(1);
        }
        return;
    }

    init_logging(cli.log_level);

    match run(&cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        },
    }
}

/// Enter the jail and launch the configured program.
///
/// Returns the exit code of the program when it runs as a subprocess, in
/// which case only the subprocess enters the jail.
fn run(cli: &Cli) -> Result<i32, JailError> {
    let file = match cli.config.clone().or_else(config::default_path) {
        Some(path) => {
            debug!("Loading config {path:?}");
            ConfigFile::load(path)?
        },
        None => ConfigFile::default(),
    };
    let (jail_config, exec) = file.merge(cli.overrides()).build()?;

    if cli.subprocess {
        let status = exec.spawn(|| enter(&jail_config))?;
        return Ok(status.code().unwrap_or(1));
    }

    enter(&jail_config)?;
    Err(exec.exec())
}

/// Enter the jail in the calling process.
fn enter(jail_config: &JailConfig) -> Result<(), JailError> {
    let context = jail::enter(jail_config)?;
    debug_assert_eq!(context.stage(), jail::Stage::Ready);
    debug!(
        "Jail ready, {} bind mounts, {} failed, private mount namespace: {}",
        context.mounts.mounted().count(),
        context.mounts.failures().count(),
        context.mount_namespace,
    );
    Ok(())
}

fn init_logging(level: LogLevel) {
    let filter = LevelFilter::from_level(level.into());
    let log_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr).with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}
