//! Process-wide logging sink.
//!
//! Logging is initialised once in `main` with [`init`]. Components only use the
//! `log` macros and never open a sink of their own. The level is read from
//! `RUST_LOG` and defaults to `info`.
//!
//! With a log directory, records go to `<dir>/encrypted-notify_<YYYYmmddHHMMSS>.log`
//! formatted as `<timestamp> - <target> - <LEVEL> - <message>`. Otherwise they
//! go to stderr.

use std::{
    fs::{self, File},
    io::Write,
    path::Path,
};

use anyhow::Context;
use chrono::{DateTime, Local};
use env_logger::{Builder, Env, Target, WriteStyle};

/// Prefix of the log file names.
const LOG_FILE_PREFIX: &str = "encrypted-notify";

/// Flushes the logger when dropped.
///
/// Keep it alive until the end of `main`.
#[must_use = "dropping the guard flushes the logger"]
pub struct LogGuard {
    _private: (),
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        log::logger().flush();
    }
}

/// Installs the global logger.
///
/// # Errors
///
/// Returns an error if the log directory or file cannot be created, or if a
/// global logger is already installed.
pub fn init(log_dir: Option<&Path>) -> Result<LogGuard, anyhow::Error> {
    let mut builder = Builder::from_env(Env::default().filter_or("RUST_LOG", "info"));

    if let Some(dir) = log_dir {
        let file = open_log_file(dir, Local::now())?;
        builder
            .target(Target::Pipe(Box::new(file)))
            .write_style(WriteStyle::Never)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} - {} - {} - {}",
                    buf.timestamp(),
                    record.target(),
                    record.level(),
                    record.args()
                )
            });
    }

    builder.try_init().context("failed to install logger")?;

    Ok(LogGuard { _private: () })
}

/// Builds the log file name for a process started at `started_at`.
fn log_file_name(started_at: DateTime<Local>) -> String {
    format!(
        "{}_{}.log",
        LOG_FILE_PREFIX,
        started_at.format("%Y%m%d%H%M%S")
    )
}

/// Creates `dir` if needed and opens a fresh log file in it.
fn open_log_file(dir: &Path, started_at: DateTime<Local>) -> Result<File, anyhow::Error> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let path = dir.join(log_file_name(started_at));
    File::options()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}
