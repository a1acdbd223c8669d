use crate::config::LoggingConfig;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "info";

/// Keeps Sentry and the log file writer alive. Dropping it flushes both.
pub struct LogGuards {
    _sentry: Option<sentry::ClientInitGuard>,
    _file: Option<WorkerGuard>,
}

/// Installs the global subscriber. Logs go to stderr, to the configured log
/// file, and to Sentry when a DSN is configured.
pub fn init(config: Option<&LoggingConfig>) -> LogGuards {
    let sentry = config
        .and_then(|config| config.sentry_dsn.as_deref())
        .and_then(|dsn| match dsn.parse::<sentry::types::Dsn>() {
            Ok(dsn) => Some(sentry::init(sentry::ClientOptions {
                dsn: Some(dsn),
                release: sentry::release_name!(),
                ..Default::default()
            })),
            Err(err) => {
                eprintln!("Invalid sentry DSN, error reporting disabled: {err}");
                None
            }
        });

    let file = config
        .and_then(|config| config.log_file.as_deref())
        .and_then(|path| match open_appender(path) {
            Ok(file) => Some(file),
            Err(err) => {
                eprintln!("Could not open log file {}, file logging disabled: {err}", path.display());
                None
            }
        });
    let (file_writer, file_guard) = file.unzip();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_writer.map(|writer| fmt::layer().with_ansi(false).with_writer(writer)))
        .with(sentry.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    LogGuards {
        _sentry: sentry,
        _file: file_guard,
    }
}

/// Opens `path` for appending behind a background writer thread.
fn open_appender(path: &Path) -> io::Result<(NonBlocking, WorkerGuard)> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "log file has no file name"))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .map_err(io::Error::other)?;

    Ok(tracing_appender::non_blocking(appender))
}

/// Copies the log file to `out`. A log that was never written prints nothing.
pub fn print_log(path: &Path, out: &mut impl Write) -> io::Result<()> {
    match File::open(path) {
        Ok(mut file) => io::copy(&mut file, out).map(|_| ()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Truncates the log file in place so an open appender keeps working.
pub fn clear_log(path: &Path) -> io::Result<()> {
    match OpenOptions::new().write(true).open(path) {
        Ok(file) => file.set_len(0),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
