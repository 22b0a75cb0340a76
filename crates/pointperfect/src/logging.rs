//! Process-wide logging setup.

use log::{Level, LevelFilter};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::corrections::STATS_TARGET;

/// Logging preferences taken from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogOptions {
    pub level: LevelFilter,
    /// Mirror all output into this file
    pub log_file: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            log_file: None,
        }
    }
}

/// Effective level: the `--trace` base, raised to debug by the logging flag.
pub fn effective_level(base: LevelFilter, verbose: bool) -> LevelFilter {
    if verbose {
        base.max(LevelFilter::Debug)
    } else {
        base
    }
}

/// Parse the `--trace` names (CRITICAL, ERROR, WARNING, INFO, DEBUG).
pub fn parse_trace_level(s: &str) -> Result<LevelFilter, String> {
    match s.to_ascii_uppercase().as_str() {
        "CRITICAL" | "ERROR" => Ok(LevelFilter::Error),
        "WARNING" | "WARN" => Ok(LevelFilter::Warn),
        "INFO" => Ok(LevelFilter::Info),
        "DEBUG" => Ok(LevelFilter::Debug),
        "TRACE" => Ok(LevelFilter::Trace),
        _ => Err(format!(
            "Invalid trace level '{}'. Expected CRITICAL, ERROR, WARNING, INFO or DEBUG",
            s
        )),
    }
}

/// Initialize env_logger for the rest of the process.
///
/// Records are written as `LEVEL message` to stdout, and also to the log file
/// when one is given. `RUST_LOG` still takes precedence over the level.
/// Statistics lines are always printed, labelled `STATS`.
pub fn setup_logging(options: &LogOptions) -> io::Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(options.level.to_string()),
    );
    builder
        .filter_module(STATS_TARGET, LevelFilter::Info)
        .format(|buf, record| writeln!(buf, "{} {}", label(record), record.args()));

    match &options.log_file {
        Some(path) => {
            builder.target(env_logger::Target::Pipe(Box::new(Tee::create(path)?)));
        }
        None => {
            builder.target(env_logger::Target::Stdout);
        }
    }

    // a second initialization (e.g. from tests) keeps the first logger
    drop(builder.try_init());
    Ok(())
}

fn label(record: &log::Record<'_>) -> &'static str {
    if record.target() == STATS_TARGET {
        return "STATS";
    }
    match record.level() {
        Level::Error => "ERROR",
        Level::Warn => "WARNING",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Writer that duplicates output to stdout and a file.
struct Tee {
    file: File,
}

impl Tee {
    fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::create(path)?,
        })
    }
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_raises_to_debug() {
        assert_eq!(effective_level(LevelFilter::Info, true), LevelFilter::Debug);
        assert_eq!(effective_level(LevelFilter::Error, true), LevelFilter::Debug);
        assert_eq!(effective_level(LevelFilter::Info, false), LevelFilter::Info);
    }

    #[test]
    fn test_verbose_keeps_finer_levels() {
        assert_eq!(effective_level(LevelFilter::Trace, true), LevelFilter::Trace);
    }

    #[test]
    fn test_parse_trace_level() {
        assert_eq!(parse_trace_level("CRITICAL"), Ok(LevelFilter::Error));
        assert_eq!(parse_trace_level("warning"), Ok(LevelFilter::Warn));
        assert_eq!(parse_trace_level("Info"), Ok(LevelFilter::Info));
        assert_eq!(parse_trace_level("DEBUG"), Ok(LevelFilter::Debug));
        assert!(parse_trace_level("LOUD").is_err());
    }

    #[test]
    fn test_tee_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut tee = Tee::create(&path).unwrap();
        tee.write_all(b"INFO hello\n").unwrap();
        tee.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "INFO hello\n");
    }

    #[test]
    fn test_stats_label() {
        let record = log::Record::builder()
            .target(STATS_TARGET)
            .level(Level::Info)
            .build();
        assert_eq!(label(&record), "STATS");

        let record = log::Record::builder()
            .target("pointperfect::service")
            .level(Level::Warn)
            .build();
        assert_eq!(label(&record), "WARNING");
    }
}
