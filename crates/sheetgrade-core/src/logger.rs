//! Process-wide logging.
//!
//! Records go to stderr as `[elapsed LEVEL crate] message`. The CLI installs
//! this logger once through [`init_with_level`]; builds with the `tracing`
//! feature can use [`init_tracing`] for span timings and JSON output.

use std::fmt;
use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

use log::{Level, LevelFilter, Log, Metadata, Record};

struct SheetLogger {
    filter: LevelFilter,
    epoch: Instant,
}

/// One log line without the trailing newline.
fn format_line(elapsed_secs: f64, level: Level, target: &str, args: &fmt::Arguments<'_>) -> String {
    let krate = target.split("::").next().unwrap_or(target);
    format!("[{elapsed_secs:8.3}s {level:>5} {krate}] {args}")
}

impl Log for SheetLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(
            self.epoch.elapsed().as_secs_f64(),
            record.level(),
            record.target(),
            record.args(),
        );
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: OnceLock<SheetLogger> = OnceLock::new();

/// Install the stderr logger. Only the first call has an effect.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let mut installed_here = false;
    let logger = LOGGER.get_or_init(|| {
        installed_here = true;
        SheetLogger {
            filter: level,
            epoch: Instant::now(),
        }
    });
    if installed_here {
        log::set_logger(logger)?;
        log::set_max_level(level);
    }
    Ok(())
}

/// Map a `-v` count onto a level: 0 = warn, 1 = info, 2 = debug, 3+ = trace.
pub fn level_from_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install a `tracing` subscriber and forward `log` records into it.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Span close events
/// carry the stage timings of the grading pipeline.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::EnvFilter;

    let _ = tracing_log::LogTracer::init();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr);

    let installed = if json {
        tracing::subscriber::set_global_default(builder.json().flatten_event(true).finish())
    } else {
        tracing::subscriber::set_global_default(
            builder
                .with_timer(tracing_subscriber::fmt::time::Uptime::default())
                .finish(),
        )
    };
    if installed.is_err() {
        log::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_from_verbosity(0), LevelFilter::Warn);
        assert_eq!(level_from_verbosity(2), LevelFilter::Debug);
        assert_eq!(level_from_verbosity(9), LevelFilter::Trace);
    }

    #[test]
    fn lines_carry_the_crate_name_only() {
        let line = format_line(1.5, Level::Info, "sheetgrade_align::ransac", &format_args!("ok"));
        assert_eq!(line, "[   1.500s  INFO sheetgrade_align] ok");
    }

    #[test]
    fn repeated_init_is_harmless() {
        assert!(init_with_level(LevelFilter::Info).is_ok());
        assert!(init_with_level(LevelFilter::Debug).is_ok());
    }
}
