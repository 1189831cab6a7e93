//! Logging sink selection (grounded on `examples/original_source/log.c`).
//!
//! stdout carries the ident response and stdin the query, so this daemon
//! cannot log to either: the default sink is syslog, with `--log-stderr` as
//! an explicit debugging escape hatch (the original's `-e` flag warns that
//! this may be visible to the remote end through some super-servers).

use log::LevelFilter;
use syslog::{BasicLogger, Facility, Formatter3164};

/// Maps the repeatable `-v`/`-q` verbosity dial onto a `log` level filter,
/// matching the thresholds in the original: warnings need verbosity >= 1,
/// notices >= 2 (the default), debug chatter >= 3.
fn level_for_verbosity(verbosity: i32) -> LevelFilter {
    match verbosity {
        v if v <= 0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

/// Install the global logger. Falls back to stderr logging (with a warning
/// logged through the very fallback it's reporting) if the syslog
/// connection cannot be opened.
pub fn init(program_name: &str, use_syslog: bool, verbosity: i32) {
    let level = level_for_verbosity(verbosity);

    if use_syslog {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: program_name.into(),
            pid: std::process::id(),
        };

        match syslog::unix(formatter) {
            Ok(logger) => {
                let boxed = Box::new(BasicLogger::new(logger));
                if log::set_boxed_logger(boxed).is_ok() {
                    log::set_max_level(level);
                    return;
                }
            }
            Err(err) => {
                init_stderr(level);
                log::warn!("could not open syslog, logging to stderr instead: {err}");
                return;
            }
        }
    }

    init_stderr(level);
}

fn init_stderr(level: LevelFilter) {
    let _ = log::set_boxed_logger(Box::new(StderrLogger)).map(|()| log::set_max_level(level));
}

/// A minimal stderr logger matching the original's per-level prefixes.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let prefix = match record.level() {
            log::Level::Error => "ERROR: ",
            log::Level::Warn => "Warning: ",
            log::Level::Info => "Notice: ",
            log::Level::Debug | log::Level::Trace => "# ",
        };
        eprintln!("{prefix}{}", record.args());
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_thresholds_match_the_original() {
        assert_eq!(level_for_verbosity(0), LevelFilter::Error);
        assert_eq!(level_for_verbosity(1), LevelFilter::Warn);
        assert_eq!(level_for_verbosity(2), LevelFilter::Info);
        assert_eq!(level_for_verbosity(3), LevelFilter::Debug);
        assert_eq!(level_for_verbosity(10), LevelFilter::Debug);
    }
}
