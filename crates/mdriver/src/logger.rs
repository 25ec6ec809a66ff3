//! Logger setup: `env_logger` with colored level tags on stderr.

use core::fmt;
use std::io::Write as _;

use env_logger::{Builder, Target};
use log::{Level, LevelFilter, SetLoggerError};

use crate::style::{Color, WithFg};

struct LevelFormat(Level);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (color, msg) = match self.0 {
            Level::Trace => (Color::Magenta, "TRACE"),
            Level::Debug => (Color::Blue, "DEBUG"),
            Level::Info => (Color::Green, " INFO"),
            Level::Warn => (Color::Yellow, " WARN"),
            Level::Error => (Color::Red, "ERROR"),
        };
        fmt::Display::fmt(&WithFg::new(color, msg), f)
    }
}

fn builder(level: LevelFilter) -> Builder {
    let mut builder = Builder::new();
    builder
        .filter_level(level)
        .parse_default_env()
        .target(Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {}: {}",
                LevelFormat(record.level()),
                record.target(),
                record.args()
            )
        });
    builder
}

/// Installs the stderr logger.
///
/// `level` comes from the command line; `RUST_LOG` may refine it per module.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    builder(level).try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_format() {
        assert_eq!(
            LevelFormat(Level::Warn).to_string(),
            "\x1B[33;1m WARN\x1B[0m"
        );
        assert_eq!(
            LevelFormat(Level::Trace).to_string(),
            "\x1B[35;1mTRACE\x1B[0m"
        );
    }

    #[test]
    fn test_builder_uses_cli_level() {
        use log::{Log as _, Metadata};

        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let logger = builder(LevelFilter::Warn).build();
        assert_eq!(logger.filter(), LevelFilter::Warn);
        let debug = Metadata::builder().level(Level::Debug).target("mm").build();
        let warn = Metadata::builder().level(Level::Warn).target("mm").build();
        assert!(!logger.enabled(&debug));
        assert!(logger.enabled(&warn));
    }
}
