use std::{fmt, str::FromStr};

/// Severity of a log record, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Silly,
    Debug,
    Verbose,
    Http,
    Info,
    Warn,
    Error,
}

impl Level {
    pub const ALL: [Level; 7] = [
        Level::Silly,
        Level::Debug,
        Level::Verbose,
        Level::Http,
        Level::Info,
        Level::Warn,
        Level::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Silly => "silly",
            Level::Debug => "debug",
            Level::Verbose => "verbose",
            Level::Http => "http",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }

    /// True when a sink with threshold `self` should take a record of `level`.
    pub fn admits(&self, level: Level) -> bool {
        level >= *self
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log level '{0}'")]
pub struct ParseLevelError(String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseLevelError(s.to_string()))
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Level::Error,
            log::Level::Warn => Level::Warn,
            log::Level::Info => Level::Info,
            log::Level::Debug => Level::Debug,
            log::Level::Trace => Level::Silly,
        }
    }
}
