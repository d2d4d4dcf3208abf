use std::{collections::HashSet, path::PathBuf};

use chrono::{
    format::{Item, StrftimeItems},
    NaiveDate,
};
use eyre::{ensure, eyre, Context};

use crate::{logging::FilePattern, Level};

pub const DATE_PLACEHOLDER: &str = "%DATE%";
pub const DEFAULT_DATE_PATTERN: &str = "%Y-%m-%d";
pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DEFAULT_MAX_RETAINED_FILES: usize = 30;

/// Environment variable selecting the execution mode.
pub const MODE_ENV_VAR: &str = "APP_ENV";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Production,
    Development,
}

impl Mode {
    pub fn from_env() -> Self {
        Self::from_value(std::env::var(MODE_ENV_VAR).ok().as_deref())
    }

    pub fn from_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("production") => Mode::Production,
            _ => Mode::Development,
        }
    }

    pub fn console_enabled(&self) -> bool {
        *self == Mode::Development
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Flush after every line.
    Immediate,
    /// Let the writer buffer fill; flushed on rotation, `flush` and shutdown.
    Buffered,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub name: String,
    pub level: Level,
    pub directory: PathBuf,
    pub filename_pattern: String,
    pub date_pattern: String,
    pub max_retained_files: usize,
    pub compress_retired: bool,
    pub flush: FlushPolicy,
}

impl SinkConfig {
    pub fn new(
        name: impl Into<String>,
        level: Level,
        directory: impl Into<PathBuf>,
        filename_pattern: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            level,
            directory: directory.into(),
            filename_pattern: filename_pattern.into(),
            date_pattern: DEFAULT_DATE_PATTERN.to_string(),
            max_retained_files: DEFAULT_MAX_RETAINED_FILES,
            compress_retired: false,
            flush: if level >= Level::Error {
                FlushPolicy::Immediate
            } else {
                FlushPolicy::Buffered
            },
        }
    }

    pub fn with_max_retained_files(self, max_retained_files: usize) -> Self {
        Self {
            max_retained_files,
            ..self
        }
    }

    pub fn with_compression(self, compress_retired: bool) -> Self {
        Self {
            compress_retired,
            ..self
        }
    }

    pub fn with_flush(self, flush: FlushPolicy) -> Self {
        Self { flush, ..self }
    }

    pub fn with_date_pattern(self, date_pattern: impl Into<String>) -> Self {
        Self {
            date_pattern: date_pattern.into(),
            ..self
        }
    }

    pub fn validate(&self) -> eyre::Result<()> {
        ensure!(!self.name.is_empty(), "sink name must not be empty");

        FilePattern::parse(&self.filename_pattern)
            .with_context(|| format!("invalid filename pattern for sink '{}'", self.name))?;

        validate_date_pattern(&self.date_pattern)
            .with_context(|| format!("invalid date pattern for sink '{}'", self.name))
    }

    fn target(&self) -> (PathBuf, String) {
        (self.directory.clone(), self.filename_pattern.clone())
    }
}

fn has_invalid_items(pattern: &str) -> bool {
    StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error))
}

fn validate_date_pattern(pattern: &str) -> eyre::Result<()> {
    ensure!(
        !has_invalid_items(pattern),
        "'{}' is not a valid date format",
        pattern
    );

    let sample = NaiveDate::from_ymd_opt(2024, 11, 23).ok_or_else(|| eyre!("bad sample date"))?;
    let rendered = sample.format(pattern).to_string();

    ensure!(
        !rendered.contains(['/', '\\']),
        "date pattern '{}' renders a path separator",
        pattern
    );

    let parsed = NaiveDate::parse_from_str(&rendered, pattern)
        .with_context(|| format!("date pattern '{}' can't be parsed back", pattern))?;
    ensure!(
        parsed == sample,
        "date pattern '{}' doesn't identify a single calendar day",
        pattern
    );

    Ok(())
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub label: String,
    pub mode: Mode,
    pub sinks: Vec<SinkConfig>,
    /// Sinks only written to when the process faults.
    pub exception_sinks: Vec<SinkConfig>,
    /// Threshold of the console sink attached in development mode.
    pub console_level: Level,
    pub use_ansi: bool,
    pub datetime_format: String,
}

impl LoggerConfig {
    pub fn new(label: impl Into<String>, mode: Mode) -> Self {
        Self {
            label: label.into(),
            mode,
            sinks: Vec::new(),
            exception_sinks: Vec::new(),
            console_level: Level::Info,
            use_ansi: true,
            datetime_format: DEFAULT_DATETIME_FORMAT.to_string(),
        }
    }

    /// The default layout: general, error and silly logs plus an exception log, all rotated
    /// daily under `root`.
    pub fn standard(label: impl Into<String>, root: impl Into<PathBuf>, mode: Mode) -> Self {
        let root: PathBuf = root.into();

        let file_sink = |name: &str, level, dir: PathBuf, pattern: &str| {
            SinkConfig::new(name, level, dir, pattern)
                .with_max_retained_files(DEFAULT_MAX_RETAINED_FILES)
                .with_compression(true)
        };

        Self {
            sinks: vec![
                file_sink("info", Level::Info, root.clone(), "%DATE%.log"),
                file_sink("error", Level::Error, root.join("error"), "%DATE%.error.log"),
                file_sink("silly", Level::Silly, root.clone(), "%DATE%.silly.log"),
            ],
            exception_sinks: vec![file_sink(
                "exception",
                Level::Error,
                root,
                "%DATE%.exception.log",
            )],
            ..Self::new(label, mode)
        }
    }

    /// Standard layout under `<cwd>/logs`, mode taken from `APP_ENV`.
    pub fn from_env(label: impl Into<String>) -> eyre::Result<Self> {
        let cwd = std::env::current_dir().context("Failed resolving working directory")?;
        Ok(Self::standard(label, cwd.join("logs"), Mode::from_env()))
    }

    pub fn with_sink(mut self, sink: SinkConfig) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_exception_sink(mut self, sink: SinkConfig) -> Self {
        self.exception_sinks.push(sink);
        self
    }

    pub fn with_ansi(self, use_ansi: bool) -> Self {
        Self { use_ansi, ..self }
    }

    pub fn with_console_level(self, console_level: Level) -> Self {
        Self {
            console_level,
            ..self
        }
    }

    pub fn validate(&self) -> eyre::Result<()> {
        ensure!(
            !has_invalid_items(&self.datetime_format),
            "'{}' is not a valid timestamp format",
            self.datetime_format
        );

        let mut names = HashSet::new();
        let mut targets = HashSet::new();

        for sink in self.sinks.iter().chain(&self.exception_sinks) {
            sink.validate()?;

            ensure!(
                names.insert(sink.name.as_str()),
                "duplicate sink name '{}'",
                sink.name
            );
            ensure!(
                targets.insert(sink.target()),
                "sink '{}' writes to the same files as another sink",
                sink.name
            );
        }

        Ok(())
    }
}
