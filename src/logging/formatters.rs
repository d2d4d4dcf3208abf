use serde_json::json;
use yansi::{Color, Condition, Paint};

use super::{logger::Config, LogFormatter};
use crate::{Level, LogRecord};

/// Plain line for files: `<timestamp> [<label>] <level>: <message>`.
pub struct DefaultFormatter {
    config: Config,
}

impl DefaultFormatter {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl LogFormatter for DefaultFormatter {
    fn format(&self, record: &LogRecord) -> String {
        format!(
            "{} [{}] {}: {}",
            record.timestamp.format(&self.config.datetime_format),
            record.label,
            record.level,
            record.message,
        )
    }
}

/// Console rendering: colored level, the message, then label and timestamp as JSON.
pub struct ConsoleFormatter {
    config: Config,
}

impl ConsoleFormatter {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn color(level: Level) -> Color {
        match level {
            Level::Error => Color::Red,
            Level::Warn => Color::Yellow,
            Level::Info => Color::Green,
            Level::Http => Color::Green,
            Level::Verbose => Color::Cyan,
            Level::Debug => Color::Blue,
            Level::Silly => Color::Magenta,
        }
    }

    fn condition(&self) -> Condition {
        if self.config.use_ansi {
            Condition::ALWAYS
        } else {
            Condition::NEVER
        }
    }
}

impl LogFormatter for ConsoleFormatter {
    fn format(&self, record: &LogRecord) -> String {
        let meta = json!({
            "label": &*record.label,
            "timestamp": record.timestamp.format(&self.config.datetime_format).to_string(),
        });

        format!(
            "{}: {} {}",
            record
                .level
                .as_str()
                .fg(Self::color(record.level))
                .whenever(self.condition()),
            record.message,
            meta,
        )
    }
}
