mod formatters;
mod logger;
mod rotation;
mod sinks;

pub use formatters::{ConsoleFormatter, DefaultFormatter};
pub use logger::{initialize, shutdown, Builder, Config, FaultHookGuard, Logger, LoggerHandle};
pub use rotation::{FilePattern, RetainedFile};
pub use sinks::{ConsoleSink, FileSink};

use crate::{
    error::{ErrorChannel, LogError},
    Level, LogRecord,
};

pub trait LogFormatter: Sync + Send {
    fn format(&self, record: &LogRecord) -> String;
}

/// A destination for records. Implementations serialize their own writes.
pub trait LogSink: Sync + Send {
    fn name(&self) -> &str;

    fn threshold(&self) -> Level;

    fn accepts(&self, level: Level) -> bool {
        self.threshold().admits(level)
    }

    /// Non-fatal problems such as a failed retention cleanup go to `errors`; a failed
    /// append is returned so the caller can report it.
    fn write_log(&self, record: &LogRecord, errors: &ErrorChannel) -> Result<(), LogError>;

    fn flush(&self) -> Result<(), LogError>;

    /// Flush and release any handle. Later writes are ignored.
    fn close(&self) -> Result<(), LogError>;
}
