//! Leveled, timestamped logging to daily rotated files.
//!
//! ```no_run
//! use dailylog::{initialize, shutdown, LoggerConfig};
//!
//! let logger = initialize(LoggerConfig::from_env("orders-api")?)?;
//! let _hook = logger.install_fault_hook();
//!
//! logger.info("listening on :8080");
//! logger.error("payment provider unreachable");
//!
//! shutdown(logger);
//! # Ok::<(), eyre::Report>(())
//! ```

mod config;
mod error;
mod level;
pub mod logging;
mod record;

pub use config::{
    FlushPolicy, LoggerConfig, Mode, SinkConfig, DATE_PLACEHOLDER, DEFAULT_MAX_RETAINED_FILES,
    MODE_ENV_VAR,
};
pub use error::{ErrorChannel, LogError};
pub use level::{Level, ParseLevelError};
pub use logging::{initialize, shutdown, Builder, LoggerHandle};
pub use record::LogRecord;
