use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::Level;

/// A single log event. Built fresh for every log call and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub label: Arc<str>,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: Level, label: Arc<str>, message: impl Into<String>) -> Self {
        Self::at(Local::now(), level, label, message)
    }

    pub fn at(
        timestamp: DateTime<Local>,
        level: Level,
        label: Arc<str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            level,
            label,
            message: message.into(),
        }
    }
}
