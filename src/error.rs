use std::{
    collections::VecDeque,
    io::{self, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

/// Errors the logger contains instead of handing them to log callers.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed writing to log file {}", path.display())]
    SinkWrite {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },

    #[error("failed rotating log file {}", path.display())]
    Rotation {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },

    #[error("failed compressing retired log file {}", path.display())]
    Compression {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },

    #[error("unhandled process fault: {message}")]
    UnhandledFault { message: String },
}

const MAX_PENDING: usize = 64;

/// Fallback channel for errors raised inside sinks.
///
/// Every report is counted and echoed to stderr. The most recent reports are kept
/// until someone drains them, older ones are dropped once the buffer is full.
/// A failing echo (closed stderr, broken pipe) is ignored.
pub struct ErrorChannel {
    reported: AtomicU64,
    pending: Mutex<VecDeque<LogError>>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::with_writer(Box::new(io::stderr()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            reported: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            out: Mutex::new(out),
        }
    }

    pub fn report(&self, error: LogError) {
        self.reported.fetch_add(1, Ordering::Relaxed);

        {
            let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = match std::error::Error::source(&error) {
                Some(cause) => writeln!(out, "dailylog: {} ({})", error, cause),
                None => writeln!(out, "dailylog: {}", error),
            }
            .and_then(|_| out.flush());
        }

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.len() == MAX_PENDING {
            pending.pop_front();
        }
        pending.push_back(error);
    }

    /// Total number of errors reported since creation.
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }

    pub fn drain(&self) -> Vec<LogError> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}
