use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::NaiveDate;
use eyre::Context;

use super::{
    rotation::{self, FilePattern, RetainedFile, RotationState},
    LogFormatter, LogSink,
};
use crate::{
    config::{FlushPolicy, SinkConfig},
    error::{ErrorChannel, LogError},
    Level, LogRecord,
};

struct ActiveFile {
    writer: BufWriter<File>,
    rotation: RotationState,
}

/// Daily rotated file. The mutex serializes appends so lines never interleave.
pub struct FileSink {
    config: SinkConfig,
    pattern: FilePattern,
    formatter: Box<dyn LogFormatter>,
    active: Mutex<Option<ActiveFile>>,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl FileSink {
    pub fn open(
        config: SinkConfig,
        formatter: Box<dyn LogFormatter>,
        today: NaiveDate,
        errors: &ErrorChannel,
    ) -> eyre::Result<Self> {
        config.validate()?;
        let pattern = FilePattern::parse(&config.filename_pattern)?;

        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!(
                "Failed creating log directory {}",
                config.directory.display()
            )
        })?;

        let path = config
            .directory
            .join(pattern.file_name(today, &config.date_pattern));
        let file = open_append(&path)
            .with_context(|| format!("Failed opening or creating log file {}", path.display()))?;

        let mut rotation = RotationState::new(today, path, config.max_retained_files);

        match rotation::discover(&config.directory, &pattern, &config.date_pattern) {
            Ok(found) => rotation.adopt(rotation::settle_duplicates(found, today, errors)),
            Err(cause) => errors.report(LogError::Rotation {
                path: config.directory.clone(),
                cause,
            }),
        }

        let sink = Self {
            config,
            pattern,
            formatter,
            active: Mutex::new(None),
        };

        let mut active = ActiveFile {
            writer: BufWriter::new(file),
            rotation,
        };
        sink.enforce_retention(&mut active, errors);
        *sink.lock() = Some(active);

        Ok(sink)
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveFile>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.lock().as_ref().map(|a| a.rotation.current_path.clone())
    }

    /// Retired files still on disk, oldest first.
    pub fn retained_files(&self) -> Vec<RetainedFile> {
        self.lock()
            .as_ref()
            .map(|a| a.rotation.retained().cloned().collect())
            .unwrap_or_default()
    }

    fn rotate(&self, active: &mut ActiveFile, date: NaiveDate, errors: &ErrorChannel) {
        let next_path = self
            .config
            .directory
            .join(self.pattern.file_name(date, &self.config.date_pattern));

        // Keep appending to the old file until a new one can be opened.
        let file = match open_append(&next_path) {
            Ok(file) => file,
            Err(cause) => {
                errors.report(LogError::Rotation {
                    path: next_path,
                    cause,
                });
                return;
            }
        };

        let mut retired = std::mem::replace(&mut active.writer, BufWriter::new(file));
        if let Err(cause) = retired.flush() {
            errors.report(LogError::SinkWrite {
                path: active.rotation.current_path.clone(),
                cause,
            });
        }
        drop(retired);

        let retired = active.rotation.advance(date, next_path);

        if self.config.compress_retired {
            match rotation::compress(&retired.path) {
                Ok(path) => active.rotation.replace_retained_path(retired.date, path),
                Err(e) => errors.report(e),
            }
        }

        self.enforce_retention(active, errors);
    }

    fn enforce_retention(&self, active: &mut ActiveFile, errors: &ErrorChannel) {
        for file in active.rotation.evict() {
            if let Err(e) = rotation::remove(&file) {
                errors.report(e);
            }
        }
    }
}

impl LogSink for FileSink {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn threshold(&self) -> Level {
        self.config.level
    }

    fn write_log(&self, record: &LogRecord, errors: &ErrorChannel) -> Result<(), LogError> {
        if !self.accepts(record.level) {
            return Ok(());
        }

        let line = self.formatter.format(record);

        let mut guard = self.lock();
        let Some(active) = guard.as_mut() else {
            return Ok(());
        };

        let date = record.timestamp.date_naive();
        if active.rotation.should_rotate(date) {
            self.rotate(active, date, errors);
        }

        let mut written = writeln!(active.writer, "{}", line);
        if written.is_ok() && self.config.flush == FlushPolicy::Immediate {
            written = active.writer.flush();
        }

        written.map_err(|cause| LogError::SinkWrite {
            path: active.rotation.current_path.clone(),
            cause,
        })
    }

    fn flush(&self) -> Result<(), LogError> {
        match self.lock().as_mut() {
            Some(active) => active.writer.flush().map_err(|cause| LogError::SinkWrite {
                path: active.rotation.current_path.clone(),
                cause,
            }),
            None => Ok(()),
        }
    }

    fn close(&self) -> Result<(), LogError> {
        let Some(active) = self.lock().take() else {
            return Ok(());
        };

        let path = active.rotation.current_path;
        active
            .writer
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all())
            .map_err(|cause| LogError::SinkWrite { path, cause })
    }
}

/// Colored output on stdout. Write failures are swallowed.
pub struct ConsoleSink {
    level: Level,
    formatter: Box<dyn LogFormatter>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn new(level: Level, formatter: Box<dyn LogFormatter>) -> Self {
        Self::with_writer(level, formatter, Box::new(io::stdout()))
    }

    pub fn with_writer(
        level: Level,
        formatter: Box<dyn LogFormatter>,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            level,
            formatter,
            out: Mutex::new(out),
        }
    }
}

impl LogSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn threshold(&self) -> Level {
        self.level
    }

    fn write_log(&self, record: &LogRecord, _errors: &ErrorChannel) -> Result<(), LogError> {
        if self.accepts(record.level) {
            let line = self.formatter.format(record);
            let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = writeln!(out, "{}", line).and_then(|_| out.flush());
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), LogError> {
        let _ = self
            .out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush();
        Ok(())
    }

    fn close(&self) -> Result<(), LogError> {
        self.flush()
    }
}
