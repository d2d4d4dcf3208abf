use std::{
    cell::Cell,
    io::Write,
    ops::Deref,
    panic::{self, PanicHookInfo},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::Local;
use eyre::Context;
use log::{LevelFilter, Log};

use super::{
    formatters::{ConsoleFormatter, DefaultFormatter},
    sinks::{ConsoleSink, FileSink},
    LogSink,
};
use crate::{
    config::{LoggerConfig, DEFAULT_DATETIME_FORMAT},
    error::{ErrorChannel, LogError},
    Level, LogRecord,
};

/// Rendering options shared by the formatters.
#[derive(Debug, Clone)]
pub struct Config {
    pub datetime_format: String,
    pub use_ansi: bool,
}

impl Config {
    pub fn new() -> Self {
        Self {
            datetime_format: DEFAULT_DATETIME_FORMAT.to_string(),
            use_ansi: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    // Set while this thread is inside a sink, so records raised from there are dropped
    // instead of deadlocking on the sink's own lock.
    static IN_SINK: Cell<bool> = const { Cell::new(false) };
}

struct SinkScope;

impl SinkScope {
    fn enter() -> Option<Self> {
        if IN_SINK.with(|flag| flag.replace(true)) {
            None
        } else {
            Some(SinkScope)
        }
    }
}

impl Drop for SinkScope {
    fn drop(&mut self) {
        IN_SINK.with(|flag| flag.set(false));
    }
}

pub struct Logger {
    label: Arc<str>,
    sinks: Vec<Box<dyn LogSink>>,
    exception_sinks: Vec<Box<dyn LogSink>>,
    errors: ErrorChannel,
    closed: AtomicBool,
}

impl Logger {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Active sinks in dispatch order.
    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    pub fn enabled(&self, level: Level) -> bool {
        !self.closed.load(Ordering::Acquire) && self.sinks.iter().any(|s| s.accepts(level))
    }

    pub fn log(&self, level: Level, message: impl Into<String>) {
        if self.enabled(level) {
            self.dispatch(&LogRecord::new(level, self.label.clone(), message));
        }
    }

    pub fn silly(&self, message: impl Into<String>) {
        self.log(Level::Silly, message)
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message)
    }

    pub fn verbose(&self, message: impl Into<String>) {
        self.log(Level::Verbose, message)
    }

    pub fn http(&self, message: impl Into<String>) {
        self.log(Level::Http, message)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message)
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::Warn, message)
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message)
    }

    /// Hand `record` to every sink. Sink failures go to the error channel.
    pub fn dispatch(&self, record: &LogRecord) {
        self.write_to(self.sinks.iter(), record);
    }

    fn write_to<'a>(&self, sinks: impl Iterator<Item = &'a Box<dyn LogSink>>, record: &LogRecord) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(_scope) = SinkScope::enter() else {
            return;
        };

        for sink in sinks {
            if let Err(e) = sink.write_log(record, &self.errors) {
                self.errors.report(e);
            }
        }
    }

    /// Record an unrecoverable fault on the regular and exception sinks, then flush.
    pub fn fault(&self, message: impl Into<String>) {
        let fault = LogError::UnhandledFault {
            message: message.into(),
        };
        let record = LogRecord::new(Level::Error, self.label.clone(), fault.to_string());

        self.write_to(self.sinks.iter().chain(&self.exception_sinks), &record);
        self.flush();
    }

    pub fn flush(&self) {
        for sink in self.sinks.iter().chain(&self.exception_sinks) {
            if let Err(e) = sink.flush() {
                self.errors.report(e);
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for sink in self.sinks.iter().chain(&self.exception_sinks) {
            if let Err(e) = sink.close() {
                self.errors.report(e);
            }
        }
    }
}

pub struct Builder {
    config: LoggerConfig,
    console_out: Option<Box<dyn Write + Send>>,
    error_out: Option<Box<dyn Write + Send>>,
    extra_sinks: Vec<Box<dyn LogSink>>,
}

impl Builder {
    pub fn new(config: LoggerConfig) -> Self {
        Self {
            config,
            console_out: None,
            error_out: None,
            extra_sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn LogSink>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    /// Send console output somewhere other than stdout.
    pub fn with_console_writer(self, out: Box<dyn Write + Send>) -> Self {
        Self {
            console_out: Some(out),
            ..self
        }
    }

    /// Echo contained errors somewhere other than stderr.
    pub fn with_error_writer(self, out: Box<dyn Write + Send>) -> Self {
        Self {
            error_out: Some(out),
            ..self
        }
    }

    pub fn build(self) -> eyre::Result<Logger> {
        let config = self.config;
        config.validate().context("Invalid logger configuration")?;

        let render = Config {
            datetime_format: config.datetime_format.clone(),
            use_ansi: config.use_ansi,
        };
        let errors = match self.error_out {
            Some(out) => ErrorChannel::with_writer(out),
            None => ErrorChannel::new(),
        };
        let today = Local::now().date_naive();

        let open = |sink: &crate::SinkConfig| -> eyre::Result<Box<dyn LogSink>> {
            let formatter = Box::new(DefaultFormatter::new(render.clone()));
            let sink = FileSink::open(sink.clone(), formatter, today, &errors)
                .with_context(|| format!("Failed opening sink '{}'", sink.name))?;
            Ok(Box::new(sink))
        };

        let mut sinks = config
            .sinks
            .iter()
            .map(&open)
            .collect::<eyre::Result<Vec<_>>>()?;
        sinks.extend(self.extra_sinks);

        // Most severe threshold first, so the error log is written before anything else.
        sinks.sort_by_key(|s| std::cmp::Reverse(s.threshold()));

        if config.mode.console_enabled() {
            let formatter = Box::new(ConsoleFormatter::new(render.clone()));
            let console = match self.console_out {
                Some(out) => ConsoleSink::with_writer(config.console_level, formatter, out),
                None => ConsoleSink::new(config.console_level, formatter),
            };
            sinks.push(Box::new(console));
        }

        let exception_sinks = config
            .exception_sinks
            .iter()
            .map(&open)
            .collect::<eyre::Result<Vec<_>>>()?;

        Ok(Logger {
            label: Arc::from(config.label.as_str()),
            sinks,
            exception_sinks,
            errors,
            closed: AtomicBool::new(false),
        })
    }
}

/// Shared handle to a logger. Clones are cheap and all point at the same sinks.
#[derive(Clone)]
pub struct LoggerHandle(Arc<Logger>);

impl Deref for LoggerHandle {
    type Target = Logger;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl LoggerHandle {
    pub fn new(logger: Logger) -> Self {
        Self(Arc::new(logger))
    }

    /// Route panics through this logger until the returned guard is dropped.
    ///
    /// The guard puts back whatever hook was installed before this call, so nested
    /// guards must be dropped in reverse order of installation. Dropping an outer guard
    /// first removes every hook installed after it.
    pub fn install_fault_hook(&self) -> FaultHookGuard {
        let logger = self.clone();
        let previous: Arc<PanicHook> = Arc::new(panic::take_hook());
        let chained = previous.clone();

        panic::set_hook(Box::new(move |info| {
            logger.fault(describe_panic(info));
            (**chained)(info);
        }));

        FaultHookGuard {
            previous: Some(previous),
        }
    }

    /// Register as the `log` crate's global logger.
    pub fn init_global(&self) -> eyre::Result<()> {
        let max_level = self
            .sinks
            .iter()
            .map(|s| s.threshold())
            .min()
            .map_or(LevelFilter::Off, level_filter);

        log::set_boxed_logger(Box::new(GlobalLogger(self.clone())))
            .context("Failed registering global logger")?;
        log::set_max_level(max_level);

        Ok(())
    }
}

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

/// Restores the previous panic hook on drop.
pub struct FaultHookGuard {
    previous: Option<Arc<PanicHook>>,
}

impl FaultHookGuard {
    /// Leave the hook installed for the rest of the process.
    pub fn persist(mut self) {
        self.previous = None;
    }
}

impl Drop for FaultHookGuard {
    fn drop(&mut self) {
        // Swapping hooks while unwinding aborts the process.
        if std::thread::panicking() {
            return;
        }

        if let Some(previous) = self.previous.take() {
            let _ = panic::take_hook();
            panic::set_hook(Box::new(move |info| (**previous)(info)));
        }
    }
}

fn describe_panic(info: &PanicHookInfo<'_>) -> String {
    let payload = info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>");

    match info.location() {
        Some(location) => format!(
            "{} at {}:{}:{}",
            message,
            location.file(),
            location.line(),
            location.column()
        ),
        None => message.to_string(),
    }
}

fn level_filter(level: Level) -> LevelFilter {
    match level {
        Level::Silly => LevelFilter::Trace,
        Level::Debug => LevelFilter::Debug,
        Level::Verbose | Level::Http | Level::Info => LevelFilter::Info,
        Level::Warn => LevelFilter::Warn,
        Level::Error => LevelFilter::Error,
    }
}

struct GlobalLogger(LoggerHandle);

impl Log for GlobalLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.0.enabled(metadata.level().into())
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            self.0.dispatch(&LogRecord::new(
                record.level().into(),
                self.0.label.clone(),
                record.args().to_string(),
            ));
        }
    }

    fn flush(&self) {
        self.0.flush()
    }
}

pub fn initialize(config: LoggerConfig) -> eyre::Result<LoggerHandle> {
    Builder::new(config).build().map(LoggerHandle::new)
}

/// Flush and close every sink. Calls made afterwards through other clones are ignored.
pub fn shutdown(handle: LoggerHandle) {
    handle.close();
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        fs,
        path::{Path, PathBuf},
        sync::Mutex,
        thread,
    };

    use super::*;
    use crate::{config::FlushPolicy, Mode, SinkConfig};

    fn files_ending_with(dir: &Path, suffix: &str) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(suffix))
            .collect()
    }

    fn read_single(dir: &Path, suffix: &str) -> Vec<String> {
        let files = files_ending_with(dir, suffix);
        assert_eq!(files.len(), 1, "expected one {} file in {:?}", suffix, files);
        fs::read_to_string(&files[0])
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }
    }

    #[test]
    fn production_omits_the_console() {
        let dir = tempfile::tempdir().unwrap();

        let config = LoggerConfig::standard("app", dir.path(), Mode::Production);
        let handle = initialize(config).unwrap();
        assert_eq!(handle.sink_names(), vec!["error", "info", "silly"]);
        shutdown(handle);

        let config = LoggerConfig::standard("app", dir.path(), Mode::Development);
        let handle = initialize(config).unwrap();
        assert_eq!(handle.sink_names(), vec!["error", "info", "silly", "console"]);
        shutdown(handle);
    }

    #[test]
    fn fans_records_out_by_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let console = Captured::default();
        let config =
            LoggerConfig::standard("shop", dir.path(), Mode::Development).with_ansi(false);
        let handle = Builder::new(config)
            .with_console_writer(Box::new(console.clone()))
            .build()
            .map(LoggerHandle::new)
            .unwrap();

        handle.silly("cache warmed");
        handle.info("listening");
        handle.error("payment failed");
        shutdown(handle);

        let general: Vec<_> = files_ending_with(dir.path(), ".log")
            .into_iter()
            .filter(|p| {
                let name = p.file_name().unwrap().to_string_lossy().to_string();
                !name.contains(".silly.") && !name.contains(".exception.")
            })
            .collect();
        assert_eq!(general.len(), 1);
        let general = fs::read_to_string(&general[0]).unwrap();
        assert_eq!(general.lines().count(), 2);
        assert!(general.contains("[shop] info: listening"));
        assert!(general.contains("[shop] error: payment failed"));

        let silly = read_single(dir.path(), ".silly.log");
        assert_eq!(silly.len(), 3);

        let errors = read_single(&dir.path().join("error"), ".error.log");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].ends_with("[shop] error: payment failed"));

        let console = String::from_utf8(console.0.lock().unwrap().clone()).unwrap();
        assert_eq!(console.lines().count(), 2);
        assert!(console.contains("error: payment failed {\"label\":\"shop\""));
    }

    #[test]
    fn concurrent_writers_produce_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggerConfig::new("load", Mode::Production)
            .with_sink(SinkConfig::new("info", Level::Info, dir.path(), "%DATE%.log"));
        let handle = initialize(config).unwrap();

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let handle = handle.clone();
                thread::spawn(move || {
                    for line in 0..250 {
                        handle.info(format!("worker-{} line-{} {}", worker, line, "x".repeat(64)));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        shutdown(handle);

        let lines = read_single(dir.path(), ".log");
        assert_eq!(lines.len(), 8 * 250);

        let mut seen = HashSet::new();
        for line in &lines {
            let body = line.split("info: ").nth(1).unwrap();
            let mut parts = body.split(' ');
            let id = format!("{} {}", parts.next().unwrap(), parts.next().unwrap());
            assert_eq!(parts.next().unwrap(), "x".repeat(64));
            assert!(parts.next().is_none());
            assert!(seen.insert(id));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failing_sink_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken");
        fs::create_dir(&broken).unwrap();

        let today = Local::now().format("%Y-%m-%d").to_string();
        std::os::unix::fs::symlink("/dev/full", broken.join(format!("{}.log", today))).unwrap();

        let config = LoggerConfig::new("app", Mode::Production)
            .with_sink(
                SinkConfig::new("broken", Level::Info, &broken, "%DATE%.log")
                    .with_flush(FlushPolicy::Immediate),
            )
            .with_sink(
                SinkConfig::new("healthy", Level::Info, dir.path(), "%DATE%.log")
                    .with_flush(FlushPolicy::Immediate),
            );
        let handle = Builder::new(config)
            .with_error_writer(Box::new(BrokenPipe))
            .build()
            .map(LoggerHandle::new)
            .unwrap();

        handle.info("one");
        handle.warn("two");

        let reported = handle.errors().drain();
        assert!(reported.len() >= 2);
        assert!(reported
            .iter()
            .all(|e| matches!(e, LogError::SinkWrite { path, .. } if path.starts_with(&broken))));

        let healthy = read_single(dir.path(), ".log");
        assert_eq!(healthy.len(), 2);
        assert!(healthy[1].ends_with("warn: two"));
    }

    #[test]
    fn shutdown_flushes_and_stops_writes() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggerConfig::new("app", Mode::Production)
            .with_sink(SinkConfig::new("info", Level::Info, dir.path(), "%DATE%.log"));
        let handle = initialize(config).unwrap();
        let other = handle.clone();

        handle.info("before");
        shutdown(handle);
        other.info("after");

        let lines = read_single(dir.path(), ".log");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("info: before"));
        assert!(!other.enabled(Level::Error));
    }

    #[test]
    fn rejects_invalid_configuration() {
        let config = LoggerConfig::new("app", Mode::Production)
            .with_sink(SinkConfig::new("info", Level::Info, "/tmp", "app.log"));

        assert!(initialize(config).is_err());
    }

    #[test]
    fn fault_hook_leaves_one_error_record() {
        let dir = tempfile::tempdir().unwrap();
        let handle =
            initialize(LoggerConfig::standard("app", dir.path(), Mode::Production)).unwrap();

        let guard = handle.install_fault_hook();
        let result = panic::catch_unwind(|| {
            panic!("worker exploded");
        });
        drop(guard);
        assert!(result.is_err());

        let exceptions = read_single(dir.path(), ".exception.log");
        assert_eq!(exceptions.len(), 1);
        assert!(exceptions[0]
            .contains("[app] error: unhandled process fault: worker exploded at "));

        let errors = read_single(&dir.path().join("error"), ".error.log");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("worker exploded"));
    }

    #[test]
    fn bridges_the_log_crate() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggerConfig::new("bridge", Mode::Production).with_sink(
            SinkConfig::new("warn", Level::Warn, dir.path(), "%DATE%.log")
                .with_flush(FlushPolicy::Immediate),
        );
        let handle = initialize(config).unwrap();
        handle.init_global().unwrap();

        log::info!("ignored");
        log::warn!("cache at {}%", 93);

        let lines = read_single(dir.path(), ".log");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("[bridge] warn: cache at 93%"));
    }
}
