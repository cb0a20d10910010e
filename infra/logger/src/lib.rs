//! # Logger
//!
//! Installs the process-wide `tracing` subscriber for services embedding the annostore core.
//! Console output, a rolling file appender with non-blocking I/O, and JSON records are
//! configured through one typestate builder.
//!
//! * [`LoggerBuilder::store_level`] sets the level for the storage crates independently of the
//!   rest of the process, which keeps pool and cache diagnostics readable in a noisy host.
//! * [`LoggerBuilder::span_timing`] logs a line when each instrumented storage operation
//!   finishes, including its busy and idle time.
//! * Thread names are printed by default; sessions are bound to threads, so they are usually
//!   the quickest way to tell concurrent units of work apart.
//!
//! ## Example
//!
//! ```rust
//! # use annostore_logger::{Logger, LevelFilter};
//!
//! let _logger = Logger::builder()
//!     .name("annotation-server")
//!     .console(true)
//!     .level(LevelFilter::INFO)
//!     .store_level(LevelFilter::DEBUG)
//!     .init()
//!     .unwrap();
//! ```

mod error;

pub use crate::error::{LoggerError, LoggerErrorExt, LoggerResult};
pub use tracing::level_filters::LevelFilter;
pub use tracing_appender::rolling::Rotation;

use private::Sealed;
use std::fs;
use std::marker::PhantomData;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_MAX_FILES: usize = 10;
const LOG_FILE_SUFFIX: &str = "log";

/// Tracing targets emitted by the storage crates.
pub const STORE_TARGETS: &[&str] = &["annostore", "annostore_fs"];

#[derive(Debug)]
pub struct LoggerConfig {
    console: bool,
    path: Option<PathBuf>,
    level: LevelFilter,
    store_level: Option<LevelFilter>,
    rotation: Rotation,
    max_files: usize,
    json: bool,
    env_filter: Option<String>,
    thread_names: bool,
    span_timing: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            console: true,
            path: None,
            level: LevelFilter::INFO,
            store_level: None,
            rotation: Rotation::DAILY,
            max_files: DEFAULT_MAX_FILES,
            json: false,
            env_filter: None,
            thread_names: true,
            span_timing: false,
        }
    }
}

impl LoggerConfig {
    fn span_events(&self) -> FmtSpan {
        if self.span_timing { FmtSpan::CLOSE } else { FmtSpan::NONE }
    }
}

#[derive(Debug)]
pub struct NoName;
#[derive(Debug)]
pub struct WithName(String);
#[derive(Debug)]
pub struct NoFile;
#[derive(Debug)]
pub struct WithFile;

mod private {
    pub trait Sealed {}
}
impl Sealed for NoName {}
impl Sealed for WithName {}
impl Sealed for NoFile {}
impl Sealed for WithFile {}

/// A builder for configuring and initializing the global tracing subscriber.
#[derive(Debug)]
pub struct LoggerBuilder<N: Sealed = NoName, F: Sealed = NoFile> {
    config: LoggerConfig,
    name: N,
    file_state: PhantomData<F>,
}

impl<F: Sealed> LoggerBuilder<NoName, F> {
    /// Sets the name of the logger, also used as the log file prefix.
    pub fn name(self, name: impl Into<String>) -> LoggerBuilder<WithName, F> {
        LoggerBuilder { name: WithName(name.into()), config: self.config, file_state: PhantomData }
    }
}

impl LoggerBuilder<WithName, WithFile> {
    #[must_use = "The builder must be configured before it can be used to initialize the logger."]
    pub const fn max_files(mut self, max: usize) -> Self {
        self.config.max_files = max;
        self
    }

    #[must_use = "The builder must be configured before it can be used to initialize the logger."]
    pub const fn rotation(mut self, rotation: Rotation) -> Self {
        self.config.rotation = rotation;
        self
    }

    /// Writes file records as JSON lines. The console keeps the compact format.
    #[must_use = "The builder must be configured before it can be used to initialize the logger."]
    pub const fn json(mut self) -> Self {
        self.config.json = true;
        self
    }
}

impl<F: Sealed> LoggerBuilder<WithName, F> {
    /// Configures the minimum log level emitted by targets without a more specific directive.
    #[must_use = "The builder must be configured before it can be used to initialize the logger."]
    pub const fn level(mut self, level: LevelFilter) -> Self {
        self.config.level = level;
        self
    }

    /// Sets the level for every target in [`STORE_TARGETS`].
    ///
    /// Applied after `RUST_LOG` and [`LoggerBuilder::env_filter`], so it wins for those targets.
    #[must_use = "The builder must be configured before it can be used to initialize the logger."]
    pub const fn store_level(mut self, level: LevelFilter) -> Self {
        self.config.store_level = Some(level);
        self
    }

    /// Adds an explicit env filter (e.g., `annostore::pool=trace,hyper=info`).
    ///
    /// Replaces `RUST_LOG` when set. Invalid filters make [`LoggerBuilder::init`] fail.
    #[must_use = "The builder must be configured before it can be used to initialize the logger."]
    pub fn env_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.env_filter = Some(filter.into());
        self
    }

    #[must_use = "The builder must be configured before it can be used to initialize the logger."]
    pub const fn console(mut self, enabled: bool) -> Self {
        self.config.console = enabled;
        self
    }

    #[must_use = "The builder must be configured before it can be used to initialize the logger."]
    pub const fn thread_names(mut self, enabled: bool) -> Self {
        self.config.thread_names = enabled;
        self
    }

    /// Logs the close of every span, with its timings.
    #[must_use = "The builder must be configured before it can be used to initialize the logger."]
    pub const fn span_timing(mut self, enabled: bool) -> Self {
        self.config.span_timing = enabled;
        self
    }

    /// Sets the directory for rolling log files.
    pub fn path(self, path: impl Into<PathBuf>) -> LoggerBuilder<WithName, WithFile> {
        let mut config = self.config;
        config.path = Some(path.into());
        LoggerBuilder { config, name: self.name, file_state: PhantomData }
    }

    /// Consumes the builder and installs the global tracing subscriber.
    ///
    /// The returned [`Logger`] owns the worker guard of the file appender; keep it alive
    /// until shutdown or buffered records are lost.
    ///
    /// # Errors
    /// Returns [`LoggerError::Subscriber`] if a global subscriber has already been set.
    /// Returns [`LoggerError::InvalidConfiguration`] for invalid builder settings.
    pub fn init(self) -> LoggerResult<Logger> {
        validate_config(&self.config, &self.name.0)?;

        let env_filter = build_env_filter(&self.config)?;
        let mut layers = Vec::new();

        if self.config.console {
            layers.push(
                layer()
                    .compact()
                    .with_ansi(true)
                    .with_thread_names(self.config.thread_names)
                    .with_span_events(self.config.span_events())
                    .boxed(),
            );
        }

        let guard = if let Some(path) = &self.config.path {
            fs::create_dir_all(path)
                .context(format!("Failed to create log directory: {}", path.display()))?;

            let file_appender = RollingFileAppender::builder()
                .rotation(self.config.rotation.clone())
                .filename_prefix(&self.name.0)
                .filename_suffix(LOG_FILE_SUFFIX)
                .max_log_files(self.config.max_files)
                .build(path)?;

            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_names(self.config.thread_names)
                .with_span_events(self.config.span_events());

            let boxed =
                if self.config.json { file_layer.json().boxed() } else { file_layer.boxed() };
            layers.push(boxed);
            Some(guard)
        } else {
            None
        };

        if layers.is_empty() {
            return Err(LoggerError::invalid(
                "No logging layers enabled. Enable console or file output.",
            ));
        }

        tracing_subscriber::registry().with(env_filter).with(layers).try_init()?;

        Ok(Logger { guard })
    }
}

/// A handle to the initialized logging system.
///
/// Holds the background worker guard. Drop it only when the process is shutting down.
#[must_use = "Dropping this handle will stop background logging threads."]
#[derive(Debug)]
pub struct Logger {
    guard: Option<WorkerGuard>,
}

impl Logger {
    /// Returns a new [`LoggerBuilder`] to configure the global tracing subscriber.
    #[must_use = "The builder must be configured before it can be used to initialize the logger."]
    pub fn builder() -> LoggerBuilder {
        LoggerBuilder { config: LoggerConfig::default(), name: NoName, file_state: PhantomData }
    }

    /// Returns a reference to the underlying worker guard, if present.
    #[must_use]
    pub const fn guard(&self) -> Option<&WorkerGuard> {
        self.guard.as_ref()
    }

    /// Flushes pending file records and stops the background writer.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if self.guard.is_some() {
            tracing::info!("Logging system shutting down, flushing buffers...");
        }
    }
}

fn validate_config(config: &LoggerConfig, name: &str) -> LoggerResult<()> {
    if name.trim().is_empty() {
        return Err(LoggerError::invalid("Logger name cannot be empty"));
    }

    if config.max_files == 0 {
        return Err(LoggerError::invalid("max_files must be greater than zero"));
    }

    Ok(())
}

fn build_env_filter(config: &LoggerConfig) -> LoggerResult<EnvFilter> {
    let builder = EnvFilter::builder().with_default_directive(config.level.into());
    let mut filter = match &config.env_filter {
        Some(filter) => builder.parse(filter).map_err(|e| {
            LoggerError::invalid(format!("Invalid env filter '{filter}': {e}"))
        })?,
        None => builder.from_env_lossy(),
    };

    if let Some(level) = config.store_level {
        for target in STORE_TARGETS {
            let directive = format!("{target}={level}")
                .parse()
                .map_err(|e| LoggerError::invalid(format!("Invalid store directive: {e}")))?;
            filter = filter.add_directive(directive);
        }
    }

    Ok(filter)
}
