//! Logging infrastructure - structured tracing across the bridge
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable level and filter directives
//! - Compact, pretty or JSON output
//! - Optional daily rolling log file
//!
//! Events carry one of four targets: `library` (load, init, hooks),
//! `registry` (scripts, deferral, reload), `dispatch` (native calls) and
//! `binding` (binding slots).

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub use tracing::{debug, error, info, trace, warn, Level};

/// Global logging state; holds the file writer guard for the process lifetime
static LOGGER: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    pub format: LogFormat,
    /// Log file path; stderr when unset
    pub log_path: Option<String>,
    /// Show span events (new/close)
    pub show_spans: bool,
    /// Extra filter directives, e.g. "dispatch=trace"
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            log_path: None,
            show_spans: false,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // QNATIVE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level) = std::env::var("QNATIVE_LOG_LEVEL") {
            config.level = parse_level(&level).unwrap_or(Level::INFO);
        }

        if let Ok(path) = std::env::var("QNATIVE_LOG_FILE") {
            config.log_path = Some(path);
        }

        if std::env::var("QNATIVE_LOG_JSON").is_ok() {
            config.format = LogFormat::Json;
        }

        config.show_spans = std::env::var("QNATIVE_LOG_SPANS").is_ok();
        config
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.show_spans = enabled;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Parse a level name, case-insensitive
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration. Later calls are no-ops, and
/// an already installed global subscriber is left in place.
pub fn init_with_config(config: LogConfig) {
    LOGGER.get_or_init(|| install(&config));
}

pub fn is_initialized() -> bool {
    LOGGER.get().is_some()
}

fn install(config: &LogConfig) -> Option<WorkerGuard> {
    let span_events = if config.show_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let (writer, guard) = match &config.log_path {
        Some(path) => {
            let path = Path::new(path);
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let prefix = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "qnative.log".to_string());
            let appender = tracing_appender::rolling::daily(directory, prefix);
            let (w, g) = tracing_appender::non_blocking(appender);
            (w, Some(g))
        }
        None => {
            let (w, g) = tracing_appender::non_blocking(std::io::stderr());
            (w, Some(g))
        }
    };

    let filter = build_filter(config);
    let base = fmt::layer()
        .with_writer(writer)
        .with_span_events(span_events)
        .with_target(true)
        .with_thread_ids(cfg!(debug_assertions));

    let layer = match config.format {
        LogFormat::Compact => base.compact().with_filter(filter).boxed(),
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Json => base.json().with_filter(filter).boxed(),
    };

    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        return None;
    }
    guard
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let base = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_ascii_lowercase()));

    match &config.filter {
        Some(directives) => directives
            .split(',')
            .filter(|d| !d.trim().is_empty())
            .fold(base, |filter, directive| match directive.trim().parse() {
                Ok(d) => filter.add_directive(d),
                Err(_) => {
                    warn!("invalid filter directive: {}", directive);
                    filter
                }
            }),
        None => base,
    }
}

// ============================================================================
// Bridge-specific logging functions
// ============================================================================

pub fn log_library_loaded(path: &str) {
    info!(target: "library", event = "library_loaded", path, "library loaded");
}

pub fn log_library_init(path: &str, classes: usize) {
    info!(
        target: "library",
        event = "library_init",
        path,
        classes,
        "library initialized"
    );
}

pub fn log_library_init_failed(path: &str, reason: &str) {
    error!(
        target: "library",
        event = "library_init_failed",
        path,
        reason,
        "library failed to initialize"
    );
}

pub fn log_library_terminated(path: &str) {
    info!(target: "library", event = "library_terminated", path, "library terminated");
}

pub fn log_init_deferred(path: &str) {
    debug!(
        target: "registry",
        event = "init_deferred",
        path,
        "initialization queued for the main context"
    );
}

pub fn log_reload(path: &str, scripts: usize, instances: usize) {
    info!(
        target: "registry",
        event = "reload",
        path,
        scripts,
        instances,
        "library reloaded"
    );
}

#[inline]
pub fn log_native_call(class: &str, method: &str, argc: usize) {
    trace!(
        target: "dispatch",
        event = "native_call",
        class,
        method,
        argc,
        "native method called"
    );
}

pub fn log_registration_rejected(library: &str, reason: &str) {
    warn!(
        target: "registry",
        event = "registration_rejected",
        library,
        reason,
        "registration rejected"
    );
}

pub fn log_binding_slot(event: &'static str, slot: usize) {
    debug!(target: "binding", event, slot, "binding slot changed");
}
