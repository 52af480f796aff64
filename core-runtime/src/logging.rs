//! # Logging
//!
//! Structured logging for the sync crates, built on `tracing` and
//! `tracing-subscriber`:
//! - Pretty, JSON or compact output on stdout
//! - Per-crate filtering with dependencies (sqlx) held at `warn`
//! - Optional mirroring of every event into a host [`LoggerSink`]
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//! use bridge_traits::time::{ConsoleLogger, LogLevel};
//! use std::sync::Arc;
//!
//! init_logging(
//!     LoggingConfig::default()
//!         .with_format(LogFormat::Compact)
//!         .with_level(LogLevel::Debug)
//!         .with_logger_sink(Arc::new(ConsoleLogger::default())),
//! )?;
//! tracing::info!(folder_id = "f1", "Sync worker starting");
//! ```
//!
//! ## Sink forwarding
//!
//! Events that pass the filter and the sink's own `min_level` become
//! [`LogEntry`] values. With redaction on (the default), any field whose name
//! mentions `path` is cut down to its file name and secret-looking fields are
//! masked, since local library paths routinely contain the user's name.

use crate::error::{Error, Result};

use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::format::FmtSpan,
    layer::{Context, Layered, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer, Registry,
};

/// Crates whose events are governed by [`LoggingConfig::level`]
const WORKSPACE_TARGETS: &[&str] = &[
    "bridge_desktop",
    "core_runtime",
    "core_library",
    "core_sync",
    "core_service",
];

/// Field names whose values never leave the process unmasked
const SECRET_FIELD_MARKERS: &[&str] = &[
    "token",
    "password",
    "secret",
    "api_key",
    "authorization",
    "bearer",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, colored output for local development
    Pretty,
    /// One JSON object per event
    Json,
    /// Single-line text
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

/// How [`init_logging`] builds the global subscriber
#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Full `EnvFilter` directive string; replaces the per-crate default
    pub filter: Option<String>,
    pub logger_sink: Option<Arc<dyn LoggerSink>>,
    /// Strip paths and mask secrets in fields sent to `logger_sink`
    pub redact_pii: bool,
    pub enable_spans: bool,
    pub display_target: bool,
    pub display_thread_info: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            filter: None,
            logger_sink: None,
            redact_pii: true,
            enable_spans: true,
            display_target: true,
            display_thread_info: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_format(self, format: LogFormat) -> Self {
        Self { format, ..self }
    }

    pub fn with_level(self, level: LogLevel) -> Self {
        Self { level, ..self }
    }

    pub fn with_filter(self, filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
            ..self
        }
    }

    pub fn with_logger_sink(self, sink: Arc<dyn LoggerSink>) -> Self {
        Self {
            logger_sink: Some(sink),
            ..self
        }
    }

    pub fn with_pii_redaction(self, redact_pii: bool) -> Self {
        Self { redact_pii, ..self }
    }

    pub fn with_spans(self, enable_spans: bool) -> Self {
        Self {
            enable_spans,
            ..self
        }
    }

    pub fn with_target(self, display_target: bool) -> Self {
        Self {
            display_target,
            ..self
        }
    }

    pub fn with_thread_info(self, display_thread_info: bool) -> Self {
        Self {
            display_thread_info,
            ..self
        }
    }
}

/// Install the global subscriber.
///
/// Only the first call in a process succeeds; later calls return
/// [`Error::Logging`].
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = build_filter(&config)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(format_layer(&config))
        .with(LoggerSinkLayer::from_config(&config))
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = match &config.filter {
        Some(custom) => custom.clone(),
        None => WORKSPACE_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, config.level.as_str()))
            .chain(std::iter::once("sqlx=warn".to_string()))
            .collect::<Vec<_>>()
            .join(","),
    };

    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Config(format!("Invalid log filter {:?}: {}", directives, e)))
}

type FilteredRegistry = Layered<EnvFilter, Registry>;

/// Stdout layer for the configured [`LogFormat`]
fn format_layer(config: &LoggingConfig) -> Box<dyn Layer<FilteredRegistry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer()
        .with_target(config.display_target)
        .with_thread_ids(config.display_thread_info)
        .with_thread_names(config.display_thread_info)
        .with_writer(io::stdout);

    match config.format {
        LogFormat::Pretty => {
            let spans = if config.enable_spans {
                FmtSpan::ACTIVE
            } else {
                FmtSpan::NONE
            };
            layer.pretty().with_span_events(spans).boxed()
        }
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(config.enable_spans)
            .with_span_list(config.enable_spans)
            .boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

// ============================================================================
// Host sink forwarding
// ============================================================================

/// Mirrors events into the host's [`LoggerSink`]
struct LoggerSinkLayer {
    sink: Option<Arc<dyn LoggerSink>>,
    redact: bool,
}

impl LoggerSinkLayer {
    fn new(sink: Option<Arc<dyn LoggerSink>>, redact: bool) -> Self {
        Self { sink, redact }
    }

    fn from_config(config: &LoggingConfig) -> Self {
        Self::new(config.logger_sink.clone(), config.redact_pii)
    }
}

impl<S> Layer<S> for LoggerSinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(sink) = &self.sink else {
            return;
        };

        let meta = event.metadata();
        let level = sink_level(meta.level());
        if level < sink.min_level() {
            return;
        }

        let mut fields = FieldCollector::new(self.redact);
        event.record(&mut fields);

        let message = fields.message.take().unwrap_or_else(|| meta.name().to_string());
        let mut entry = LogEntry::new(level, meta.target(), message);
        entry.fields = fields.fields;
        entry.span_id = ctx.lookup_current().map(|span| span.name().to_string());

        forward(Arc::clone(sink), entry);
    }
}

/// Hand an entry to the sink without blocking a runtime worker
fn forward(sink: Arc<dyn LoggerSink>, entry: LogEntry) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = sink.log(entry).await {
                    eprintln!("LoggerSink error: {}", e);
                }
            });
        }
        Err(_) => {
            if let Err(e) = futures::executor::block_on(sink.log(entry)) {
                eprintln!("LoggerSink error: {}", e);
            }
        }
    }
}

fn sink_level(level: &Level) -> LogLevel {
    match *level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warn,
        Level::INFO => LogLevel::Info,
        Level::DEBUG => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

struct FieldCollector {
    redact: bool,
    message: Option<String>,
    fields: HashMap<String, String>,
}

impl FieldCollector {
    fn new(redact: bool) -> Self {
        Self {
            redact,
            message: None,
            fields: HashMap::new(),
        }
    }

    fn insert(&mut self, field: &Field, value: String) {
        let name = field.name();
        if name == "message" {
            self.message = Some(value);
            return;
        }

        let value = match (self.redact, name.contains("path")) {
            (false, _) => value,
            (true, true) => strip_path(&value).to_string(),
            (true, false) => redact_if_sensitive(name, &value),
        };
        self.fields.insert(name.to_string(), value);
    }
}

// Numeric and bool fields fall through to `record_debug`, whose output
// matches their `Display` form.
impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{:?}", value));
    }
}

/// Mask `value` when `field_name` marks a secret; shorten e-mail addresses.
///
/// ```ignore
/// use core_runtime::logging::redact_if_sensitive;
///
/// tracing::debug!(
///     token = %redact_if_sensitive("token", &token),
///     "Provider session refreshed"
/// );
/// ```
pub fn redact_if_sensitive(field_name: &str, value: &str) -> String {
    let name = field_name.to_lowercase();
    if SECRET_FIELD_MARKERS.iter().any(|marker| name.contains(marker)) {
        return "[REDACTED]".to_string();
    }

    match value.split_once('@') {
        Some((user, domain)) if domain.contains('.') => {
            let first: String = user.chars().take(1).collect();
            format!("{}***@[REDACTED]", first)
        }
        _ => value.to_string(),
    }
}

/// File name of a local path, or the input when it has no separator.
///
/// ```ignore
/// use core_runtime::logging::strip_path;
///
/// tracing::debug!(file = %strip_path("/Users/sam/Music/track.flac"), "Probing file");
/// // file="track.flac"
/// ```
pub fn strip_path(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as SinkResult;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        entries: Mutex<Vec<LogEntry>>,
    }

    #[async_trait]
    impl LoggerSink for RecordingSink {
        async fn log(&self, entry: LogEntry) -> SinkResult<()> {
            self.entries.lock().unwrap().push(entry);
            Ok(())
        }

        fn min_level(&self) -> LogLevel {
            LogLevel::Trace
        }
    }

    /// Run `emit` under a subscriber holding only the sink layer
    fn capture(redact: bool, emit: impl FnOnce()) -> Vec<LogEntry> {
        let sink = Arc::new(RecordingSink::default());
        let layer = LoggerSinkLayer::new(Some(sink.clone() as Arc<dyn LoggerSink>), redact);
        tracing::subscriber::with_default(tracing_subscriber::registry().with(layer), emit);
        let entries = sink.entries.lock().unwrap();
        entries.clone()
    }

    #[test]
    fn test_default_filter_lists_workspace_crates() {
        let filter = build_filter(&LoggingConfig::default().with_level(LogLevel::Debug))
            .unwrap()
            .to_string();
        for target in WORKSPACE_TARGETS {
            assert!(filter.contains(&format!("{}=debug", target)), "{}", filter);
        }
        assert!(filter.contains("sqlx=warn"));
    }

    #[test]
    fn test_custom_filter_replaces_default() {
        let config = LoggingConfig::default().with_filter("core_sync::worker=trace");
        let filter = build_filter(&config).unwrap().to_string();
        assert!(filter.contains("core_sync::worker=trace"));
        assert!(!filter.contains("sqlx"));
    }

    #[test]
    fn test_malformed_filter_is_a_config_error() {
        let config = LoggingConfig::default().with_filter("core_sync=[");
        assert!(matches!(build_filter(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_builder_keeps_other_fields() {
        let config = LoggingConfig::default()
            .with_level(LogLevel::Warn)
            .with_pii_redaction(false);

        assert_eq!(config.level, LogLevel::Warn);
        assert!(!config.redact_pii);
        assert!(config.enable_spans);
        assert!(config.filter.is_none());
    }

    #[test]
    fn test_sink_receives_message_and_fields() {
        let entries = capture(false, || {
            tracing::info!(target: "core_sync::worker", item_id = "q-1", attempts = 2u32, "transfer started");
        });

        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.target, "core_sync::worker");
        assert_eq!(entry.message, "transfer started");
        assert_eq!(entry.fields["item_id"], "q-1");
        assert_eq!(entry.fields["attempts"], "2");
    }

    #[test]
    fn test_sink_fields_are_redacted() {
        let entries = capture(true, || {
            tracing::warn!(
                local_path = "/home/sam/Music/track.flac",
                refresh_token = "abc",
                folder_id = "f1",
                "download landed"
            );
        });

        let fields = &entries[0].fields;
        assert_eq!(fields["local_path"], "track.flac");
        assert_eq!(fields["refresh_token"], "[REDACTED]");
        assert_eq!(fields["folder_id"], "f1");
    }

    #[test]
    fn test_email_values_are_shortened() {
        assert_eq!(
            redact_if_sensitive("owner", "sam@example.com"),
            "s***@[REDACTED]"
        );
        assert_eq!(redact_if_sensitive("title", "Blue in Green"), "Blue in Green");
        assert_eq!(redact_if_sensitive("Authorization", "Bearer x"), "[REDACTED]");
    }

    #[test]
    fn test_strip_path_handles_both_separators() {
        assert_eq!(strip_path("/home/sam/music/track.flac"), "track.flac");
        assert_eq!(strip_path("C:\\Users\\Sam\\Music\\track.flac"), "track.flac");
        assert_eq!(strip_path("/var/log/"), "");
    }
}
