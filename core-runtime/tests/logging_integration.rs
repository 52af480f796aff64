//! Integration tests for the logging system

use async_trait::async_trait;
use bridge_traits::error::Result as SinkResult;
use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};
use core_runtime::logging::{
    init_logging, redact_if_sensitive, strip_path, LogFormat, LoggingConfig,
};
use core_runtime::Error;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CollectingSink {
    entries: Mutex<Vec<LogEntry>>,
}

#[async_trait]
impl LoggerSink for CollectingSink {
    async fn log(&self, entry: LogEntry) -> SinkResult<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    fn min_level(&self) -> LogLevel {
        LogLevel::Info
    }
}

// Global subscriber can only be installed once per process, so the whole
// lifecycle lives in a single test.
#[test]
fn test_init_logging_forwards_to_sink_once() {
    let sink = Arc::new(CollectingSink::default());
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Debug)
        .with_filter("logging_integration=debug")
        .with_logger_sink(sink.clone());

    init_logging(config.clone()).expect("first init succeeds");

    tracing::debug!(item_id = "q-1", "below sink level");
    tracing::info!(
        local_path = "/home/sam/Music/track.flac",
        "download finished"
    );

    {
        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "download finished");
        assert_eq!(
            entries[0].fields.get("local_path").map(String::as_str),
            Some("track.flac")
        );
    }

    assert!(matches!(init_logging(config), Err(Error::Logging(_))));
}

#[test]
fn test_redaction_helpers() {
    assert_eq!(redact_if_sensitive("refresh_token", "value"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("api_key", "value"), "[REDACTED]");

    let redacted = redact_if_sensitive("owner", "user@example.com");
    assert!(redacted.starts_with('u'));
    assert!(!redacted.contains("example.com"));

    assert_eq!(redact_if_sensitive("folder_id", "fold-9"), "fold-9");
}

#[test]
fn test_path_stripping() {
    assert_eq!(strip_path("/var/lib/tracksync/cache.db"), "cache.db");
    assert_eq!(strip_path("D:\\Music\\Album\\01.flac"), "01.flac");
    assert_eq!(strip_path("01.flac"), "01.flac");
    assert_eq!(strip_path(""), "");
}

#[test]
fn test_config_chaining() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Json)
        .with_level(LogLevel::Warn)
        .with_pii_redaction(false)
        .with_spans(false)
        .with_target(false)
        .with_thread_info(true);

    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, LogLevel::Warn);
    assert!(!config.redact_pii);
    assert!(!config.enable_spans);
    assert!(!config.display_target);
    assert!(config.display_thread_info);
}
