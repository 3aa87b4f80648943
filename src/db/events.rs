//! Event listening and background error policy.
//!
//! The engine dispatches events around its own flush/compaction/ingest
//! operations and tracks write stalls from library properties. Background
//! errors are recorded on the database, gate further writes, and stay
//! visible until an explicit resume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};

use super::column::Stall;

/// Where a background error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Flush,
    Compaction,
    Write,
    Ingest,
    Manifest,
    Unknown,
}

/// Library error severities, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Soft,
    Hard,
    Fatal,
    Unrecoverable,
}

#[derive(Debug, Clone)]
pub struct BackgroundError {
    pub source: ErrorSource,
    pub severity: ErrorSeverity,
    pub message: String,
}

/// Receiver for engine events. Every hook has a logging default.
pub trait EventListener: Send + Sync {
    fn on_flush_begin(&self, column: &str) {
        debug!("flush begin: '{}'", column);
    }

    fn on_flush_complete(&self, column: &str) {
        debug!("flush complete: '{}'", column);
    }

    fn on_compaction_complete(&self, column: &str) {
        debug!("compaction complete: '{}'", column);
    }

    fn on_table_file_created(&self, path: &str) {
        debug!("table file created: {}", path);
    }

    fn on_table_file_deleted(&self, path: &str) {
        debug!("table file deleted: {}", path);
    }

    fn on_memtable_sealed(&self, column: &str) {
        debug!("memtable sealed: '{}'", column);
    }

    fn on_column_dropped(&self, column: &str) {
        debug!("column dropped: '{}'", column);
    }

    fn on_ingest(&self, column: &str) {
        debug!("external file ingested: '{}'", column);
    }

    fn on_background_error(&self, err: &BackgroundError) {
        error!("background error from {:?} ({:?}): {}", err.source, err.severity, err.message);
    }

    fn on_stall(&self, column: &str, stall: Stall) {
        warn!("write stall on '{}': {:?}", column, stall);
    }
}

/// The default listener: log and nothing else.
pub struct LogListener;

impl EventListener for LogListener {}

/// Per-database event fan-out plus the background error vector.
pub struct EventSink {
    listener: Arc<dyn EventListener>,
    errors: Mutex<Vec<BackgroundError>>,
    gated: AtomicBool,
    suppress: bool,
}

impl EventSink {
    pub fn new(listener: Arc<dyn EventListener>, suppress: bool) -> Self {
        EventSink {
            listener,
            errors: Mutex::new(Vec::new()),
            gated: AtomicBool::new(false),
            suppress,
        }
    }

    pub fn listener(&self) -> &Arc<dyn EventListener> {
        &self.listener
    }

    /// Record a background error.
    ///
    /// A compaction-sourced Fatal is downgraded to Hard so a later
    /// resume can clear it; Unrecoverable stays as-is. Unless error
    /// suppression was configured, the database refuses writes from here
    /// until `resume`.
    pub fn background_error(
        &self,
        source: ErrorSource,
        severity: ErrorSeverity,
        message: String,
    ) {
        let severity = match (source, severity) {
            (ErrorSource::Compaction, ErrorSeverity::Fatal) => ErrorSeverity::Hard,
            (_, severity) => severity,
        };

        let err = BackgroundError { source, severity, message };
        self.listener.on_background_error(&err);
        self.errors.lock().unwrap().push(err);

        if !self.suppress {
            self.gated.store(true, Ordering::Release);
        }
    }

    /// Whether writes are currently refused.
    pub fn refusing_writes(&self) -> bool {
        self.gated.load(Ordering::Acquire)
    }

    /// Clear recoverable errors and lift the write gate when nothing
    /// unrecoverable remains.
    pub fn resume(&self) -> bool {
        let mut errors = self.errors.lock().unwrap();
        errors.retain(|err| err.severity == ErrorSeverity::Unrecoverable);
        let clean = errors.is_empty();
        if clean {
            self.gated.store(false, Ordering::Release);
        }
        clean
    }

    pub fn errors(&self) -> Vec<BackgroundError> {
        self.errors.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> EventSink {
        EventSink::new(Arc::new(LogListener), false)
    }

    #[test]
    fn errors_gate_until_resume() {
        let sink = sink();
        assert!(!sink.refusing_writes());

        sink.background_error(ErrorSource::Flush, ErrorSeverity::Hard, "enospc".into());
        assert!(sink.refusing_writes());
        assert_eq!(sink.errors().len(), 1);

        assert!(sink.resume());
        assert!(!sink.refusing_writes());
        assert!(sink.errors().is_empty());
    }

    #[test]
    fn compaction_fatal_downgrades_to_hard() {
        let sink = sink();
        sink.background_error(ErrorSource::Compaction, ErrorSeverity::Fatal, "bad block".into());
        assert_eq!(sink.errors()[0].severity, ErrorSeverity::Hard);
        // and is therefore clearable
        assert!(sink.resume());
    }

    #[test]
    fn unrecoverable_survives_resume() {
        let sink = sink();
        sink.background_error(
            ErrorSource::Manifest,
            ErrorSeverity::Unrecoverable,
            "torn manifest".into(),
        );
        assert!(!sink.resume());
        assert!(sink.refusing_writes());
        assert_eq!(sink.errors().len(), 1);
    }

    #[test]
    fn suppression_keeps_writes_open() {
        let sink = EventSink::new(Arc::new(LogListener), true);
        sink.background_error(ErrorSource::Write, ErrorSeverity::Fatal, "io".into());
        assert!(!sink.refusing_writes());
        assert_eq!(sink.errors().len(), 1);
    }
}
