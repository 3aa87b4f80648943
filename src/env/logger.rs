//! Sink for the library's log callbacks.

use log::{debug, error, info, warn};

/// Library log severities, in the library's own order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Header,
}

/// Forward one library log line into the engine's log facility.
///
/// The library indents continuation lines for alignment and dumps its full
/// option set at every open; both are noise here, so leading whitespace is
/// stripped and the option dump is dropped.
pub fn emit(severity: Severity, line: &str) {
    let line = line.trim_start();
    if line.is_empty() || line.starts_with("Options") {
        return;
    }

    match severity {
        Severity::Debug | Severity::Info => debug!(target: "loam::db", "{}", line),
        Severity::Warn => warn!(target: "loam::db", "{}", line),
        Severity::Error | Severity::Fatal => error!(target: "loam::db", "{}", line),
        Severity::Header => info!(target: "loam::db", "{}", line),
    }
}
