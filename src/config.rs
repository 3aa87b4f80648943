//! Engine configuration.

use std::path::PathBuf;

use log::warn;
use serde::Deserialize;

use crate::error::{DbError, Result};

/// What to do with a torn or corrupt write-ahead log at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalRecovery {
    /// Any corruption refuses the open.
    Absolute,
    /// Roll back to the last consistent point; newest writes may be lost.
    Point,
    /// Skip corrupted records. May leave gaps; unsafe for applications
    /// that assume write contiguity.
    #[serde(alias = "recover")]
    Skip,
    /// Ignore a corrupted tail record.
    Tolerate,
}

impl Default for WalRecovery {
    fn default() -> Self {
        WalRecovery::Absolute
    }
}

impl WalRecovery {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "absolute" | "" => Ok(WalRecovery::Absolute),
            "point" => Ok(WalRecovery::Point),
            "skip" | "recover" => Ok(WalRecovery::Skip),
            "tolerate" => Ok(WalRecovery::Tolerate),
            _ => Err(DbError::InvalidArgument(format!("unknown wal recovery mode '{}'", s))),
        }
    }

    pub(crate) fn to_library(self) -> rocksdb::DBRecoveryMode {
        use rocksdb::DBRecoveryMode;
        match self {
            WalRecovery::Absolute => DBRecoveryMode::AbsoluteConsistency,
            WalRecovery::Point => DBRecoveryMode::PointInTime,
            WalRecovery::Skip => DBRecoveryMode::SkipAnyCorruptedRecord,
            WalRecovery::Tolerate => DBRecoveryMode::TolerateCorruptedTailRecords,
        }
    }

    /// Log the choice; `skip` gets a loud warning because it can tear
    /// multi-write invariants apart silently.
    pub(crate) fn announce(self, name: &str) {
        if self == WalRecovery::Skip {
            warn!(
                "database '{}': wal recovery mode 'skip' drops corrupted journal \
                 records and may leave gaps in committed data",
                name
            );
        }
    }
}

/// Per-database options supplied at open.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbOpts {
    /// Base directory; databases live at `<base>/<name>/<checkpoint_id>`.
    pub base: PathBuf,
    pub wal_recovery: WalRecovery,
    /// Library-side background compaction/flush jobs.
    pub background_jobs: usize,
    /// Workers in the shared request pool.
    pub request_pool_workers: usize,
    /// Row cache capacity in bytes.
    pub row_cache_bytes: usize,
    /// Library rate limiter budget; zero leaves the limiter out.
    pub rate_bytes_per_sec: i64,
    /// Back pre-allocation windows with fallocate. Not every filesystem
    /// supports it together with direct I/O.
    pub use_fallocate: bool,
    /// Run a full checksum pass right after open.
    pub verify_on_open: bool,
    /// Debug-print journal records seen by the WAL filter at open.
    pub wal_debug: bool,
    /// Lock cache arena pages into memory when the rlimit allows it.
    pub mlock_cache: bool,
    /// Report background errors as handled instead of gating writes.
    pub suppress_background_errors: bool,
    /// Attach as a read-only secondary that can catch up with a live
    /// primary.
    pub secondary: bool,
}

impl Default for DbOpts {
    fn default() -> Self {
        DbOpts {
            base: PathBuf::from("."),
            wal_recovery: WalRecovery::default(),
            background_jobs: 4,
            request_pool_workers: 4,
            row_cache_bytes: 16 * 1024 * 1024,
            rate_bytes_per_sec: 0,
            use_fallocate: false,
            verify_on_open: false,
            wal_debug: false,
            mlock_cache: false,
            suppress_background_errors: false,
            secondary: false,
        }
    }
}

/// Tokens the wrapper itself recognises in the open-time options string.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpenTokens {
    pub read_only: bool,
    pub fsck: bool,
}

/// Parse a `key=value;` options string.
///
/// `read_only` and `fsck` belong to the wrapper and are consumed here;
/// anything else is refused since there is no library-side string parser
/// to hand the rest to.
pub fn parse_open_string(s: &str) -> Result<OpenTokens> {
    let mut tokens = OpenTokens::default();
    for item in s.split(';') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (key, value) = match item.find('=') {
            Some(pos) => (&item[..pos], &item[pos + 1..]),
            None => {
                return Err(DbError::InvalidArgument(format!("malformed option '{}'", item)))
            }
        };
        match key {
            "read_only" => tokens.read_only = value == "true",
            "fsck" => tokens.fsck = value == "true",
            _ => {
                return Err(DbError::InvalidArgument(format!("unknown open option '{}'", key)))
            }
        }
    }
    Ok(tokens)
}
