//! Write-ahead-log replay observation.
//!
//! After open, the engine walks the live journal and shows every record to
//! the configured filter. The walk is observational: verdicts control the
//! walk itself, they do not rewrite the journal. `Replace` is accepted for
//! interface compatibility and treated as `Keep`.

use log::debug;
use rocksdb::WriteBatchIterator;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Set,
    Delete,
}

/// One journal record as seen during replay.
#[derive(Debug)]
pub struct WalRecord<'a> {
    /// Sequence number of the batch this record belongs to.
    pub sequence: u64,
    /// Originating column id, when the journal carries one.
    pub column: Option<u32>,
    pub op: WalOp,
    pub key: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalVerdict {
    Keep,
    Replace,
    Skip,
    Stop,
}

pub trait WalFilter: Send + Sync {
    fn filter(&self, record: &WalRecord) -> WalVerdict {
        let _ = record;
        WalVerdict::Keep
    }
}

/// The default filter: keep everything.
pub struct KeepAll;

impl WalFilter for KeepAll {}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub kept: u64,
    pub skipped: u64,
    pub stopped: bool,
}

struct BatchCollector {
    ops: Vec<(WalOp, Box<[u8]>)>,
}

impl WriteBatchIterator for BatchCollector {
    fn put(&mut self, key: Box<[u8]>, _value: Box<[u8]>) {
        self.ops.push((WalOp::Set, key));
    }

    fn delete(&mut self, key: Box<[u8]>) {
        self.ops.push((WalOp::Delete, key));
    }
}

/// Walk the live journal from `since` onward through `filter`.
pub fn replay<D>(db: &rocksdb::DBWithThreadMode<D>, since: u64, filter: &dyn WalFilter, dump: bool) -> Result<ReplaySummary>
where
    D: rocksdb::ThreadMode,
{
    let mut summary = ReplaySummary::default();

    let iter = match db.get_updates_since(since) {
        Ok(iter) => iter,
        // An empty or fully flushed journal has nothing to show.
        Err(_) => return Ok(summary),
    };

    'outer: for update in iter {
        let (sequence, batch) = update?;
        let mut collector = BatchCollector { ops: Vec::new() };
        batch.iterate(&mut collector);

        for (op, key) in collector.ops {
            let record = WalRecord { sequence, column: None, op, key: &key };
            if dump {
                debug!(
                    "wal replay: seq {} {:?} key {} bytes",
                    record.sequence,
                    record.op,
                    record.key.len()
                );
            }
            match filter.filter(&record) {
                WalVerdict::Keep | WalVerdict::Replace => summary.kept += 1,
                WalVerdict::Skip => summary.skipped += 1,
                WalVerdict::Stop => {
                    summary.stopped = true;
                    break 'outer;
                }
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_keeps() {
        let record = WalRecord { sequence: 1, column: None, op: WalOp::Set, key: b"k" };
        assert_eq!(KeepAll.filter(&record), WalVerdict::Keep);
    }
}
