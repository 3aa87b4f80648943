//! The multi-column database front-end.

pub mod access;
pub mod batch;
pub mod cell;
pub mod column;
pub mod database;
pub mod events;
pub mod index;
pub mod iter;
pub mod merge;
pub mod row;
pub mod snapshot;

pub use access::ColumnRef;
pub use batch::{Batch, BatchCheckpoint, Delta, Op, WriteFlags};
pub use cell::{Cell, Validity};
pub use column::{
    decode_i64, decode_u64, encode_i64, encode_u64, key_cmp, Column, ColumnDescriptor,
    CompactionFilterFn, CompactionPriority, CompactionStyle, Compression, EntryType,
    FilterVerdict, KeyType, PrefixSpec, Stall, ValueType,
};
pub use database::{Database, OpenHooks, OpenMode};
pub use events::{
    BackgroundError, ErrorSeverity, ErrorSource, EventListener, LogListener,
};
pub use index::IndexRef;
pub use iter::ColumnIterator;
pub use merge::{take_update, MergeFn};
pub use row::Row;
pub use snapshot::Snapshot;
