//! loam - embedded multi-column LSM database engine for cooperative
//! async runtimes.
//!
//! The engine wraps the LSM library with a typed front-end (databases,
//! columns, batches, cells, rows, iterators, snapshots, checkpoints) and
//! an environment layer that adapts file I/O, background scheduling,
//! logging and the ancillary services to the host runtime instead of raw
//! OS primitives.

pub mod cache;
pub mod config;
pub mod db;
pub mod env;
pub mod error;
pub mod pool;
pub mod stats;
pub mod tools;

pub use config::{DbOpts, WalRecovery};
pub use db::{
    Batch, Cell, Column, ColumnDescriptor, ColumnIterator, ColumnRef, Database, IndexRef,
    KeyType, Op, Row, Snapshot, Validity, WriteFlags,
};
pub use error::{DbError, Result, Status};
