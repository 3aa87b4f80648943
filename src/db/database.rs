//! The database handle: lifecycle, write path, maintenance operations.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{ColumnFamilyDescriptor, FlushOptions, Options, ReadOptions};

use crate::cache::{CacheAllocator, CacheHandle};
use crate::config::{parse_open_string, DbOpts};
use crate::env::wal_filter::{self, WalFilter};
use crate::env::Env;
use crate::error::{corruption_open_hint, DbError, Result};
use crate::pool;
use crate::stats::DbStats;
use crate::tools::block_in_place;

use super::batch::{make_opts, Batch, Op, WriteFlags};
use super::column::{cf_options, Column, ColumnDescriptor, CompactionFilterFn, Stall};
use super::events::{ErrorSeverity, ErrorSource, EventListener, EventSink, LogListener};

pub(crate) type Db = rocksdb::DBWithThreadMode<rocksdb::MultiThreaded>;

/// How the directory was attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Primary,
    ReadOnly,
    /// Read-only attach that can catch up with a live primary.
    Secondary,
}

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// An open database: one directory, one library instance, a set of
/// columns.
pub struct Database {
    name: String,
    checkpoint_id: u64,
    dir: PathBuf,
    mode: OpenMode,
    opts: DbOpts,
    env: Env,
    stats: Arc<DbStats>,
    sink: EventSink,
    allocator: Arc<CacheAllocator>,
    row_cache: CacheHandle,
    columns: Vec<Arc<Column>>,
    library_opts: Options,
    uuid: String,
    /// Request-pool tag for work owned by this instance.
    tag: u64,
    write_mutex: tokio::sync::Mutex<()>,
    db: Option<Db>,
}

/// Extra collaborators a caller can hand to open.
pub struct OpenHooks {
    pub listener: Arc<dyn EventListener>,
    pub wal_filter: Arc<dyn WalFilter>,
}

impl Default for OpenHooks {
    fn default() -> Self {
        OpenHooks {
            listener: Arc::new(LogListener),
            wal_filter: Arc::new(wal_filter::KeepAll),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("checkpoint_id", &self.checkpoint_id)
            .field("dir", &self.dir)
            .field("mode", &self.mode)
            .field("uuid", &self.uuid)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open the live database `<base>/<name>/0`.
    pub fn open(
        name: &str,
        opts: DbOpts,
        descriptors: Vec<ColumnDescriptor>,
        open_string: &str,
    ) -> Result<Database> {
        Self::open_at(name, 0, opts, descriptors, open_string, OpenHooks::default())
    }

    /// Open a specific checkpoint of the database.
    pub fn open_at(
        name: &str,
        checkpoint_id: u64,
        opts: DbOpts,
        descriptors: Vec<ColumnDescriptor>,
        open_string: &str,
        hooks: OpenHooks,
    ) -> Result<Database> {
        let tokens = parse_open_string(open_string)?;
        let dir = opts.base.join(name).join(checkpoint_id.to_string());

        let env = Env::new(&opts.base, &opts)?;
        let stats = Arc::new(DbStats::new());
        let sink = EventSink::new(hooks.listener, opts.suppress_background_errors);
        let allocator = CacheAllocator::new(opts.mlock_cache);
        let row_cache = CacheHandle::new("row", opts.row_cache_bytes, stats.clone());

        opts.wal_recovery.announce(name);

        let mode = if opts.secondary {
            OpenMode::Secondary
        } else if tokens.read_only {
            OpenMode::ReadOnly
        } else {
            OpenMode::Primary
        };

        let library_opts = Self::library_options(&opts, &env, &row_cache, mode)?;

        // Cross-reference the descriptor set with what is on disk.
        let on_disk = Self::list_columns(&dir);
        for disk_name in &on_disk {
            if disk_name == "default" {
                continue;
            }
            if !descriptors.iter().any(|d| &d.name == disk_name) {
                return Err(DbError::Schema(format!(
                    "column '{}' exists on disk but has no descriptor",
                    disk_name
                )));
            }
        }

        // Descriptors to open: everything on disk, plus creations; a drop
        // descriptor for a column that never materialised is skipped.
        let mut to_open: Vec<&ColumnDescriptor> = Vec::new();
        let mut to_drop: Vec<String> = Vec::new();
        for descriptor in &descriptors {
            let exists = on_disk.iter().any(|n| n == &descriptor.name);
            if descriptor.drop {
                if exists {
                    to_open.push(descriptor);
                    to_drop.push(descriptor.name.clone());
                }
                continue;
            }
            to_open.push(descriptor);
        }

        if !dir.exists() {
            if tokens.read_only {
                return Err(DbError::NotFound);
            }
            std::fs::create_dir_all(&dir)?;
        }

        if tokens.fsck {
            info!("database '{}': running repair before open", name);
            block_in_place(|| Db::repair(&library_opts, &dir))
                .map_err(DbError::from)
                .map_err(corruption_open_hint)?;
        }

        // Build engine-side columns; ids are ordinals over the open set.
        let mut columns: Vec<Arc<Column>> = Vec::new();
        let mut cfds: Vec<ColumnFamilyDescriptor> = Vec::new();
        for (id, descriptor) in to_open.iter().enumerate() {
            let cache = if descriptor.cache_size > 0 {
                Some(Arc::new(CacheHandle::new(
                    &descriptor.name,
                    descriptor.cache_size,
                    stats.clone(),
                )))
            } else {
                None
            };
            let column = Arc::new(Column::new(id as u32, (*descriptor).clone(), cache));
            cfds.push(ColumnFamilyDescriptor::new(
                &descriptor.name,
                cf_options(&column.descriptor, &column.filter_slot, column.cache.as_ref()),
            ));
            columns.push(column);
        }

        let names: Vec<String> = columns.iter().map(|c| c.name().to_owned()).collect();
        let db = block_in_place(|| Self::open_library(&library_opts, &dir, cfds, names, mode))
            .map_err(corruption_open_hint)?;

        // Post-open drops.
        for drop_name in &to_drop {
            block_in_place(|| db.drop_cf(drop_name))?;
            sink.listener().on_column_dropped(drop_name);
            columns.retain(|column| column.name() != drop_name.as_str());
        }

        let uuid = std::fs::read_to_string(dir.join("IDENTITY"))
            .map(|s| s.trim().to_owned())
            .unwrap_or_default();

        env.start();
        pool::ensure_workers(opts.request_pool_workers);

        let database = Database {
            name: name.to_owned(),
            checkpoint_id,
            dir,
            mode,
            opts,
            env,
            stats,
            sink,
            allocator,
            row_cache,
            columns,
            library_opts,
            uuid,
            tag: NEXT_TAG.fetch_add(1, Ordering::Relaxed),
            write_mutex: tokio::sync::Mutex::new(()),
            db: Some(db),
        };

        // Show the live journal tail to the filter; the primary's tail is
        // whatever recovery just replayed.
        if database.mode == OpenMode::Primary {
            let summary = wal_filter::replay(
                database.db(),
                0,
                hooks.wal_filter.as_ref(),
                database.opts.wal_debug,
            )?;
            debug!(
                "database '{}': wal replay kept {} skipped {}",
                name, summary.kept, summary.skipped
            );
        }

        if database.opts.verify_on_open {
            database.check()?;
        }

        info!(
            "database '{}' open at {:?} ({} columns, uuid {})",
            name,
            database.dir,
            database.columns.len(),
            database.uuid
        );
        Ok(database)
    }

    fn library_options(
        opts: &DbOpts,
        env: &Env,
        row_cache: &CacheHandle,
        mode: OpenMode,
    ) -> Result<Options> {
        let mut lib = Options::default();
        lib.create_if_missing(mode == OpenMode::Primary);
        lib.create_missing_column_families(mode == OpenMode::Primary);
        lib.set_max_open_files(if mode == OpenMode::Secondary {
            -1
        } else {
            rlimit_nofile()
        });
        // Zero keeps the library from spawning an opener thread herd; it
        // clamps to a single thread internally.
        lib.set_max_file_opening_threads(0);
        lib.set_max_background_jobs(opts.background_jobs as i32);
        lib.set_wal_recovery_mode(opts.wal_recovery.to_library());
        lib.set_use_fsync(false);
        lib.set_keep_log_file_num(16);
        lib.set_log_level(rocksdb::LogLevel::Warn);
        lib.set_env(env.rocks());
        lib.enable_statistics();
        lib.set_stats_dump_period_sec(600);
        lib.set_row_cache(row_cache.inner());
        if opts.rate_bytes_per_sec > 0 {
            lib.set_ratelimiter(opts.rate_bytes_per_sec, 100_000, 10);
        }
        let file_opts = env.file_opts();
        if file_opts.direct {
            lib.set_use_direct_reads(true);
            lib.set_use_direct_io_for_flush_and_compaction(true);
        }
        Ok(lib)
    }

    fn list_columns(dir: &Path) -> Vec<String> {
        if !dir.join("CURRENT").exists() {
            return Vec::new();
        }
        block_in_place(|| Db::list_cf(&Options::default(), dir)).unwrap_or_default()
    }

    fn open_library(
        lib: &Options,
        dir: &Path,
        cfds: Vec<ColumnFamilyDescriptor>,
        names: Vec<String>,
        mode: OpenMode,
    ) -> Result<Db> {
        let db = match mode {
            OpenMode::Primary => Db::open_cf_descriptors(lib, dir, cfds)?,
            OpenMode::ReadOnly => Db::open_cf_descriptors_read_only(lib, dir, cfds, false)?,
            OpenMode::Secondary => {
                let secondary = dir.with_extension("secondary");
                Db::open_cf_as_secondary(lib, dir, secondary.as_path(), names)?
            }
        };
        Ok(db)
    }

    pub(crate) fn db(&self) -> &Db {
        self.db.as_ref().expect("database already closed")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn checkpoint_id(&self) -> u64 {
        self.checkpoint_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn stats(&self) -> &Arc<DbStats> {
        &self.stats
    }

    pub fn allocator(&self) -> &Arc<CacheAllocator> {
        &self.allocator
    }

    pub fn row_cache(&self) -> &CacheHandle {
        &self.row_cache
    }

    pub(crate) fn request_tag(&self) -> u64 {
        self.tag
    }

    pub fn columns(&self) -> &[Arc<Column>] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Result<&Arc<Column>> {
        self.columns
            .iter()
            .find(|column| column.name() == name)
            .ok_or_else(|| DbError::Schema(format!("no such column '{}'", name)))
    }

    pub(crate) fn cf(
        &self,
        name: &str,
    ) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db()
            .cf_handle(name)
            .ok_or_else(|| DbError::Schema(format!("no column handle for '{}'", name)))
    }

    /// Fold the library statistics dump into the stats mirror and return
    /// a snapshot.
    pub fn stats_snapshot(&self) -> crate::stats::StatsSnapshot {
        if let Some(dump) = self.library_opts.get_statistics() {
            self.stats.fold_dump(&dump);
        }
        self.stats.snapshot()
    }

    pub fn property(&self, column: &str, name: &str) -> Result<Option<String>> {
        let cf = self.cf(column)?;
        Ok(self.db().property_value_cf(&cf, name)?)
    }

    pub fn property_int(&self, column: &str, name: &str) -> Result<Option<u64>> {
        let cf = self.cf(column)?;
        Ok(self.db().property_int_value_cf(&cf, name)?)
    }

    /// Live table files with their sizes.
    pub fn files(&self) -> Result<Vec<(String, u64)>> {
        let files = block_in_place(|| self.db().live_files())?;
        Ok(files.into_iter().map(|f| (f.name, f.size as u64)).collect())
    }

    pub fn sequence(&self) -> u64 {
        self.db().latest_sequence_number()
    }

    // ---- write path -----------------------------------------------------

    /// Commit a batch atomically under the write mutex.
    pub async fn write(&self, batch: &Batch, flags: WriteFlags) -> Result<()> {
        let _guard = self.write_mutex.lock().await;
        self.commit_locked(batch, flags)
    }

    /// Commit from a blocking context.
    pub fn write_blocking(&self, batch: &Batch, flags: WriteFlags) -> Result<()> {
        let _guard = self.write_mutex.blocking_lock();
        self.commit_locked(batch, flags)
    }

    fn commit_locked(&self, batch: &Batch, flags: WriteFlags) -> Result<()> {
        if self.mode != OpenMode::Primary {
            return Err(DbError::NotSupported("database is read-only".into()));
        }
        if self.sink.refusing_writes() {
            return Err(DbError::Aborted(
                "writes refused until background errors are resumed".into(),
            ));
        }

        let mut wb = rocksdb::WriteBatch::default();
        let mut degraded_single_delete = false;
        for delta in batch.deltas() {
            // resolve the column by name once per delta
            let cf = match self.cf(&delta.column) {
                Ok(cf) => cf,
                Err(err) => {
                    if flags.contains(WriteFlags::MISSING_COLUMNS) {
                        debug!("dropping delta for unknown column '{}'", delta.column);
                        continue;
                    }
                    return Err(err);
                }
            };
            match delta.op {
                Op::Set => wb.put_cf(&cf, &delta.key, delta.value.as_deref().unwrap_or(b"")),
                Op::Merge => {
                    wb.merge_cf(&cf, &delta.key, delta.value.as_deref().unwrap_or(b""))
                }
                Op::Delete => wb.delete_cf(&cf, &delta.key),
                Op::DeleteRange => wb.delete_range_cf(
                    &cf,
                    delta.key.as_slice(),
                    delta.value.as_deref().unwrap_or(delta.key.as_slice()),
                ),
                Op::SingleDelete => {
                    degraded_single_delete = true;
                    wb.delete_cf(&cf, &delta.key)
                }
            }
        }
        if degraded_single_delete {
            debug!("single-delete committed as delete");
        }

        // No suspension point from here to the library return.
        block_in_place(|| self.db().write_opt(wb, &make_opts(flags)))?;
        Ok(())
    }

    // ---- maintenance ----------------------------------------------------

    /// Flush the journal to durable storage.
    pub fn sync(&self) -> Result<()> {
        block_in_place(|| self.db().flush_wal(true))?;
        Ok(())
    }

    /// Write out the memtables of every column.
    pub fn flush(&self) -> Result<()> {
        for column in &self.columns {
            self.sort(column.name(), true)?;
        }
        Ok(())
    }

    /// Write out one column's memtable.
    pub fn sort(&self, column: &str, blocking: bool) -> Result<()> {
        let cf = self.cf(column)?;
        self.sink.listener().on_flush_begin(column);
        let mut fopts = FlushOptions::default();
        fopts.set_wait(blocking);
        let result = block_in_place(|| self.db().flush_cf_opt(&cf, &fopts));
        if let Err(err) = result {
            let err = DbError::from(err);
            self.sink.background_error(
                ErrorSource::Flush,
                ErrorSeverity::Hard,
                err.to_string(),
            );
            return Err(err);
        }
        self.sink.listener().on_memtable_sealed(column);
        self.sink.listener().on_flush_complete(column);
        self.update_stall(column)?;
        Ok(())
    }

    /// Manually compact every column, bottom to top.
    ///
    /// The caller's filter (when given) is swapped into each column's
    /// filter slot under the write mutex, guaranteeing exclusive use for
    /// the duration of the manual compaction, and restored afterwards.
    pub async fn compact(&self, filter: Option<CompactionFilterFn>) -> Result<()> {
        for column in &self.columns {
            self.compact_column(column.name(), filter.clone()).await?;
        }
        Ok(())
    }

    pub async fn compact_column(
        &self,
        column: &str,
        filter: Option<CompactionFilterFn>,
    ) -> Result<()> {
        let col = self.column(column)?.clone();
        let cf = self.cf(column)?;
        let _guard = self.write_mutex.lock().await;

        let saved = if let Some(filter) = filter {
            let mut slot = col.filter_slot.write().unwrap();
            Some(std::mem::replace(&mut *slot, Some(filter)))
        } else {
            None
        };

        block_in_place(|| {
            self.db().compact_range_cf(&cf, None::<&[u8]>, None::<&[u8]>);
        });

        if let Some(saved) = saved {
            *col.filter_slot.write().unwrap() = saved;
        }

        self.sink.listener().on_compaction_complete(column);
        self.update_stall(column)?;
        Ok(())
    }

    /// Verify checksums across every column by reading everything.
    pub fn check(&self) -> Result<()> {
        for column in &self.columns {
            let cf = self.cf(column.name())?;
            block_in_place(|| -> Result<()> {
                let mut ropts = ReadOptions::default();
                ropts.set_verify_checksums(true);
                ropts.fill_cache(false);
                let mut iter = self.db().raw_iterator_cf_opt(&cf, ropts);
                iter.seek_to_first();
                while iter.valid() {
                    iter.next();
                }
                iter.status().map_err(DbError::from)
            })?;
        }
        debug!("database '{}': checksum verify passed", self.name);
        Ok(())
    }

    /// Clear recoverable background errors and accept writes again.
    pub fn resume(&self) -> Result<()> {
        if self.sink.resume() {
            info!("database '{}': resumed after background error", self.name);
            Ok(())
        } else {
            Err(DbError::Aborted("unrecoverable background error persists".into()))
        }
    }

    pub fn errors(&self) -> Vec<super::events::BackgroundError> {
        self.sink.errors()
    }

    pub fn refusing_writes(&self) -> bool {
        self.sink.refusing_writes()
    }

    /// Materialise a checkpoint under `<base>/<name>/<seqnum>`; returns
    /// the sequence number.
    pub async fn checkpoint(&self) -> Result<u64> {
        if self.mode != OpenMode::Primary {
            return Err(DbError::NotSupported("checkpoint requires a primary open".into()));
        }
        let _guard = self.write_mutex.lock().await;
        let seq = self.db().latest_sequence_number();
        let target = self.opts.base.join(&self.name).join(seq.to_string());
        if target.exists() {
            return Err(DbError::InvalidArgument(format!(
                "checkpoint {} already exists",
                seq
            )));
        }
        block_in_place(|| -> Result<()> {
            let checkpoint = Checkpoint::new(self.db())?;
            checkpoint.create_checkpoint(&target)?;
            Ok(())
        })?;
        info!("database '{}': checkpoint {} created", self.name, seq);
        Ok(seq)
    }

    /// Pin a read view at the current sequence number.
    ///
    /// Not available on a secondary attach; its view moves with catch-up.
    pub fn snapshot(&self) -> Result<super::snapshot::Snapshot<'_>> {
        if self.mode == OpenMode::Secondary {
            return Err(DbError::NotSupported("snapshots unavailable in secondary mode".into()));
        }
        Ok(super::snapshot::Snapshot::new(self))
    }

    /// Secondary mode: replay the primary's recent journal.
    pub fn catch_up(&self) -> Result<()> {
        if self.mode != OpenMode::Secondary {
            return Err(DbError::NotSupported("catch-up requires secondary mode".into()));
        }
        block_in_place(|| self.db().try_catch_up_with_primary())?;
        Ok(())
    }

    /// Refresh one column's stall state from library properties and emit
    /// a transition event if it changed.
    pub fn update_stall(&self, column: &str) -> Result<Stall> {
        let col = self.column(column)?.clone();
        let stopped = self
            .property_int(column, "rocksdb.is-write-stopped")?
            .unwrap_or(0);
        let delayed = self
            .property_int(column, "rocksdb.actual-delayed-write-rate")?
            .unwrap_or(0);
        let stall = if stopped != 0 {
            Stall::Stopped
        } else if delayed != 0 {
            Stall::Delayed
        } else {
            Stall::Normal
        };
        if stall != col.stall() {
            col.set_stall(stall);
            self.sink.listener().on_stall(column, stall);
        }
        Ok(stall)
    }

    /// Report an error observed in background work against this
    /// database.
    pub fn report_background_error(
        &self,
        source: ErrorSource,
        severity: ErrorSeverity,
        message: String,
    ) {
        self.sink.background_error(source, severity, message);
    }

    /// Orderly close. Also runs on drop; close-time errors are logged
    /// and swallowed.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let db = match self.db.take() {
            Some(db) => db,
            None => return,
        };

        // Pending prefetches are cancelled, in-flight awaited. When the
        // last reference dies inside a pool worker itself, waiting would
        // wait on ourselves; the remaining task holds no database state
        // beyond this frame.
        let cancelled = pool::cancel_for(self.tag);
        if cancelled > 0 {
            debug!("database '{}': cancelled {} pending request(s)", self.name, cancelled);
        }
        let on_pool_worker =
            std::thread::current().name().map_or(false, |name| name.starts_with("db "));
        if !on_pool_worker {
            pool::drain();
        }

        block_in_place(|| db.cancel_all_background_work(true));

        self.columns.clear();

        if self.mode == OpenMode::Primary {
            if let Err(err) = block_in_place(|| db.flush_wal(true)) {
                warn!("database '{}': journal sync at close failed: {}", self.name, err);
            }
        }

        drop(db);
        self.env.shutdown();
        info!("database '{}' closed", self.name);
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn rlimit_nofile() -> i32 {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return 512;
    }
    if limit.rlim_cur == libc::RLIM_INFINITY || limit.rlim_cur > i32::MAX as u64 {
        i32::MAX
    } else {
        limit.rlim_cur as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nofile_limit_is_positive() {
        assert!(rlimit_nofile() > 0);
    }

    #[test]
    fn directory_layout() {
        let opts = DbOpts { base: PathBuf::from("/var/db"), ..DbOpts::default() };
        let dir = opts.base.join("events").join(0.to_string());
        assert_eq!(dir, PathBuf::from("/var/db/events/0"));
    }
}
