//! Columns: per-keyspace descriptors and their library option
//! derivation.

use std::cmp::Ordering;
use std::convert::TryInto;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use log::warn;
use rocksdb::compaction_filter::Decision;
use rocksdb::{BlockBasedOptions, DBCompactionStyle, Options, SliceTransform};

use crate::cache::CacheHandle;

use super::merge;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Semantic key types with deduced comparators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Byte-string view; lexicographic bytewise order (library default).
    Bytes,
    /// Signed 64-bit integer, fixed 8-byte big-endian encoding.
    I64,
    /// Unsigned 64-bit integer, fixed 8-byte big-endian encoding.
    U64,
    /// Reverse lexicographic with shorter-before-longer.
    ReverseBytes,
}

/// Semantic value type; informational for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bytes,
    I64,
    U64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixSpec {
    None,
    /// Fixed-length prefix.
    Fixed(usize),
    /// Prefix runs up to (and including) the first NUL.
    Delimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    /// Algorithms compiled into the library build.
    pub fn supported() -> &'static [Compression] {
        &[Compression::Snappy, Compression::Lz4, Compression::Zstd, Compression::None]
    }

    fn to_library(self) -> rocksdb::DBCompressionType {
        use rocksdb::DBCompressionType;
        match self {
            Compression::None => DBCompressionType::None,
            Compression::Snappy => DBCompressionType::Snappy,
            Compression::Lz4 => DBCompressionType::Lz4,
            Compression::Zstd => DBCompressionType::Zstd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStyle {
    Level,
    Universal,
}

/// Compaction pick order, by library name.
///
/// Parsed and recorded; the binding exposes no setter for it and the
/// library default is the last entry anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionPriority {
    ByCompensatedSize,
    OldestLargestSeqFirst,
    OldestSmallestSeqFirst,
    MinOverlappingRatio,
}

impl CompactionPriority {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "kByCompensatedSize" => Some(CompactionPriority::ByCompensatedSize),
            "kOldestLargestSeqFirst" => Some(CompactionPriority::OldestLargestSeqFirst),
            "kOldestSmallestSeqFirst" => Some(CompactionPriority::OldestSmallestSeqFirst),
            "kMinOverlappingRatio" | "" => Some(CompactionPriority::MinOverlappingRatio),
            _ => None,
        }
    }
}

/// Entry classes a compaction filter can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Value,
    Merge,
}

/// Verdict of a compaction filter callback.
pub enum FilterVerdict {
    Keep,
    Change(Vec<u8>),
    Remove,
    /// Remove and skip forward. The binding's decision set has no
    /// skip-until, so this degrades to a plain remove.
    RemoveAndSkipUntil(Vec<u8>),
}

pub type CompactionFilterFn =
    Arc<dyn Fn(u32, &[u8], &[u8], EntryType) -> FilterVerdict + Send + Sync>;

/// Write-pressure state of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stall {
    Normal,
    Delayed,
    Stopped,
}

/// Everything the caller specifies about one column.
#[derive(Clone)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Drop this column right after open instead of keeping it.
    pub drop: bool,
    pub key_type: KeyType,
    pub value_type: ValueType,
    pub prefix: PrefixSpec,
    pub compaction_filter: Option<CompactionFilterFn>,
    pub merge: Option<merge::MergeFn>,
    pub block_size: usize,
    pub meta_block_size: usize,
    pub bloom_bits: u8,
    /// Block cache capacity; zero leaves the column on the shared cache.
    pub cache_size: usize,
    /// Compressed block cache capacity. The modern library removed the
    /// compressed cache; accepted and ignored with a warning.
    pub cache_size_comp: usize,
    /// Preference-ordered compression; the first supported entry wins.
    pub compression: Vec<Compression>,
    pub write_buffer_blocks: usize,
    pub target_file_size_base: u64,
    pub target_file_size_multiplier: i32,
    pub max_bytes_for_level_base: u64,
    pub max_bytes_for_level_multiplier: f64,
    pub num_levels: i32,
    pub compaction_period_secs: u64,
    pub compaction_style: CompactionStyle,
    pub compaction_priority: CompactionPriority,
    /// Most point queries are expected to hit; enables the library's
    /// filter optimisations for that profile.
    pub expect_queries_hit: bool,
    pub auto_compaction: bool,
}

impl ColumnDescriptor {
    pub fn new(name: &str) -> Self {
        ColumnDescriptor {
            name: name.to_owned(),
            drop: false,
            key_type: KeyType::Bytes,
            value_type: ValueType::Bytes,
            prefix: PrefixSpec::None,
            compaction_filter: None,
            merge: None,
            block_size: 16 * KIB,
            meta_block_size: 512,
            bloom_bits: 10,
            cache_size: 8 * MIB,
            cache_size_comp: 0,
            compression: vec![Compression::Lz4, Compression::Snappy, Compression::None],
            write_buffer_blocks: 32,
            target_file_size_base: 64 * MIB as u64,
            target_file_size_multiplier: 1,
            max_bytes_for_level_base: 256 * MIB as u64,
            max_bytes_for_level_multiplier: 10.0,
            num_levels: 7,
            compaction_period_secs: 0,
            compaction_style: CompactionStyle::Level,
            compaction_priority: CompactionPriority::MinOverlappingRatio,
            expect_queries_hit: false,
            auto_compaction: true,
        }
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    pub fn drop_column(mut self) -> Self {
        self.drop = true;
        self
    }

    pub fn prefix(mut self, prefix: PrefixSpec) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn compaction_filter(mut self, filter: CompactionFilterFn) -> Self {
        self.compaction_filter = Some(filter);
        self
    }

    pub fn merge(mut self, merge: merge::MergeFn) -> Self {
        self.merge = Some(merge);
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    pub fn write_buffer_blocks(mut self, blocks: usize) -> Self {
        self.write_buffer_blocks = blocks;
        self
    }

    /// Write buffer derived from the block budget, clamped to sane
    /// bounds.
    pub fn write_buffer_size(&self) -> usize {
        (self.write_buffer_blocks * self.block_size).max(256 * KIB).min(16 * MIB)
    }

    /// Memtable arena block, half the write buffer within bounds.
    pub fn arena_block_size(&self) -> usize {
        (self.write_buffer_size() / 2).max(512 * KIB).min(4 * MIB)
    }

    /// First requested compression that the library build supports.
    pub fn effective_compression(&self) -> Compression {
        for algo in &self.compression {
            if Compression::supported().contains(algo) {
                return *algo;
            }
        }
        Compression::None
    }
}

/// Open column state. Handles into the library are fetched by name per
/// operation; this carries the engine-side state.
pub struct Column {
    /// Ordinal assigned at open from the on-disk listing; stable for the
    /// life of the directory.
    pub(crate) id: u32,
    pub(crate) descriptor: ColumnDescriptor,
    /// Filter consulted by the registered library callback. Manual
    /// compaction swaps its own filter in here for the duration.
    pub(crate) filter_slot: Arc<RwLock<Option<CompactionFilterFn>>>,
    pub(crate) cache: Option<Arc<CacheHandle>>,
    stall: AtomicU8,
}

impl Column {
    pub(crate) fn new(
        id: u32,
        descriptor: ColumnDescriptor,
        cache: Option<Arc<CacheHandle>>,
    ) -> Self {
        let filter_slot = Arc::new(RwLock::new(descriptor.compaction_filter.clone()));
        Column { id, descriptor, filter_slot, cache, stall: AtomicU8::new(0) }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ColumnDescriptor {
        &self.descriptor
    }

    pub fn cache(&self) -> Option<&Arc<CacheHandle>> {
        self.cache.as_ref()
    }

    pub fn stall(&self) -> Stall {
        match self.stall.load(AtomicOrdering::Acquire) {
            0 => Stall::Normal,
            1 => Stall::Delayed,
            _ => Stall::Stopped,
        }
    }

    pub(crate) fn set_stall(&self, stall: Stall) {
        let value = match stall {
            Stall::Normal => 0,
            Stall::Delayed => 1,
            Stall::Stopped => 2,
        };
        self.stall.store(value, AtomicOrdering::Release);
    }
}

/// Comparator for signed 64-bit keys in fixed big-endian encoding.
///
/// Keys of any other size fall back to a deterministic order so the
/// comparator stays total.
fn cmp_i64(a: &[u8], b: &[u8]) -> Ordering {
    match (decode_i64(a), decode_i64(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}

fn cmp_u64(a: &[u8], b: &[u8]) -> Ordering {
    match (decode_u64(a), decode_u64(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}

/// Reverse bytewise order where a shorter key sorts before a longer key
/// regardless of content. The library's prefix machinery relies on the
/// length rule; violating it returns wrong results without any error.
fn cmp_reverse(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| b.cmp(a))
}

/// Compare two keys under a column's deduced comparator.
pub fn key_cmp(key_type: KeyType, a: &[u8], b: &[u8]) -> Ordering {
    match key_type {
        KeyType::Bytes => a.cmp(b),
        KeyType::I64 => cmp_i64(a, b),
        KeyType::U64 => cmp_u64(a, b),
        KeyType::ReverseBytes => cmp_reverse(a, b),
    }
}

pub fn encode_i64(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn decode_i64(key: &[u8]) -> Option<i64> {
    let arr: [u8; 8] = key.try_into().ok()?;
    Some(i64::from_be_bytes(arr))
}

pub fn decode_u64(key: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

fn delimited_prefix(key: &[u8]) -> &[u8] {
    match key.iter().position(|b| *b == 0) {
        Some(pos) => &key[..pos + 1],
        None => key,
    }
}

fn delimited_in_domain(key: &[u8]) -> bool {
    key.contains(&0)
}

/// Build the library options for one column.
pub fn cf_options(
    descriptor: &ColumnDescriptor,
    filter_slot: &Arc<RwLock<Option<CompactionFilterFn>>>,
    cache: Option<&Arc<CacheHandle>>,
) -> Options {
    let mut opts = Options::default();

    match descriptor.key_type {
        KeyType::Bytes => {}
        KeyType::I64 => opts.set_comparator("i64", Box::new(cmp_i64)),
        KeyType::U64 => opts.set_comparator("u64", Box::new(cmp_u64)),
        KeyType::ReverseBytes => opts.set_comparator("reverse", Box::new(cmp_reverse)),
    }

    match descriptor.prefix {
        PrefixSpec::None => {}
        PrefixSpec::Fixed(len) => {
            opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(len));
        }
        PrefixSpec::Delimited => {
            opts.set_prefix_extractor(SliceTransform::create(
                "delimited",
                delimited_prefix,
                Some(delimited_in_domain),
            ));
        }
    }

    let mut table = BlockBasedOptions::default();
    table.set_block_size(descriptor.block_size);
    table.set_metadata_block_size(descriptor.meta_block_size);
    if descriptor.bloom_bits > 0 {
        table.set_bloom_filter(descriptor.bloom_bits as f64, false);
    }
    table.set_cache_index_and_filter_blocks(true);
    table.set_pin_l0_filter_and_index_blocks_in_cache(true);
    if let Some(cache) = cache {
        table.set_block_cache(cache.inner());
    }
    opts.set_block_based_table_factory(&table);

    if descriptor.cache_size_comp > 0 {
        warn!(
            "column '{}': compressed block cache no longer exists in the library; \
             {} bytes requested and ignored",
            descriptor.name, descriptor.cache_size_comp
        );
    }

    opts.set_write_buffer_size(descriptor.write_buffer_size());
    opts.set_arena_block_size(descriptor.arena_block_size());
    opts.set_compression_type(descriptor.effective_compression().to_library());
    opts.set_target_file_size_base(descriptor.target_file_size_base);
    opts.set_target_file_size_multiplier(descriptor.target_file_size_multiplier);
    opts.set_max_bytes_for_level_base(descriptor.max_bytes_for_level_base);
    opts.set_max_bytes_for_level_multiplier(descriptor.max_bytes_for_level_multiplier);
    opts.set_num_levels(descriptor.num_levels);
    if descriptor.compaction_period_secs > 0 {
        opts.set_periodic_compaction_seconds(descriptor.compaction_period_secs);
    }
    opts.set_compaction_style(match descriptor.compaction_style {
        CompactionStyle::Level => DBCompactionStyle::Level,
        CompactionStyle::Universal => DBCompactionStyle::Universal,
    });
    opts.set_optimize_filters_for_hits(descriptor.expect_queries_hit);
    opts.set_disable_auto_compactions(!descriptor.auto_compaction);

    if let Some(merge_fn) = &descriptor.merge {
        opts.set_merge_operator_associative("loam merge", merge::adapt(merge_fn.clone()));
    }

    // Always registered; the slot decides at run time. Manual compaction
    // swaps the slot under the write mutex.
    let slot = Arc::clone(filter_slot);
    let name = descriptor.name.clone();
    opts.set_compaction_filter("loam filter", move |level, key, value| {
        let guard = match slot.read() {
            Ok(guard) => guard,
            Err(_) => return Decision::Keep,
        };
        let filter = match guard.as_ref() {
            Some(filter) => filter,
            None => return Decision::Keep,
        };
        match filter(level, key, value, EntryType::Value) {
            FilterVerdict::Keep => Decision::Keep,
            FilterVerdict::Remove => Decision::Remove,
            FilterVerdict::Change(data) => Decision::Change(Box::leak(data.into_boxed_slice())),
            FilterVerdict::RemoveAndSkipUntil(_) => {
                warn!("column '{}': skip-until degraded to remove", name);
                Decision::Remove
            }
        }
    });

    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_buffer_clamps() {
        let mut desc = ColumnDescriptor::new("c");
        desc.block_size = 4096;
        desc.write_buffer_blocks = 1;
        assert_eq!(desc.write_buffer_size(), 256 * KIB);
        assert_eq!(desc.arena_block_size(), 512 * KIB);

        desc.write_buffer_blocks = 1 << 20;
        assert_eq!(desc.write_buffer_size(), 16 * MIB);
        assert_eq!(desc.arena_block_size(), 4 * MIB);

        desc.block_size = 16 * KIB;
        desc.write_buffer_blocks = 64;
        assert_eq!(desc.write_buffer_size(), 1 * MIB);
        assert_eq!(desc.arena_block_size(), 512 * KIB);
    }

    #[test]
    fn compression_falls_back_to_supported() {
        let mut desc = ColumnDescriptor::new("c");
        desc.compression = vec![Compression::Zstd];
        assert_eq!(desc.effective_compression(), Compression::Zstd);

        desc.compression = vec![];
        assert_eq!(desc.effective_compression(), Compression::None);
    }

    #[test]
    fn numeric_comparators_order_by_value() {
        let neg = encode_i64(-5);
        let pos = encode_i64(3);
        assert_eq!(cmp_i64(&neg, &pos), Ordering::Less);
        assert_eq!(cmp_i64(&pos, &pos), Ordering::Equal);

        let small = encode_u64(2);
        let big = encode_u64(u64::MAX);
        assert_eq!(cmp_u64(&small, &big), Ordering::Less);
    }

    #[test]
    fn reverse_comparator_shorter_sorts_first() {
        // length dominates content in both directions
        assert_eq!(cmp_reverse(b"zz", b"aaa"), Ordering::Less);
        assert_eq!(cmp_reverse(b"aaa", b"zz"), Ordering::Greater);
        // equal length reverses the bytewise order
        assert_eq!(cmp_reverse(b"abc", b"abd"), Ordering::Greater);
        assert_eq!(cmp_reverse(b"abd", b"abc"), Ordering::Less);
        assert_eq!(cmp_reverse(b"abc", b"abc"), Ordering::Equal);
    }

    #[test]
    fn delimited_prefix_cuts_at_nul() {
        assert_eq!(delimited_prefix(b"room\0event"), b"room\0");
        assert_eq!(delimited_prefix(b"nodelim"), b"nodelim");
        assert!(delimited_in_domain(b"a\0b"));
        assert!(!delimited_in_domain(b"ab"));
    }

    #[test]
    fn compaction_priority_names() {
        assert_eq!(
            CompactionPriority::parse("kMinOverlappingRatio"),
            Some(CompactionPriority::MinOverlappingRatio)
        );
        assert_eq!(
            CompactionPriority::parse("kOldestLargestSeqFirst"),
            Some(CompactionPriority::OldestLargestSeqFirst)
        );
        assert_eq!(CompactionPriority::parse("bogus"), None);
    }

    #[test]
    fn stall_state_round_trips() {
        let col = Column::new(0, ColumnDescriptor::new("c"), None);
        assert_eq!(col.stall(), Stall::Normal);
        col.set_stall(Stall::Delayed);
        assert_eq!(col.stall(), Stall::Delayed);
        col.set_stall(Stall::Stopped);
        assert_eq!(col.stall(), Stall::Stopped);
    }
}
