//! Read surface: snapshots, iterators, cells, rows, indexes,
//! comparators, compaction filtering.

use std::sync::Arc;

use loam::db::{EntryType, FilterVerdict};
use loam::{
    Batch, Cell, ColumnDescriptor, Database, DbError, DbOpts, IndexRef, KeyType, Row,
    Validity, WriteFlags,
};

fn opts(base: &tempfile::TempDir) -> DbOpts {
    DbOpts { base: base.path().to_owned(), ..DbOpts::default() }
}

async fn seed(db: &Arc<Database>, column: &str, pairs: &[(&[u8], &[u8])]) {
    let mut batch = Batch::new();
    for (key, value) in pairs {
        batch.set(column, key, value);
    }
    db.write(&batch, WriteFlags::empty()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_pins_a_view() {
    let base = tempfile::tempdir().unwrap();
    let db = Arc::new(
        Database::open("events", opts(&base), vec![ColumnDescriptor::new("x")], "").unwrap(),
    );
    let x = db.column_ref("x").unwrap();

    x.write(b"k", b"v1", WriteFlags::empty()).await.unwrap();

    let snap = db.snapshot().unwrap();
    let s0 = snap.sequence();

    x.del(b"k", WriteFlags::empty()).await.unwrap();

    // the snapshot still sees the key, the live view does not
    assert_eq!(snap.get("x", b"k").unwrap().unwrap(), b"v1");
    assert!(x.get_opt(b"k").unwrap().is_none());
    assert!(db.sequence() > s0);

    drop(snap);
    assert!(x.get_opt(b"k").unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn point_reads_and_presence() {
    let base = tempfile::tempdir().unwrap();
    let db = Arc::new(
        Database::open("events", opts(&base), vec![ColumnDescriptor::new("x")], "").unwrap(),
    );
    let x = db.column_ref("x").unwrap();
    seed(&db, "x", &[(b"here", b"value")]).await;

    let len = x.get(b"here", |value| value.len()).unwrap();
    assert_eq!(len, 5);
    assert!(matches!(x.get(b"absent", |_| ()), Err(DbError::NotFound)));

    assert!(x.has(b"here").unwrap());
    assert!(!x.has(b"absent").unwrap());

    // cached() never errors on a miss and prefetch warms it
    let _ = x.cached(b"here").unwrap();
    x.prefetch(b"here").unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn iterators_walk_in_order_and_wrap() {
    let base = tempfile::tempdir().unwrap();
    let db = Arc::new(
        Database::open("events", opts(&base), vec![ColumnDescriptor::new("x")], "").unwrap(),
    );
    seed(&db, "x", &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]).await;
    let x = db.column_ref("x").unwrap();

    let keys: Vec<_> = x.begin().unwrap().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"a".to_vec().into_boxed_slice(),
                          b"b".to_vec().into_boxed_slice(),
                          b"c".to_vec().into_boxed_slice()]);

    // rbegin sits on the last key
    let it = x.rbegin().unwrap();
    assert_eq!(it.key(), Some(&b"c"[..]));

    // stepping past the end invalidates, stepping again wraps to front
    let mut it = x.rbegin().unwrap();
    it.step();
    assert!(!it.valid());
    it.step();
    assert_eq!(it.key(), Some(&b"a"[..]));

    // and the reverse wrap lands on the back
    let mut it = x.begin().unwrap();
    it.step_back();
    assert!(!it.valid());
    it.step_back();
    assert_eq!(it.key(), Some(&b"c"[..]));

    // find is exact-only
    assert!(x.find(b"b").unwrap().valid());
    assert!(!x.find(b"bb").unwrap().valid());

    // bounds: lower is >=, upper is >
    assert_eq!(x.lower_bound(b"b").unwrap().key(), Some(&b"b"[..]));
    assert_eq!(x.upper_bound(b"b").unwrap().key(), Some(&b"c"[..]));

    // invalid iterators compare equal
    let end1 = x.end().unwrap();
    let end2 = x.rend().unwrap();
    assert!(end1.same(&end2));
}

#[tokio::test(flavor = "multi_thread")]
async fn committed_key_seeks_to_itself() {
    let base = tempfile::tempdir().unwrap();
    let db = Arc::new(
        Database::open("events", opts(&base), vec![ColumnDescriptor::new("x")], "").unwrap(),
    );
    seed(&db, "x", &[(b"exact", b"v")]).await;
    let x = db.column_ref("x").unwrap();

    let mut it = x.lower_bound(b"exact").unwrap();
    assert_eq!(it.key(), Some(&b"exact"[..]));
    it.step();
    assert!(!it.valid());
}

#[tokio::test(flavor = "multi_thread")]
async fn reverse_column_orders_shorter_first() {
    let base = tempfile::tempdir().unwrap();
    let descriptors = vec![ColumnDescriptor::new("r").key_type(KeyType::ReverseBytes)];
    let db = Arc::new(Database::open("events", opts(&base), descriptors, "").unwrap());
    seed(&db, "r", &[(b"aaa", b"3"), (b"zz", b"2"), (b"b", b"1")]).await;
    let r = db.column_ref("r").unwrap();

    // length dominates: "b" < "zz" < "aaa" under the reverse comparator
    let keys: Vec<_> = r.begin().unwrap().map(|(k, _)| k.to_vec()).collect();
    assert_eq!(keys, vec![b"b".to_vec(), b"zz".to_vec(), b"aaa".to_vec()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn numeric_column_orders_by_value() {
    use loam::db::{encode_i64};

    let base = tempfile::tempdir().unwrap();
    let descriptors = vec![ColumnDescriptor::new("n").key_type(KeyType::I64)];
    let db = Arc::new(Database::open("events", opts(&base), descriptors, "").unwrap());

    let mut batch = Batch::new();
    for value in [10i64, -3, 7, 0] {
        batch.set("n", &encode_i64(value), b"v");
    }
    db.write(&batch, WriteFlags::empty()).await.unwrap();

    let n = db.column_ref("n").unwrap();
    let keys: Vec<i64> = n
        .begin()
        .unwrap()
        .map(|(k, _)| loam::db::decode_i64(&k).unwrap())
        .collect();
    assert_eq!(keys, vec![-3, 0, 7, 10]);
}

#[tokio::test(flavor = "multi_thread")]
async fn cells_track_validity() {
    let base = tempfile::tempdir().unwrap();
    let db = Arc::new(
        Database::open("events", opts(&base), vec![ColumnDescriptor::new("x")], "").unwrap(),
    );
    seed(&db, "x", &[(b"b", b"2"), (b"d", b"4")]).await;
    let x = db.column_ref("x").unwrap();

    let mut cell = Cell::new(&x).unwrap();
    assert_eq!(cell.validity(), Validity::Invalid);

    assert_eq!(cell.seek(b"b"), Validity::Equal);
    assert_eq!(cell.value(), Some(&b"2"[..]));

    assert_eq!(cell.seek(b"c"), Validity::Gt);
    assert_eq!(cell.key(), Some(&b"d"[..]));

    assert_eq!(cell.seek(b"z"), Validity::Invalid);

    assert_eq!(cell.seek_prev(b"c"), Validity::Lte);
    assert_eq!(cell.key(), Some(&b"b"[..]));

    cell.next();
    assert_eq!(cell.validity(), Validity::Gt);
}

#[tokio::test(flavor = "multi_thread")]
async fn row_seek_counts_valid_cells() {
    let base = tempfile::tempdir().unwrap();
    let descriptors = vec![
        ColumnDescriptor::new("a"),
        ColumnDescriptor::new("b"),
        ColumnDescriptor::new("c"),
    ];
    let db = Arc::new(Database::open("events", opts(&base), descriptors, "").unwrap());
    seed(&db, "a", &[(b"k", b"va")]).await;
    seed(&db, "c", &[(b"k", b"vc")]).await;

    let columns = vec![
        db.column_ref("a").unwrap(),
        db.column_ref("b").unwrap(),
        db.column_ref("c").unwrap(),
    ];
    let mut row = Row::new(&columns).unwrap();
    assert!(!row.valid());

    let valid = row.seek(b"k").unwrap();
    assert_eq!(valid, 2);
    assert!(row.valid());
    assert_eq!(row.cell(0).value(), Some(&b"va"[..]));
    assert!(!row.cell(1).valid_eq());
    assert_eq!(row.cell(2).value(), Some(&b"vc"[..]));
}

#[tokio::test(flavor = "multi_thread")]
async fn index_iterates_prefix_both_ways() {
    let base = tempfile::tempdir().unwrap();
    let db = Arc::new(
        Database::open("events", opts(&base), vec![ColumnDescriptor::new("i")], "").unwrap(),
    );
    seed(
        &db,
        "i",
        &[
            (b"room1\x00e1", b"1"),
            (b"room1\x00e2", b"2"),
            (b"room1\x00e3", b"3"),
            (b"room2\x00e1", b"9"),
        ],
    )
    .await;

    let index = IndexRef::new(db.column_ref("i").unwrap());

    let forward: Vec<_> = index
        .iter(b"room1\x00")
        .unwrap()
        .map(|(k, _)| k.to_vec())
        .collect();
    assert_eq!(forward, vec![
        b"room1\x00e1".to_vec(),
        b"room1\x00e2".to_vec(),
        b"room1\x00e3".to_vec(),
    ]);

    let reverse: Vec<_> = index
        .iter_rev(b"room1\x00")
        .unwrap()
        .map(|(k, _)| k.to_vec())
        .collect();
    assert_eq!(reverse, vec![
        b"room1\x00e3".to_vec(),
        b"room1\x00e2".to_vec(),
        b"room1\x00e1".to_vec(),
    ]);

    assert_eq!(index.count(b"room2\x00").unwrap(), 1);
    assert_eq!(index.count(b"room3\x00").unwrap(), 0);
    assert!(index.iter_rev(b"room3\x00").unwrap().next().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn compaction_filter_scrubs_prefix() {
    let filter: loam::db::CompactionFilterFn =
        Arc::new(|_level, key, _value, entry| {
            assert_eq!(entry, EntryType::Value);
            if key.starts_with(b"_t:") {
                FilterVerdict::Remove
            } else {
                FilterVerdict::Keep
            }
        });

    let base = tempfile::tempdir().unwrap();
    let db = Arc::new(
        Database::open("events", opts(&base), vec![ColumnDescriptor::new("x")], "").unwrap(),
    );
    seed(
        &db,
        "x",
        &[
            (b"_t:1", b"tmp"),
            (b"_t:2", b"tmp"),
            (b"keep1", b"v"),
            (b"keep2", b"v"),
        ],
    )
    .await;

    db.flush().unwrap();
    db.compact(Some(filter)).await.unwrap();

    let x = db.column_ref("x").unwrap();
    assert!(x.get_opt(b"_t:1").unwrap().is_none());
    assert!(x.get_opt(b"_t:2").unwrap().is_none());
    assert_eq!(x.get_opt(b"keep1").unwrap().unwrap(), b"v");
    assert_eq!(x.get_opt(b"keep2").unwrap().unwrap(), b"v");

    // the swapped-in filter was restored; another compaction without a
    // filter removes nothing
    seed(&db, "x", &[(b"_t:3", b"tmp")]).await;
    db.flush().unwrap();
    db.compact(None).await.unwrap();
    assert_eq!(x.get_opt(b"_t:3").unwrap().unwrap(), b"tmp");
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_mirror_follows_activity() {
    let base = tempfile::tempdir().unwrap();
    let db = Arc::new(
        Database::open("events", opts(&base), vec![ColumnDescriptor::new("x")], "").unwrap(),
    );
    seed(&db, "x", &[(b"k", b"v")]).await;
    db.flush().unwrap();

    let x = db.column_ref("x").unwrap();
    let _ = x.get_opt(b"k").unwrap();

    let snap = db.stats_snapshot();
    // folding is lossless even when counters are still zero
    assert!(snap.block_cache_hit + snap.block_cache_miss + snap.block_cache_add < u64::MAX);
}
