//! Secondary attach and maintenance entry points.

use std::sync::Arc;

use loam::{ColumnDescriptor, Database, DbError, DbOpts, WriteFlags};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn opts(base: &tempfile::TempDir) -> DbOpts {
    DbOpts { base: base.path().to_owned(), ..DbOpts::default() }
}

#[tokio::test(flavor = "multi_thread")]
async fn secondary_catches_up_with_primary() {
    init_log();
    let base = tempfile::tempdir().unwrap();

    let primary = Arc::new(
        Database::open("events", opts(&base), vec![ColumnDescriptor::new("x")], "").unwrap(),
    );
    let x = primary.column_ref("x").unwrap();
    x.write(b"k1", b"v1", WriteFlags::empty()).await.unwrap();
    primary.flush().unwrap();

    let secondary = Arc::new(
        Database::open(
            "events",
            DbOpts { secondary: true, ..opts(&base) },
            vec![ColumnDescriptor::new("x")],
            "",
        )
        .unwrap(),
    );
    let sx = secondary.column_ref("x").unwrap();
    assert_eq!(sx.get_opt(b"k1").unwrap().unwrap(), b"v1");

    // new primary writes become visible after catch-up
    x.write(b"k2", b"v2", WriteFlags::empty()).await.unwrap();
    primary.sync().unwrap();
    secondary.catch_up().unwrap();
    assert_eq!(sx.get_opt(b"k2").unwrap().unwrap(), b"v2");

    // secondaries pin no snapshots and take no writes
    assert!(matches!(secondary.snapshot(), Err(DbError::NotSupported(_))));
    let err = sx.write(b"k3", b"v3", WriteFlags::empty()).await.unwrap_err();
    assert!(matches!(err, DbError::NotSupported(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn maintenance_surface_runs() {
    init_log();
    let base = tempfile::tempdir().unwrap();
    let db = Arc::new(
        Database::open("events", opts(&base), vec![ColumnDescriptor::new("x")], "").unwrap(),
    );
    let x = db.column_ref("x").unwrap();
    x.write(b"k", b"v", WriteFlags::empty()).await.unwrap();

    db.sync().unwrap();
    db.sort("x", true).unwrap();
    db.flush().unwrap();
    db.check().unwrap();
    db.compact(None).await.unwrap();

    use loam::db::Stall;
    assert_eq!(db.update_stall("x").unwrap(), Stall::Normal);
    assert_eq!(db.column("x").unwrap().stall(), Stall::Normal);

    assert_eq!(x.get_opt(b"k").unwrap().unwrap(), b"v");
}
