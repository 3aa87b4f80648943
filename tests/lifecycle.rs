//! Database lifecycle: open, reopen, drops, checkpoints, modes.

use std::sync::Arc;

use loam::db::OpenHooks;
use loam::{ColumnDescriptor, Database, DbError, DbOpts, WriteFlags};

fn opts(base: &tempfile::TempDir) -> DbOpts {
    DbOpts { base: base.path().to_owned(), ..DbOpts::default() }
}

fn columns(names: &[&str]) -> Vec<ColumnDescriptor> {
    names.iter().map(|name| ColumnDescriptor::new(name)).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn write_survives_reopen() {
    let base = tempfile::tempdir().unwrap();

    {
        let db = Arc::new(
            Database::open("events", opts(&base), columns(&["x"]), "").unwrap(),
        );
        let x = db.column_ref("x").unwrap();
        x.write(b"a", b"1", WriteFlags::empty()).await.unwrap();
        assert_eq!(x.get_opt(b"a").unwrap().unwrap(), b"1");
    }

    let db = Arc::new(Database::open("events", opts(&base), columns(&["x"]), "").unwrap());
    let x = db.column_ref("x").unwrap();
    assert_eq!(x.get_opt(b"a").unwrap().unwrap(), b"1");
}

#[tokio::test(flavor = "multi_thread")]
async fn read_only_refuses_writes() {
    let base = tempfile::tempdir().unwrap();

    {
        let db = Arc::new(
            Database::open("events", opts(&base), columns(&["x"]), "").unwrap(),
        );
        let x = db.column_ref("x").unwrap();
        x.write(b"k", b"v", WriteFlags::empty()).await.unwrap();
    }

    let db = Arc::new(
        Database::open("events", opts(&base), columns(&["x"]), "read_only=true;").unwrap(),
    );
    let x = db.column_ref("x").unwrap();

    assert_eq!(x.get_opt(b"k").unwrap().unwrap(), b"v");

    let err = x.write(b"k2", b"v2", WriteFlags::empty()).await.unwrap_err();
    assert!(matches!(err, DbError::NotSupported(_)));
    let err = x.del(b"k", WriteFlags::empty()).await.unwrap_err();
    assert!(matches!(err, DbError::NotSupported(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_column_is_gone_after_reopen() {
    let base = tempfile::tempdir().unwrap();

    {
        let db = Arc::new(
            Database::open("events", opts(&base), columns(&["x", "y"]), "").unwrap(),
        );
        let y = db.column_ref("y").unwrap();
        y.write(b"k", b"v", WriteFlags::empty()).await.unwrap();
        db.flush().unwrap();
    }

    // reopen with y marked for drop
    {
        let descriptors = vec![
            ColumnDescriptor::new("x"),
            ColumnDescriptor::new("y").drop_column(),
        ];
        let db = Arc::new(Database::open("events", opts(&base), descriptors, "").unwrap());
        assert!(db.column("y").is_err());
        assert!(db.column("x").is_ok());
    }

    // and a plain reopen no longer needs the descriptor at all
    let db = Arc::new(Database::open("events", opts(&base), columns(&["x"]), "").unwrap());
    assert!(db.column("y").is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn drop_descriptor_for_missing_column_is_skipped() {
    let base = tempfile::tempdir().unwrap();
    let descriptors = vec![
        ColumnDescriptor::new("x"),
        ColumnDescriptor::new("ghost").drop_column(),
    ];
    let db = Arc::new(Database::open("events", opts(&base), descriptors, "").unwrap());
    assert!(db.column("ghost").is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn undeclared_on_disk_column_fails_open() {
    let base = tempfile::tempdir().unwrap();

    {
        let _db = Arc::new(
            Database::open("events", opts(&base), columns(&["x", "y"]), "").unwrap(),
        );
    }

    let err = Database::open("events", opts(&base), columns(&["x"]), "").unwrap_err();
    assert!(matches!(err, DbError::Schema(_)), "got {:?}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_open_option_is_invalid() {
    let base = tempfile::tempdir().unwrap();
    let err = Database::open("events", opts(&base), columns(&["x"]), "zap=1;").unwrap_err();
    assert!(matches!(err, DbError::InvalidArgument(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_is_openable_as_its_own_database() {
    let base = tempfile::tempdir().unwrap();

    let seq = {
        let db = Arc::new(
            Database::open("events", opts(&base), columns(&["x"]), "").unwrap(),
        );
        let x = db.column_ref("x").unwrap();
        x.write(b"k", b"v", WriteFlags::empty()).await.unwrap();
        let seq = db.checkpoint().await.unwrap();
        assert!(seq > 0);
        assert!(base.path().join("events").join(seq.to_string()).exists());
        seq
    };

    let db = Arc::new(
        Database::open_at(
            "events",
            seq,
            opts(&base),
            columns(&["x"]),
            "",
            OpenHooks::default(),
        )
        .unwrap(),
    );
    let x = db.column_ref("x").unwrap();
    assert_eq!(x.get_opt(b"k").unwrap().unwrap(), b"v");
    assert_eq!(db.checkpoint_id(), seq);
}

#[tokio::test(flavor = "multi_thread")]
async fn identity_and_files_are_exposed() {
    let base = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open("events", opts(&base), columns(&["x"]), "").unwrap());
    assert!(!db.uuid().is_empty());

    let x = db.column_ref("x").unwrap();
    x.write(b"k", b"v", WriteFlags::empty()).await.unwrap();
    db.flush().unwrap();

    let files = db.files().unwrap();
    assert!(!files.is_empty());
    assert!(files.iter().all(|(_, size)| *size > 0));

    assert!(db.property("x", "rocksdb.stats").unwrap().is_some());
    assert!(db.property_int("x", "rocksdb.num-entries-active-mem-table").unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn fsck_open_runs_repair() {
    let base = tempfile::tempdir().unwrap();

    {
        let db = Arc::new(
            Database::open("events", opts(&base), columns(&["x"]), "").unwrap(),
        );
        let x = db.column_ref("x").unwrap();
        x.write(b"k", b"v", WriteFlags::empty()).await.unwrap();
        db.flush().unwrap();
    }

    let db = Arc::new(
        Database::open("events", opts(&base), columns(&["x"]), "fsck=true;").unwrap(),
    );
    let x = db.column_ref("x").unwrap();
    assert_eq!(x.get_opt(b"k").unwrap().unwrap(), b"v");
}

#[tokio::test(flavor = "multi_thread")]
async fn background_error_gates_writes_until_resume() {
    use loam::db::{ErrorSeverity, ErrorSource};

    let base = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open("events", opts(&base), columns(&["x"]), "").unwrap());
    let x = db.column_ref("x").unwrap();

    db.report_background_error(ErrorSource::Flush, ErrorSeverity::Hard, "enospc".into());
    assert!(db.refusing_writes());
    assert_eq!(db.errors().len(), 1);

    let err = x.write(b"k", b"v", WriteFlags::empty()).await.unwrap_err();
    assert!(matches!(err, DbError::Aborted(_)));

    db.resume().unwrap();
    assert!(!db.refusing_writes());
    x.write(b"k", b"v", WriteFlags::empty()).await.unwrap();
}
