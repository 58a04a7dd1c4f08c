//! End-to-end engine behavior: round trips, snapshots, recovery,
//! compaction, and the bulk-ingest path.

use shardfs_common::{DirId, EngineOptions, NameHash};
use shardfs_engine::storage::{read_file_to_vec, MemStorage, Storage};
use shardfs_engine::{entry_key, entry_range, Engine, TableBuilder};
use std::path::Path;
use std::sync::Arc;

fn small_options() -> EngineOptions {
    EngineOptions {
        write_buffer_size: 64 * 1024,
        block_size: 1024,
        sync_writes: true,
        ..Default::default()
    }
}

fn ukey(dirno: u64, name: &str) -> Vec<u8> {
    entry_key(DirId::new(0, dirno), &NameHash::of(name))
}

#[test]
fn test_put_get_roundtrip() {
    let storage = MemStorage::new();
    let engine = Engine::open(storage, "/db", small_options()).unwrap();

    engine.put(&ukey(1, "a"), b"first").unwrap();
    engine.put(&ukey(1, "b"), b"second").unwrap();
    assert_eq!(engine.get(&ukey(1, "a"), None).unwrap().unwrap(), b"first");
    assert_eq!(engine.get(&ukey(1, "b"), None).unwrap().unwrap(), b"second");
    assert!(engine.get(&ukey(1, "absent"), None).unwrap().is_none());
}

#[test]
fn test_last_write_wins_and_delete() {
    let storage = MemStorage::new();
    let engine = Engine::open(storage, "/db", small_options()).unwrap();

    let k = ukey(1, "f");
    engine.put(&k, b"v1").unwrap();
    engine.put(&k, b"v2").unwrap();
    assert_eq!(engine.get(&k, None).unwrap().unwrap(), b"v2");

    engine.delete(&k).unwrap();
    assert!(engine.get(&k, None).unwrap().is_none());

    engine.put(&k, b"v3").unwrap();
    assert_eq!(engine.get(&k, None).unwrap().unwrap(), b"v3");
}

#[test]
fn test_snapshot_isolation() {
    let storage = MemStorage::new();
    let engine = Engine::open(storage, "/db", small_options()).unwrap();

    let k = ukey(1, "x");
    engine.put(&k, b"old").unwrap();
    let snap = engine.snapshot();
    engine.put(&k, b"new").unwrap();
    engine.delete(&ukey(1, "never-seen")).unwrap();

    assert_eq!(engine.get(&k, Some(&snap)).unwrap().unwrap(), b"old");
    assert_eq!(engine.get(&k, None).unwrap().unwrap(), b"new");
}

#[test]
fn test_snapshot_survives_flush() {
    let storage = MemStorage::new();
    let engine = Engine::open(storage, "/db", small_options()).unwrap();

    let k = ukey(1, "x");
    engine.put(&k, b"old").unwrap();
    let snap = engine.snapshot();
    engine.put(&k, b"new").unwrap();
    engine.flush().unwrap();

    assert_eq!(engine.get(&k, Some(&snap)).unwrap().unwrap(), b"old");
    assert_eq!(engine.get(&k, None).unwrap().unwrap(), b"new");
}

#[test]
fn test_reads_across_flushed_tables() {
    let storage = MemStorage::new();
    let engine = Engine::open(storage, "/db", small_options()).unwrap();

    for i in 0..200 {
        engine
            .put(&ukey(1, &format!("f{i}")), format!("v{i}").as_bytes())
            .unwrap();
    }
    engine.flush().unwrap();
    for i in 200..400 {
        engine
            .put(&ukey(1, &format!("f{i}")), format!("v{i}").as_bytes())
            .unwrap();
    }

    for i in (0..400).step_by(13) {
        let got = engine.get(&ukey(1, &format!("f{i}")), None).unwrap();
        assert_eq!(got.unwrap(), format!("v{i}").as_bytes());
    }
}

#[test]
fn test_scan_directory_range() {
    let storage = MemStorage::new();
    let engine = Engine::open(storage, "/db", small_options()).unwrap();

    for name in ["a", "b", "c"] {
        engine.put(&ukey(7, name), name.as_bytes()).unwrap();
    }
    for name in ["x", "y"] {
        engine.put(&ukey(8, name), name.as_bytes()).unwrap();
    }
    engine.delete(&ukey(7, "b")).unwrap();

    let (begin, end) = entry_range(DirId::new(0, 7));
    let rows = engine.scan(&begin, &end, None).unwrap();
    assert_eq!(rows.len(), 2);
    // Rows come back in hash order; check contents regardless.
    let values: Vec<&[u8]> = rows.iter().map(|(_, v)| v.as_slice()).collect();
    assert!(values.contains(&&b"a"[..]));
    assert!(values.contains(&&b"c"[..]));
}

#[test]
fn test_recovery_after_clean_shutdown() {
    let storage = MemStorage::new();
    {
        let engine = Engine::open(storage.clone(), "/db", small_options()).unwrap();
        for i in 0..100 {
            engine
                .put(&ukey(1, &format!("f{i}")), format!("v{i}").as_bytes())
                .unwrap();
        }
        engine.delete(&ukey(1, "f50")).unwrap();
    }
    let engine = Engine::open(storage, "/db", small_options()).unwrap();
    assert_eq!(
        engine.get(&ukey(1, "f0"), None).unwrap().unwrap(),
        b"v0"
    );
    assert_eq!(
        engine.get(&ukey(1, "f99"), None).unwrap().unwrap(),
        b"v99"
    );
    assert!(engine.get(&ukey(1, "f50"), None).unwrap().is_none());
}

#[test]
fn test_recovery_after_torn_wal() {
    let storage = MemStorage::new();
    let wal_path;
    {
        let engine = Engine::open(storage.clone(), "/db", small_options()).unwrap();
        for i in 0..50 {
            engine
                .put(&ukey(1, &format!("f{i}")), format!("v{i}").as_bytes())
                .unwrap();
        }
        // Find the live WAL before dropping the engine.
        let names = storage.list(Path::new("/db")).unwrap();
        wal_path = names
            .into_iter()
            .filter(|n| n.ends_with(".log"))
            .map(|n| Path::new("/db").join(n))
            .max()
            .unwrap();
    }

    // Tear the WAL tail: the last record's bytes go missing.
    let data = read_file_to_vec(storage.as_ref(), &wal_path).unwrap();
    let mut torn = data.clone();
    torn.truncate(data.len() - 5);
    {
        let mut f = storage.new_writable(&wal_path).unwrap();
        f.append(&torn).unwrap();
    }

    let engine = Engine::open(storage, "/db", small_options()).unwrap();
    // Everything before the torn record survives; the torn row is gone.
    for i in 0..49 {
        assert_eq!(
            engine.get(&ukey(1, &format!("f{i}")), None).unwrap().unwrap(),
            format!("v{i}").as_bytes(),
        );
    }
    assert!(engine.get(&ukey(1, "f49"), None).unwrap().is_none());
}

#[test]
fn test_second_writer_locked_out() {
    let storage = MemStorage::new();
    let _engine = Engine::open(storage.clone(), "/db", small_options()).unwrap();
    assert!(Engine::open(storage, "/db", small_options()).is_err());
}

#[test]
fn test_compaction_preserves_data() {
    let storage = MemStorage::new();
    let options = EngineOptions {
        write_buffer_size: 64 * 1024,
        l0_soft_limit: 2,
        l0_hard_limit: 4,
        ..small_options()
    };
    let engine = Engine::open(storage, "/db", options).unwrap();

    // Several flush cycles to force L0 pressure and a compaction.
    for round in 0..6 {
        for i in 0..300 {
            engine
                .put(
                    &ukey(1, &format!("k{i:04}")),
                    format!("r{round}-{i}").as_bytes(),
                )
                .unwrap();
        }
        engine.flush().unwrap();
    }
    engine.wait_idle().unwrap();

    for i in (0..300).step_by(17) {
        let got = engine.get(&ukey(1, &format!("k{i:04}")), None).unwrap();
        assert_eq!(got.unwrap(), format!("r5-{i}").as_bytes());
    }
}

#[test]
fn test_tombstones_survive_compaction() {
    let storage = MemStorage::new();
    let options = EngineOptions {
        l0_soft_limit: 2,
        l0_hard_limit: 4,
        ..small_options()
    };
    let engine = Engine::open(storage, "/db", options).unwrap();

    engine.put(&ukey(1, "dead"), b"alive").unwrap();
    engine.flush().unwrap();
    engine.delete(&ukey(1, "dead")).unwrap();
    engine.flush().unwrap();
    for round in 0..4 {
        engine
            .put(&ukey(1, &format!("fill{round}")), b"x")
            .unwrap();
        engine.flush().unwrap();
    }
    engine.wait_idle().unwrap();
    assert!(engine.get(&ukey(1, "dead"), None).unwrap().is_none());
}

#[test]
fn test_bulk_ingest() {
    let storage = MemStorage::new();
    let engine = Engine::open(storage.clone(), "/db", small_options()).unwrap();

    // A shipped split table arrives as an external file of internal
    // keys; build one the way the split path does.
    let staged = Path::new("/staging/shipped.ldb");
    {
        use shardfs_engine::key::{internal_key, ValueKind};
        let mut rows: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
            .map(|i| (ukey(9, &format!("m{i}")), format!("mv{i}").into_bytes()))
            .collect();
        rows.sort();
        let mut builder =
            TableBuilder::new(storage.new_writable(staged).unwrap(), small_options());
        for (k, v) in &rows {
            builder
                .add(&internal_key(k, 1, ValueKind::Value), v)
                .unwrap();
        }
        builder.finish().unwrap();
    }

    engine.ingest_table_file(staged).unwrap();
    for i in (0..50).step_by(7) {
        let got = engine.get(&ukey(9, &format!("m{i}")), None).unwrap();
        assert_eq!(got.unwrap(), format!("mv{i}").as_bytes());
    }
    // Newer writes shadow ingested rows.
    engine.put(&ukey(9, "m0"), b"newer").unwrap();
    assert_eq!(engine.get(&ukey(9, "m0"), None).unwrap().unwrap(), b"newer");
}

#[test]
fn test_delete_range_clears_migrated_rows() {
    let storage = MemStorage::new();
    let engine = Engine::open(storage, "/db", small_options()).unwrap();

    for i in 0..30 {
        engine.put(&ukey(3, &format!("e{i}")), b"v").unwrap();
    }
    for i in 0..5 {
        engine.put(&ukey(4, &format!("e{i}")), b"keep").unwrap();
    }

    let (begin, end) = entry_range(DirId::new(0, 3));
    let removed = engine.delete_range(&begin, &end).unwrap();
    assert_eq!(removed, 30);
    assert!(engine.scan(&begin, &end, None).unwrap().is_empty());

    let (b4, e4) = entry_range(DirId::new(0, 4));
    assert_eq!(engine.scan(&b4, &e4, None).unwrap().len(), 5);
}

#[test]
fn test_readonly_replica_tails_primary() {
    use shardfs_engine::ReadonlyEngine;

    let storage = MemStorage::new();
    let engine = Engine::open(storage.clone(), "/db", small_options()).unwrap();
    engine.put(&ukey(1, "seen"), b"v1").unwrap();
    engine.flush().unwrap();

    let replica = ReadonlyEngine::open(storage.clone(), "/db", small_options()).unwrap();
    assert_eq!(replica.get(&ukey(1, "seen")).unwrap().unwrap(), b"v1");
    assert!(replica.put(&ukey(1, "nope"), b"x").is_err());

    // The replica lags until the primary flushes and it reloads.
    engine.put(&ukey(1, "later"), b"v2").unwrap();
    engine.flush().unwrap();
    replica.reload().unwrap();
    assert_eq!(replica.get(&ukey(1, "later")).unwrap().unwrap(), b"v2");
}

#[test]
fn test_iterator_consistent_under_writes() {
    let storage = MemStorage::new();
    let engine = Engine::open(storage, "/db", small_options()).unwrap();

    for i in 0..20 {
        engine.put(&ukey(2, &format!("n{i:02}")), b"before").unwrap();
    }
    let snap = engine.snapshot();
    let (begin, end) = entry_range(DirId::new(0, 2));

    // Concurrent-looking writes after the snapshot.
    for i in 0..20 {
        engine.put(&ukey(2, &format!("n{i:02}")), b"after").unwrap();
    }
    engine.put(&ukey(2, "brand-new"), b"after").unwrap();

    let rows = engine.scan(&begin, &end, Some(&snap)).unwrap();
    assert_eq!(rows.len(), 20);
    assert!(rows.iter().all(|(_, v)| v == b"before"));
}

#[test]
fn test_many_directories_isolated() {
    let storage = MemStorage::new();
    let engine = Arc::new(Engine::open(storage, "/db", small_options()).unwrap());

    for d in 0..10u64 {
        for i in 0..20 {
            engine
                .put(&ukey(d, &format!("f{i}")), d.to_string().as_bytes())
                .unwrap();
        }
    }
    for d in 0..10u64 {
        let (begin, end) = entry_range(DirId::new(0, d));
        let rows = engine.scan(&begin, &end, None).unwrap();
        assert_eq!(rows.len(), 20);
        assert!(rows.iter().all(|(_, v)| v == d.to_string().as_bytes()));
    }
}
