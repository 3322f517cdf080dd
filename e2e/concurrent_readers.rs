//! End-to-end scenario 5: a reader pinned to one snapshot sees byte-identical
//! results across many subsequent writer commits, until it explicitly
//! advances.

use packdb::btree::BpTreeColumn;
use packdb::config::{Config, Durability};
use packdb::file::Db;

fn tmp_path(name: &str) -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("packdb-e2e-{name}-{}", std::process::id()));
    let _ = std::fs::remove_file(&p);
    p
}

#[test]
fn pinned_reader_is_stable_across_ten_writer_commits() {
    let path = tmp_path("concurrent-readers");
    let cfg = Config::builder()
        .create_if_missing(true)
        .durability(Durability::MemOnly)
        .build();
    let db = Db::open(&path, cfg).unwrap();

    let mut wt = db.begin_write().unwrap();
    let mut col = BpTreeColumn::new();
    for v in [10i64, 20, 30] {
        col.push(wt.alloc_mut(), v).unwrap();
    }
    let r = col.ref_().unwrap();
    let key = wt.add_table("T", r).unwrap();
    wt.commit().unwrap();

    let reader = db.begin_read();
    let snapshot_values: Vec<i64> = {
        let c = BpTreeColumn::from_ref(reader.alloc(), reader.group().resolve(key).unwrap());
        (0..c.len()).map(|i| c.get(reader.alloc(), i)).collect()
    };
    assert_eq!(snapshot_values, vec![10, 20, 30]);
    let pinned_version = reader.version();

    for round in 0..10 {
        let mut w = db.begin_write().unwrap();
        let col_ref = w.group().resolve(key).unwrap();
        let mut c = BpTreeColumn::from_ref(w.alloc_mut(), col_ref);
        c.push(w.alloc_mut(), round as i64).unwrap();
        let new_ref = c.ref_().unwrap();
        w.group_mut().set_table_ref(key, new_ref).unwrap();
        w.commit().unwrap();

        // The reader must still observe exactly the original three values
        // after every single commit, never a torn or partial view.
        let still = BpTreeColumn::from_ref(reader.alloc(), reader.group().resolve(key).unwrap());
        let values: Vec<i64> = (0..still.len()).map(|i| still.get(reader.alloc(), i)).collect();
        assert_eq!(values, snapshot_values, "reader drifted after commit round {round}");
        assert_eq!(reader.version(), pinned_version);
    }

    assert_eq!(db.current_version(), pinned_version + 10);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn advance_read_observes_all_accumulated_writes_at_once() {
    let path = tmp_path("concurrent-readers-advance");
    let cfg = Config::builder()
        .create_if_missing(true)
        .durability(Durability::MemOnly)
        .build();
    let db = Db::open(&path, cfg).unwrap();

    let mut wt = db.begin_write().unwrap();
    let mut col = BpTreeColumn::new();
    col.push(wt.alloc_mut(), 0).unwrap();
    let r = col.ref_().unwrap();
    let key = wt.add_table("T", r).unwrap();
    wt.commit().unwrap();

    let mut reader = db.begin_read();

    for i in 1..=5i64 {
        let mut w = db.begin_write().unwrap();
        let col_ref = w.group().resolve(key).unwrap();
        let mut c = BpTreeColumn::from_ref(w.alloc_mut(), col_ref);
        c.push(w.alloc_mut(), i).unwrap();
        let new_ref = c.ref_().unwrap();
        w.group_mut().set_table_ref(key, new_ref).unwrap();
        w.commit().unwrap();
    }

    let stale = BpTreeColumn::from_ref(reader.alloc(), reader.group().resolve(key).unwrap());
    assert_eq!(stale.len(), 1, "reader must not see any of the 5 commits before advancing");

    reader.advance_read();
    let fresh = BpTreeColumn::from_ref(reader.alloc(), reader.group().resolve(key).unwrap());
    assert_eq!(fresh.len(), 6);
    let values: Vec<i64> = (0..fresh.len()).map(|i| fresh.get(reader.alloc(), i)).collect();
    assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);

    let _ = std::fs::remove_file(&path);
}
