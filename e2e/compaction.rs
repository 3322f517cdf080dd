//! End-to-end scenario 3: bulk insert, bulk delete, and compaction.

use packdb::config::{Config, Durability};
use packdb::file::Db;
use packdb::group::TableKey;
use packdb::node::Node;

fn tmp_path(name: &str) -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("packdb-e2e-{name}-{}", std::process::id()));
    let _ = std::fs::remove_file(&p);
    p
}

#[test]
fn delete_then_compact_reclaims_logical_size() {
    let path = tmp_path("compaction");
    let cfg = Config::builder()
        .create_if_missing(true)
        .durability(Durability::MemOnly)
        .build();
    let db = Db::open(&path, cfg).unwrap();

    // Many small, individually-committed objects so each leaves its own
    // freelist entry once deleted rather than one contiguous range.
    let mut wt = db.begin_write().unwrap();
    let mut n = Node::new_leaf();
    for i in 0..100_000i64 {
        n.push(i);
    }
    let r = n.commit(wt.alloc_mut()).unwrap();
    wt.add_table("T", r).unwrap();
    wt.commit().unwrap();

    let size_after_insert = db.logical_size();

    let mut wt2 = db.begin_write().unwrap();
    let key = TableKey::from_raw(0);
    let table_ref = wt2.group().resolve(key).unwrap();
    let (group, alloc) = wt2.group_and_alloc_mut();
    let loaded = Node::from_ref(alloc, table_ref);
    let size = loaded.on_disk_size();
    alloc.free(table_ref, size);
    group.set_table_ref(key, packdb::Ref::NULL).unwrap();
    wt2.commit().unwrap();

    let size_after_delete = db.logical_size();
    assert_eq!(
        size_after_delete, size_after_insert,
        "logical_size must not shrink until compaction runs"
    );

    // A third, otherwise-empty commit triggers SlabAlloc::should_compact's
    // free/used > 2 heuristic now that all 100k objects' space is freed.
    let wt3 = db.begin_write().unwrap();
    wt3.commit().unwrap();

    let size_after_compaction = db.logical_size();
    assert!(
        size_after_compaction < size_after_delete,
        "compaction should have reclaimed freed space: before={size_after_delete} after={size_after_compaction}"
    );

    let _ = std::fs::remove_file(&path);
}
