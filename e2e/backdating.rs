//! End-to-end scenario 4: freed space must carry the version it was
//! actually released at, and must not be reused by a later commit while
//! any pinned reader might still be observing it.

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

fn free_current_table(wt: &mut packdb::file::WriteTransaction, key: TableKey) {
    let table_ref = wt.group().resolve(key).unwrap();
    let (group, alloc) = wt.group_and_alloc_mut();
    let loaded = Node::from_ref(alloc, table_ref);
    let size = loaded.on_disk_size();
    alloc.free(table_ref, size);
    group.set_table_ref(key, packdb::Ref::NULL).unwrap();
}

#[test]
fn freed_space_is_not_reused_while_an_older_snapshot_is_pinned() {
    let path = tmp_path("backdating");
    let cfg = Config::builder()
        .create_if_missing(true)
        .durability(Durability::MemOnly)
        .build();
    let db = Db::open(&path, cfg).unwrap();

    // v1: a sizeable array, so its freed region is big enough that reuse vs.
    // extension is visible in logical_size.
    let mut wt = db.begin_write().unwrap();
    let mut n = Node::new_leaf();
    for i in 0..20_000i64 {
        n.push(i);
    }
    let r = n.commit(wt.alloc_mut()).unwrap();
    let key = wt.add_table("T", r).unwrap();
    wt.commit().unwrap();

    // Pin a reader at v1 before the region is freed.
    let reader = db.begin_read();
    assert_eq!(reader.version(), db.current_version());

    // v2: free that array. The reader above is still looking at v1, so the
    // freed bytes must not be handed back out yet.
    let mut wt2 = db.begin_write().unwrap();
    free_current_table(&mut wt2, key);
    wt2.commit().unwrap();

    let size_after_free = db.logical_size();

    // v3: allocate a same-sized array again while the v1 reader is still
    // alive. If the freed region were (incorrectly) reused, logical_size
    // would stay flat; since a v1 reader is pinned, it must grow instead.
    let mut wt3 = db.begin_write().unwrap();
    let mut n2 = Node::new_leaf();
    for i in 0..20_000i64 {
        n2.push(i);
    }
    let r2 = n2.commit(wt3.alloc_mut()).unwrap();
    wt3.add_table("U", r2).unwrap();
    wt3.commit().unwrap();

    assert!(
        db.logical_size() > size_after_free,
        "space freed at a version still visible to a pinned reader must not be reused"
    );

    drop(reader);

    // v4: once the v1 reader is gone, a request the same size as the v2
    // free entry should be satisfiable from the freelist instead of
    // extending the file further.
    let size_before_reuse = db.logical_size();
    let mut wt4 = db.begin_write().unwrap();
    let mut n3 = Node::new_leaf();
    for i in 0..20_000i64 {
        n3.push(i);
    }
    let r3 = n3.commit(wt4.alloc_mut()).unwrap();
    wt4.add_table("V", r3).unwrap();
    wt4.commit().unwrap();

    // The freelist entry is now reusable, so this allocation grows the file
    // by far less than a full fresh 20k-element array would cost.
    let growth = db.logical_size() - size_before_reuse;
    let fresh_array_cost = n3_cost();
    assert!(
        growth < fresh_array_cost,
        "growth {growth} should be smaller than a brand new allocation once the old reader released its pin"
    );

    let _ = std::fs::remove_file(&path);
}

fn n3_cost() -> u64 {
    let mut n = Node::new_leaf();
    for i in 0..20_000i64 {
        n.push(i);
    }
    n.on_disk_size() as u64
}
