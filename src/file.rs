//! `Db`: the on-disk entry point, and the read/write/snapshot transaction
//! surface built on top of [`crate::group::Group`], [`crate::alloc::SlabAlloc`],
//! and [`crate::group_writer`].
//!
//! A [`Db`] owns the file and the one piece of mutable shared state every
//! transaction reads: the currently active top ref, the byte image it
//! resolves against, and the set of versions live readers are pinned to.
//! Opening, attaching, and refreshing all funnel through here so the opener
//! contract (read-only/read-write, create-or-not) and the single-writer rule
//! have exactly one place to live.
//!
//! Node/array refs are addresses in a *logical* address space that starts
//! right after the fixed file header (see [`DATA_OFFSET`]); `Db` is what
//! translates between the two when talking to the real file, so every other
//! module (`node`, `btree`, `group`, `group_writer`) can treat ref 0 as "just
//! past the header" without knowing the header exists.

use std::collections::{BTreeMap, VecDeque};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lock_api::ArcMutexGuard;
use log::{debug, info};
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::alloc::{Allocator, FreeEntry, ReadOnlyAllocator, SlabAlloc, SnapshotAllocator};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::group_writer::{FileHeader, GroupCommitter, GroupWriter, FILE_HEADER_SIZE};
use crate::ref_::Ref;

/// Byte offset in the real file where logical address space (ref 0) begins.
/// Every [`Ref`] node/column code hands around is relative to this, not to
/// absolute file position.
pub const DATA_OFFSET: u64 = FILE_HEADER_SIZE as u64;

/// How many past commits' freelists [`Db`] keeps around for
/// [`crate::alloc::SlabAlloc::backdate`] to consult. Bounded rather than
/// kept forever — only recent history meaningfully shortens reuse latency,
/// and an unbounded history would itself leak memory across a long-lived
/// writer.
const FREELIST_HISTORY_DEPTH: usize = 8;

/// Snapshot of everything a new transaction needs: the active top ref, the
/// byte image it resolves against, and the version it was committed at.
#[derive(Clone)]
struct Snapshot {
    header: FileHeader,
    version: u64,
    image: Arc<[u8]>,
}

struct SharedState {
    snapshot: Snapshot,
    /// Refcount per pinned reader version; a version is eligible for reuse
    /// by the allocator only once it has no entry here (see
    /// [`Db::oldest_reachable_version`]).
    readers: BTreeMap<u64, u32>,
    freelist_history: VecDeque<(u64, Vec<FreeEntry>)>,
}

struct DbInner {
    path: PathBuf,
    file: Arc<std::fs::File>,
    config: Config,
    /// `Arc`-wrapped so a held lock (`ArcMutexGuard`) can be stored inside
    /// `WriteTransaction` without `WriteTransaction` borrowing from `Db` —
    /// it already owns its own `Db` clone instead.
    writer_lock: Arc<Mutex<()>>,
    state: RwLock<SharedState>,
}

/// An attached database file. Cheap to clone (an `Arc` around the shared
/// state); every [`ReadTransaction`]/[`WriteTransaction`] holds its own
/// clone so transactions can outlive the call that created them.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Opens (or creates) a database file per the opener contract in
    /// `spec.md` §6:
    /// - read-only: refuses to create; the file must already exist and carry
    ///   a valid header.
    /// - read-write, no-create: open existing only.
    /// - read-write, create: a zero-length file is permitted; the first
    ///   commit against it writes an empty group and initializes the header.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();

        if !exists {
            if config.read_only || !config.create_if_missing {
                return Err(Error::InvalidDatabase(format!(
                    "{}: does not exist and create_if_missing is not set",
                    path.display()
                )));
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .create(!exists && config.create_if_missing)
            .open(&path)
            .map_err(|e| Error::io(path.clone(), e))?;

        let bytes = std::fs::read(&path).map_err(|e| Error::io(path.clone(), e))?;
        let snapshot = Snapshot::from_file_bytes(&bytes)?;
        info!(
            "opened {} at version {} ({} bytes)",
            path.display(),
            snapshot.version,
            bytes.len()
        );

        Ok(Db {
            inner: Arc::new(DbInner {
                path,
                file: Arc::new(file),
                config,
                writer_lock: Arc::new(Mutex::new(())),
                state: RwLock::new(SharedState {
                    snapshot,
                    readers: BTreeMap::new(),
                    freelist_history: VecDeque::new(),
                }),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The file's current logical size: bytes reachable through the active
    /// snapshot's top array, not counting the fixed header.
    pub fn logical_size(&self) -> u64 {
        self.inner.state.read().snapshot.image.len() as u64
    }

    pub fn current_version(&self) -> u64 {
        self.inner.state.read().snapshot.version
    }

    /// The oldest version some live reader might still observe; entries
    /// freed at or after this version are not yet safe to reuse. With no
    /// readers pinned, this is just the current version — nothing is
    /// watching, so anything already reclaimed by this snapshot can be
    /// reused right away.
    fn oldest_reachable_version(state: &SharedState) -> u64 {
        state
            .readers
            .keys()
            .next()
            .copied()
            .unwrap_or(state.snapshot.version)
    }

    /// Pins the current snapshot and returns a handle to read through it.
    /// The snapshot never changes under the reader until
    /// [`ReadTransaction::advance_read`] is called.
    pub fn begin_read(&self) -> ReadTransaction {
        let mut state = self.inner.state.write();
        let snapshot = state.snapshot.clone();
        *state.readers.entry(snapshot.version).or_insert(0) += 1;
        drop(state);
        ReadTransaction::new(self.clone(), snapshot)
    }

    /// Begins an exclusive write transaction. Blocks until any other write
    /// transaction on this `Db` has committed or rolled back — only one
    /// writer may be in flight at a time (the external file lock the real
    /// engine uses for cross-process exclusion is out of scope here; this
    /// enforces the in-process half of that contract).
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        if self.inner.config.read_only {
            return Err(Error::LogicError("begin_write on a read-only Db"));
        }
        let guard: ArcMutexGuard<RawMutex, ()> = self.inner.writer_lock.lock_arc();
        let state = self.inner.state.read();
        let snapshot = state.snapshot.clone();
        let oldest = Self::oldest_reachable_version(&state);
        drop(state);

        let ro = ReadOnlyAllocator::new(&snapshot.image);
        let group = if snapshot.header.active_top_ref().is_null() {
            Group::new()
        } else {
            Group::from_ref(&ro, snapshot.header.active_top_ref())
        };
        let free = group.free_entries(&ro);
        drop(ro);

        let file_was_empty = self
            .inner
            .file
            .metadata()
            .map(|m| m.len() == 0)
            .unwrap_or(false);

        let mut alloc = if snapshot.image.is_empty() {
            SlabAlloc::new()
        } else {
            SlabAlloc::from_image(snapshot.image.to_vec(), snapshot.version)
        };
        alloc.restore_free_entries(free);
        alloc.set_oldest_reachable_version(oldest);
        alloc.begin_write();

        Ok(WriteTransaction {
            db: self.clone(),
            _guard: guard,
            header: snapshot.header,
            alloc,
            group,
            file_was_empty,
        })
    }
}

/// A pinned, read-only view of one snapshot.
pub struct ReadTransaction {
    db: Db,
    snapshot: Snapshot,
    alloc: SnapshotAllocator,
    group: Group,
}

impl ReadTransaction {
    fn new(db: Db, snapshot: Snapshot) -> ReadTransaction {
        let alloc = SnapshotAllocator::new(snapshot.image.clone());
        let group = if snapshot.header.active_top_ref().is_null() {
            Group::new()
        } else {
            Group::from_ref(&alloc, snapshot.header.active_top_ref())
        };
        ReadTransaction { db, snapshot, alloc, group }
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn alloc(&self) -> &dyn Allocator {
        &self.alloc
    }

    /// Re-reads the top ref and rebuilds the accessor tree against whatever
    /// is now the active snapshot. Per `spec.md` §4.7, accessors may be
    /// dangling between a writer's commit and the next `advance_read` —
    /// this is the call that makes them safe to dereference again.
    pub fn advance_read(&mut self) {
        let mut state = self.db.inner.state.write();
        let old_version = self.snapshot.version;
        let new_snapshot = state.snapshot.clone();
        if new_snapshot.version != old_version {
            deregister_reader(&mut state, old_version);
            *state.readers.entry(new_snapshot.version).or_insert(0) += 1;
        }
        drop(state);

        self.snapshot = new_snapshot;
        self.alloc = SnapshotAllocator::new(self.snapshot.image.clone());
        self.group = if self.snapshot.header.active_top_ref().is_null() {
            Group::new()
        } else {
            Group::from_ref(&self.alloc, self.snapshot.header.active_top_ref())
        };
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        let mut state = self.db.inner.state.write();
        deregister_reader(&mut state, self.snapshot.version);
    }
}

fn deregister_reader(state: &mut SharedState, version: u64) {
    if let std::collections::btree_map::Entry::Occupied(mut e) = state.readers.entry(version) {
        *e.get_mut() -= 1;
        if *e.get() == 0 {
            e.remove();
        }
    }
}

/// The single in-flight write transaction. Mutating a table/column through
/// [`WriteTransaction::alloc_mut`] and [`WriteTransaction::group_mut`]
/// copy-on-writes against the allocator exactly as described in `spec.md`
/// §4.1; nothing is visible to readers until [`WriteTransaction::commit`]
/// runs the full write/flush/flip pipeline.
pub struct WriteTransaction {
    db: Db,
    _guard: ArcMutexGuard<RawMutex, ()>,
    header: FileHeader,
    alloc: SlabAlloc,
    group: Group,
    /// Whether the underlying file had zero length when this transaction
    /// began — the opener contract permits creating a zero-length file, and
    /// the first commit against it is responsible for writing the fixed
    /// header before anything else.
    file_was_empty: bool,
}

impl WriteTransaction {
    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut Group {
        &mut self.group
    }

    pub fn alloc_mut(&mut self) -> &mut SlabAlloc {
        &mut self.alloc
    }

    /// Splits the borrow so callers can mutate the table directory and the
    /// allocator it allocates through in one call, without two separate
    /// `&mut self` method calls fighting the borrow checker over the same
    /// receiver.
    pub fn group_and_alloc_mut(&mut self) -> (&mut Group, &mut SlabAlloc) {
        (&mut self.group, &mut self.alloc)
    }

    /// Adds a table, threading this transaction's allocator through.
    /// Equivalent to `self.group_and_alloc_mut()` followed by
    /// `Group::add_table`, spelled out for the common case.
    pub fn add_table(&mut self, name: &str, table_ref: Ref) -> Result<crate::group::TableKey> {
        self.group.add_table(&mut self.alloc, name, table_ref)
    }

    /// Abandons every mutation made since [`Db::begin_write`]. The on-disk
    /// state is untouched; this is just dropping the in-memory working copy.
    pub fn rollback(self) {
        debug!("rollback: discarding {} dirtied bytes", self.alloc.logical_size());
    }

    /// Runs the full commit pipeline (`spec.md` §4.5/§4.7):
    /// freelist backdating and recreation, a second top-array commit now
    /// that the freelist refs are known, flushing the dirtied byte range to
    /// disk, and finally the two-slot atomic flip. Returns the new version.
    pub fn commit(mut self) -> Result<u64> {
        self.commit_with_durability(self.db.inner.config.durability)
    }

    fn commit_with_durability(mut self, durability: crate::config::Durability) -> Result<u64> {
        let history: Vec<(u64, Vec<FreeEntry>)> =
            self.db.inner.state.read().freelist_history.iter().cloned().collect();

        let mut writer = GroupWriter::new(&mut self.alloc);
        for (v, f) in history {
            writer.record_history(v, f);
        }
        let new_top_ref = writer.write_group(&mut self.group)?;

        // `write_group` leaves the allocator's freelist holding exactly the
        // coalesced, backdated entries it just serialized — record that as
        // this version's history entry for the next commit's backdating
        // pass to consult.
        let committed_free = {
            let free = self.alloc.take_free_entries();
            self.alloc.restore_free_entries(free.clone());
            free
        };

        let new_logical_size = self.alloc.logical_size();
        let required_len = DATA_OFFSET + new_logical_size;

        let mut committer = GroupCommitter::new(self.db.inner.file.clone(), required_len, durability);

        if self.db.inner.file.metadata().map(|m| m.len()).unwrap_or(0) < required_len {
            self.db
                .inner
                .file
                .set_len(required_len)
                .map_err(|e| Error::io(self.db.inner.path.clone(), e))?;
        }

        if self.file_was_empty {
            let fresh = FileHeader::new();
            committer.flush_range(0, &fresh.to_bytes())?;
            self.header = fresh;
        }

        if let Some(floor) = self.alloc.dirty_floor() {
            let bytes = &self.alloc.image()[floor as usize..];
            committer.flush_range(DATA_OFFSET + floor, bytes)?;
        }

        committer.commit(&mut self.header, new_top_ref)?;

        let new_version = self.group.current_version();
        let new_image: Arc<[u8]> = Arc::from(self.alloc.image());
        info!(
            "commit: version={new_version} top_ref={:#x} logical_size={new_logical_size}",
            new_top_ref.get()
        );

        let mut state = self.db.inner.state.write();
        state.snapshot = Snapshot {
            header: self.header,
            version: new_version,
            image: new_image,
        };
        state.freelist_history.push_back((new_version, committed_free));
        while state.freelist_history.len() > FREELIST_HISTORY_DEPTH {
            state.freelist_history.pop_front();
        }
        drop(state);

        Ok(new_version)
    }
}

impl Snapshot {
    fn from_file_bytes(bytes: &[u8]) -> Result<Snapshot> {
        if bytes.is_empty() {
            return Ok(Snapshot {
                header: FileHeader::new(),
                version: 0,
                image: Arc::from(Vec::new()),
            });
        }
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(Error::InvalidDatabase("file shorter than the fixed header".into()));
        }
        let header = FileHeader::from_bytes(&bytes[..FILE_HEADER_SIZE])?;
        let data = &bytes[FILE_HEADER_SIZE..];
        let image = Arc::from(data.to_vec().into_boxed_slice());

        let version = if header.active_top_ref().is_null() {
            0
        } else {
            let ro = ReadOnlyAllocator::new(data);
            Group::from_ref(&ro, header.active_top_ref()).current_version()
        };

        Ok(Snapshot { header, version, image })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BpTreeColumn;
    use crate::ref_::Ref as R;

    fn tmp_path() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("packdb-test-{}-{}", std::process::id(), rand_suffix()));
        p
    }

    fn rand_suffix() -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = std::collections::hash_map::DefaultHasher::new();
        std::time::Instant::now().hash(&mut h);
        h.finish()
    }

    #[test]
    fn open_nonexistent_without_create_fails() {
        let p = tmp_path();
        let err = Db::open(&p, Config::default());
        assert!(err.is_err());
    }

    #[test]
    fn create_then_reopen_round_trips_a_table() {
        let p = tmp_path();
        let cfg = Config::builder().create_if_missing(true).build();
        {
            let db = Db::open(&p, cfg.clone()).unwrap();
            let mut wt = db.begin_write().unwrap();
            let mut col = BpTreeColumn::new();
            for v in [1i64, 2, 3, 1_000_000_000] {
                col.push(wt.alloc_mut(), v).unwrap();
            }
            let col_ref = col.ref_().unwrap();
            wt.add_table("t", col_ref).unwrap();
            wt.commit().unwrap();
        }
        {
            let db = Db::open(&p, Config::builder().read_only(true).build()).unwrap();
            let rt = db.begin_read();
            let key = crate::group::TableKey::from_raw(0);
            let col_ref = rt.group().resolve(key).unwrap();
            let col = BpTreeColumn::from_ref(rt.alloc(), col_ref);
            assert_eq!(col.len(), 4);
            assert_eq!(col.get(rt.alloc(), 3), 1_000_000_000);
        }
        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn reader_pins_a_stale_snapshot_across_a_writer_commit() {
        let p = tmp_path();
        let cfg = Config::builder().create_if_missing(true).build();
        let db = Db::open(&p, cfg).unwrap();

        let mut wt = db.begin_write().unwrap();
        let mut col = BpTreeColumn::new();
        col.push(wt.alloc_mut(), 42).unwrap();
        let r = col.ref_().unwrap();
        wt.add_table("t", r).unwrap();
        wt.commit().unwrap();

        let mut rt = db.begin_read();
        let key = crate::group::TableKey::from_raw(0);
        let before = BpTreeColumn::from_ref(rt.alloc(), rt.group().resolve(key).unwrap()).get(rt.alloc(), 0);
        assert_eq!(before, 42);

        let mut wt2 = db.begin_write().unwrap();
        let col_ref = wt2.group().resolve(key).unwrap();
        let mut col2 = BpTreeColumn::from_ref(wt2.alloc_mut(), col_ref);
        col2.push(wt2.alloc_mut(), 99).unwrap();
        let new_ref = col2.ref_().unwrap();
        wt2.group_mut().set_table_ref(key, new_ref).unwrap();
        wt2.commit().unwrap();

        let still_before = BpTreeColumn::from_ref(rt.alloc(), rt.group().resolve(key).unwrap()).get(rt.alloc(), 0);
        assert_eq!(still_before, 42, "reader must not observe the writer's commit until advance_read");

        rt.advance_read();
        let col_ref = rt.group().resolve(key).unwrap();
        let col = BpTreeColumn::from_ref(rt.alloc(), col_ref);
        assert_eq!(col.len(), 2);
        assert_eq!(col.get(rt.alloc(), 1), 99);

        let _ = std::fs::remove_file(&p);
    }

    #[test]
    fn rollback_leaves_file_unchanged() {
        let p = tmp_path();
        let cfg = Config::builder().create_if_missing(true).build();
        let db = Db::open(&p, cfg).unwrap();

        let mut wt = db.begin_write().unwrap();
        wt.add_table("t", R(8)).unwrap();
        wt.commit().unwrap();
        let size_before = std::fs::metadata(&p).unwrap().len();

        let mut wt2 = db.begin_write().unwrap();
        wt2.add_table("u", R(16)).unwrap();
        wt2.rollback();

        let size_after = std::fs::metadata(&p).unwrap().len();
        assert_eq!(size_before, size_after);

        let rt = db.begin_read();
        assert_eq!(rt.group().table_count(), 1);

        let _ = std::fs::remove_file(&p);
    }
}
