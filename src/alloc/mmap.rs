//! File-backed memory windows used when flushing a commit to disk.
//!
//! Rather than map the whole file for the lifetime of the process, writes
//! go through a small LRU-bounded set of [`MapWindow`]s, each covering a
//! 1 MiB-aligned (or, for very large files, power-of-two-aligned) slice.
//! This bounds address-space and page-table pressure on 32-bit targets and
//! keeps `mmap`/`munmap` calls infrequent on 64-bit ones.

use std::fs::File;
use std::sync::Arc;

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Default window alignment: 1 MiB, matching the smallest alignment the
/// allocator ever hands out a free-space section at.
pub const DEFAULT_WINDOW_ALIGNMENT: u64 = 1 << 20;

/// Default number of windows kept mapped at once.
pub const DEFAULT_NUM_WINDOWS: usize = 16;

/// One mapped, 8-byte-aligned slice of the file.
pub struct MapWindow {
    base: u64,
    len: u64,
    mmap: MmapMut,
    last_used: u64,
}

impl MapWindow {
    fn new(file: &File, base: u64, len: u64) -> Result<MapWindow> {
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .offset(base)
                .len(len as usize)
                .map_mut(file)
                .map_err(|e| Error::io("<db-file>", e))?
        };
        Ok(MapWindow { base, len, mmap, last_used: 0 })
    }

    fn matches(&self, pos: u64, size: u64) -> bool {
        pos >= self.base && pos + size <= self.base + self.len
    }

    /// True if `pos` falls within this window's base but the requested
    /// range runs past its current end — the window can be grown in place
    /// (same base, bigger length) instead of evicting and remapping from
    /// scratch, avoiding window churn for sequentially growing writes.
    fn extends_to_match(&self, pos: u64, size: u64) -> bool {
        pos >= self.base && pos < self.base + self.len && pos + size > self.base + self.len
    }

    fn grow(&mut self, file: &File, new_len: u64) -> Result<()> {
        self.mmap.flush().map_err(|e| Error::io("<db-file>", e))?;
        *self = MapWindow::new(file, self.base, new_len)?;
        Ok(())
    }

    /// Mutable view of `[pos, pos+len)` relative to the file, which must
    /// fall entirely within this window.
    pub fn slice_mut(&mut self, pos: u64, len: u64) -> &mut [u8] {
        let off = (pos - self.base) as usize;
        &mut self.mmap[off..off + len as usize]
    }

    pub fn slice(&self, pos: u64, len: u64) -> &[u8] {
        let off = (pos - self.base) as usize;
        &self.mmap[off..off + len as usize]
    }

    /// Read barrier: a no-op absent encryption. Present so an encrypting
    /// backend can be dropped in without touching call sites.
    #[inline]
    pub fn read_barrier(&self) {}

    /// Write barrier: a no-op absent encryption.
    #[inline]
    pub fn write_barrier(&self) {}

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().map_err(|e| Error::io("<db-file>", e))
    }

    pub fn sync(&self) -> Result<()> {
        // memmap2's flush() already calls msync(MS_SYNC) on Unix; kept as a
        // distinct method so callers can tell durable syncs from opportunistic
        // flushes in logs.
        self.mmap.flush().map_err(|e| Error::io("<db-file>", e))
    }
}

/// Picks the window alignment for a file of `file_size` bytes: 1 MiB on
/// 32-bit targets (address space is precious), or the smallest power of two
/// at least 1 MiB and at least `file_size` on 64-bit ones (bigger files get
/// fewer, larger windows).
pub fn choose_alignment(file_size: u64) -> u64 {
    if cfg!(target_pointer_width = "32") {
        return DEFAULT_WINDOW_ALIGNMENT;
    }
    let mut align = DEFAULT_WINDOW_ALIGNMENT;
    while align < file_size {
        align *= 2;
    }
    align
}

/// An LRU-bounded cache of [`MapWindow`]s over one file.
pub struct WriteWindowMgr {
    file: Arc<File>,
    alignment: u64,
    num_windows: usize,
    windows: Vec<MapWindow>,
    clock: u64,
}

impl WriteWindowMgr {
    pub fn new(file: Arc<File>, file_size: u64, num_windows: usize) -> WriteWindowMgr {
        WriteWindowMgr {
            file,
            alignment: choose_alignment(file_size),
            num_windows,
            windows: Vec::new(),
            clock: 0,
        }
    }

    fn window_bounds(&self, pos: u64, size: u64) -> (u64, u64) {
        let base = (pos / self.alignment) * self.alignment;
        let min_len = (pos + size) - base;
        let len = ((min_len + self.alignment - 1) / self.alignment) * self.alignment;
        (base, len)
    }

    /// Returns the (possibly newly mapped) window covering `[pos, pos+size)`,
    /// moving it to the front of the LRU order. Evicts and flushes the
    /// least-recently-used window if the cache is at capacity and no
    /// existing window can serve the request.
    pub fn get_window(&mut self, pos: u64, size: u64) -> Result<&mut MapWindow> {
        self.clock += 1;
        let now = self.clock;

        if let Some(ix) = self.windows.iter().position(|w| w.matches(pos, size)) {
            self.windows[ix].last_used = now;
            return Ok(&mut self.windows[ix]);
        }
        if let Some(ix) = self.windows.iter().position(|w| w.extends_to_match(pos, size)) {
            let (_, new_len) = self.window_bounds(pos, size);
            self.windows[ix].grow(&self.file, new_len)?;
            self.windows[ix].last_used = now;
            return Ok(&mut self.windows[ix]);
        }

        if self.windows.len() >= self.num_windows {
            let lru_ix = self
                .windows
                .iter()
                .enumerate()
                .min_by_key(|(_, w)| w.last_used)
                .map(|(i, _)| i)
                .expect("num_windows > 0");
            self.windows[lru_ix].flush()?;
            self.windows.remove(lru_ix);
        }

        let (base, len) = self.window_bounds(pos, size);
        let mut w = MapWindow::new(&self.file, base, len)?;
        w.last_used = now;
        self.windows.push(w);
        Ok(self.windows.last_mut().unwrap())
    }

    pub fn flush_all(&mut self) -> Result<()> {
        for w in &self.windows {
            w.flush()?;
        }
        Ok(())
    }

    pub fn sync_all(&mut self) -> Result<()> {
        for w in &self.windows {
            w.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(size: u64) -> Arc<File> {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&vec![0u8; size as usize]).unwrap();
        Arc::new(f)
    }

    #[test]
    fn window_covers_requested_range() {
        let file = temp_file(4 << 20);
        let mut mgr = WriteWindowMgr::new(file, 4 << 20, 4);
        let w = mgr.get_window(10, 100).unwrap();
        w.slice_mut(10, 100)[0] = 0xAB;
        assert_eq!(w.slice(10, 100)[0], 0xAB);
    }

    #[test]
    fn lru_eviction_bounds_window_count() {
        let file = temp_file(64 << 20);
        let mut mgr = WriteWindowMgr::new(file, 64 << 20, 2);
        for i in 0..5u64 {
            let pos = i * (8 << 20);
            mgr.get_window(pos, 8).unwrap();
        }
        assert!(mgr.windows.len() <= 2);
    }

    #[test]
    fn same_window_reused_for_nearby_writes() {
        let file = temp_file(4 << 20);
        let mut mgr = WriteWindowMgr::new(file, 4 << 20, 4);
        mgr.get_window(10, 8).unwrap();
        mgr.get_window(20, 8).unwrap();
        assert_eq!(mgr.windows.len(), 1);
    }
}
