//! Runtime configuration: durability policy and the tunables that govern
//! node growth, B+-tree fanout, and mmap window management.
//!
//! Construction is purely programmatic (a builder over [`Config`]); there is
//! no environment-variable or CLI override layer, since that belongs to the
//! user-facing tooling this crate doesn't provide.

use crate::alloc::mmap::{DEFAULT_NUM_WINDOWS, DEFAULT_WINDOW_ALIGNMENT};
use crate::btree::MAX_LIST_SIZE;

/// How hard a commit works to make its effects crash-durable before
/// returning, trading safety for latency. See `spec.md` §6.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Durability {
    /// Flush and sync every touched window (including the header) before
    /// returning. A successful commit is guaranteed to survive a crash.
    #[default]
    Full,
    /// Flush but do not sync: visible to other processes opening the same
    /// file immediately, but not guaranteed to survive a power loss or
    /// kernel panic.
    MemOnly,
    /// Neither flush nor sync. Visible to this process only until the OS
    /// decides to write pages back; fastest, least safe.
    Unsafe,
}

/// Tunables for one [`crate::file::Db`]. Build with [`Config::builder`]; all
/// fields default to the values the storage engine has always shipped with.
#[derive(Clone, Debug)]
pub struct Config {
    pub durability: Durability,
    pub max_list_size: usize,
    pub window_alignment: u64,
    pub num_map_windows: usize,
    pub create_if_missing: bool,
    pub read_only: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            durability: Durability::Full,
            max_list_size: MAX_LIST_SIZE,
            window_alignment: DEFAULT_WINDOW_ALIGNMENT,
            num_map_windows: DEFAULT_NUM_WINDOWS,
            create_if_missing: false,
            read_only: false,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder(Config::default())
    }
}

/// Builder for [`Config`]. Every setter consumes and returns `self` so calls
/// chain, matching the rest of this crate's options-struct conventions.
#[derive(Clone, Debug)]
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    pub fn durability(mut self, d: Durability) -> Self {
        self.0.durability = d;
        self
    }

    pub fn max_list_size(mut self, n: usize) -> Self {
        self.0.max_list_size = n;
        self
    }

    pub fn window_alignment(mut self, bytes: u64) -> Self {
        self.0.window_alignment = bytes;
        self
    }

    pub fn num_map_windows(mut self, n: usize) -> Self {
        self.0.num_map_windows = n;
        self
    }

    pub fn create_if_missing(mut self, v: bool) -> Self {
        self.0.create_if_missing = v;
        self
    }

    pub fn read_only(mut self, v: bool) -> Self {
        self.0.read_only = v;
        self
    }

    pub fn build(self) -> Config {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let c = Config::default();
        assert_eq!(c.durability, Durability::Full);
        assert_eq!(c.max_list_size, 1000);
        assert_eq!(c.window_alignment, 1 << 20);
        assert_eq!(c.num_map_windows, 16);
        assert!(!c.create_if_missing);
        assert!(!c.read_only);
    }

    #[test]
    fn builder_overrides_selectively() {
        let c = Config::builder()
            .durability(Durability::MemOnly)
            .read_only(true)
            .build();
        assert_eq!(c.durability, Durability::MemOnly);
        assert!(c.read_only);
        assert_eq!(c.max_list_size, 1000);
    }
}
