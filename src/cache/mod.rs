//! Dependency caches.
//!
//! Cache bindings are restored before a run's steps and saved after them.
//! Keys are content-derived so an unchanged lockfile reuses the previous
//! blob and any change to it produces a fresh one.

mod archive;
mod key;
mod session;
mod store;

pub use archive::{pack_dir, unpack_into};
pub use key::{compute_key, hash_files, storage_name};
pub use session::{
    resolve_target, restore_cache, save_cache, CacheReport, CacheSession, CacheState,
    ReadOnlyStore, RestoredCache, SaveOutcome,
};
pub use store::{age, CacheEntry, CacheStore, FsCacheStore};
