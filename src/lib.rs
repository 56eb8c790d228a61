#![doc(html_root_url = "https://docs.rs/syncmap/0.1.0/syncmap/")]
#![warn(missing_docs)]

//! A concurrent map tuned for read-mostly workloads.
//!
//! The map keeps two internal tables. A read-only snapshot is consulted without taking any lock,
//! while a mutex-protected *dirty* table accumulates newly added keys. Lookups that have to fall
//! back to the dirty table are counted and once they paid for it, the dirty table becomes the new
//! snapshot. Therefore the map shines when:
//!
//! * Keys are written once and read many times (eg. caches that only grow).
//! * Multiple threads work on disjoint sets of keys.
//!
//! For other workloads a plain `Mutex<HashMap>` (or a sharded variant) is likely to be faster.
//!
//! Updating the value of a key that is already in the snapshot is lock-free too. Only insertion
//! of new keys (and lookups of keys not yet promoted) go through the lock.
//!
//! There are two flavours of the map:
//!
//! * [`SyncMap`] stores the values in [`Arc`][std::sync::Arc]s and hands out clones of these.
//! * [`CloneSyncMap`] stores the values directly and hands out their clones.
//!
//! # Examples
//!
//! ```rust
//! use syncmap::{LoadOrStore, SyncMap};
//! use crossbeam_utils::thread;
//!
//! let map = SyncMap::new();
//!
//! thread::scope(|s| {
//!     for t in 0..4 {
//!         let map = &map;
//!         s.spawn(move |_| {
//!             map.insert(t, format!("thread {}", t));
//!         });
//!     }
//! }).unwrap();
//!
//! assert_eq!("thread 2", *map.get(&2).unwrap());
//!
//! match map.get_or_insert(2, "late".to_owned()) {
//!     LoadOrStore::Loaded(value) => assert_eq!("thread 2", *value),
//!     LoadOrStore::Stored(_) => unreachable!(),
//! }
//!
//! let mut seen = 0;
//! map.range(|_, _| {
//!     seen += 1;
//!     true
//! });
//! assert_eq!(4, seen);
//! ```
//!
//! # Features
//!
//! The `rayon` feature adds parallel extension and collection into the maps.

pub mod clonemap;
mod load_or_store;
pub mod map;
pub mod raw;

pub use self::clonemap::CloneSyncMap;
pub use self::load_or_store::LoadOrStore;
pub use self::map::SyncMap;
