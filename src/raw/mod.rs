//! The core implementation of the read-mostly concurrent map.
//!
//! This module contains the [`Raw`][crate::raw::Raw] type, which is the engine of all the maps in
//! this crate. This is exposed to allow wrapping it into further APIs, but is probably not the
//! best thing for general use.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{Atomic, Guard, Owned};
use log::trace;
use parking_lot::Mutex;

pub mod debug;
pub(crate) mod entry;
pub mod iterator;

use self::entry::{Entry, Pending};
use crate::load_or_store::LoadOrStore;

const AMENDED_WITHOUT_DIRTY: &str = "BUG: Amended snapshot without a dirty map";

type Mapping<K, V, S> = HashMap<K, Arc<Entry<V>>, S>;

/// The read snapshot.
///
/// Once published, the mapping is never modified, only replaced by a whole new snapshot. The
/// entries inside can still change their values.
struct ReadOnly<K, V, S> {
    map: Arc<Mapping<K, V, S>>,
    /// The dirty map contains some keys that are not in this mapping.
    amended: bool,
}

/// The lock-protected part.
struct Dirty<K, V, S> {
    /// Superset of all the non-expunged keys in the current snapshot, plus the new ones.
    ///
    /// Present exactly when the current snapshot is amended.
    map: Option<Mapping<K, V, S>>,
    /// Lookups that had to go to the dirty map since the last promotion.
    misses: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Promotion {
    Misses,
    Iteration,
}

/// Where an entry was found.
enum Located<'g, V> {
    Read(&'g Entry<V>),
    /// Found in the dirty map, we hold our own reference because we don't hold the lock.
    Dirty(Arc<Entry<V>>),
}

impl<V> Deref for Located<'_, V> {
    type Target = Entry<V>;
    fn deref(&self) -> &Entry<V> {
        match self {
            Located::Read(entry) => entry,
            Located::Dirty(entry) => entry,
        }
    }
}

/// What to do with an entry found only in the dirty map.
#[derive(Copy, Clone, Eq, PartialEq)]
enum Locate {
    Keep,
    Take,
}

/// The raw read-mostly map.
///
/// This provides the low level data structure. It does provide the concurrent operations, but
/// not a user friendly interface. It is designed to separate the single implementation of the
/// core algorithm and provide a way to wrap it into different interfaces for different use cases.
///
/// As a general rule, this data structure takes the [`crossbeam_epoch`] [`Guard`] and returns
/// borrowed data whenever appropriate. Note that even methods that would return owned values in
/// single-threaded case (eg. [`swap`][Raw::swap] and [`get_and_remove`][Raw::get_and_remove])
/// return borrowed values. This is because in concurrent situation some other thread might still
/// be accessing them. They are scheduled for destruction once the epoch ends.
///
/// # Internals
///
/// There are two mappings from keys to shared [`Entry`] cells. The read snapshot is published
/// through an atomic pointer and looked into without any locking. The dirty map is behind a mutex
/// and receives all the new keys. Once there were as many lookups that had to fall through to the
/// dirty map as the dirty map has entries, the dirty map is promoted to be the new snapshot.
///
/// Deleting a key present in the snapshot just empties its entry. When the dirty map is created
/// from the snapshot, the empty entries are marked as expunged and left out. An expunged entry
/// can be filled again only under the lock, together with putting it back into the dirty map.
pub struct Raw<K, V, S> {
    hash_builder: S,
    read: Atomic<ReadOnly<K, V, S>>,
    dirty: Mutex<Dirty<K, V, S>>,
}

impl<K, V, S> Raw<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    /// Constructs an empty instance from the given hasher.
    pub fn with_hasher(hash_builder: S) -> Self {
        let read = ReadOnly {
            map: Arc::new(HashMap::with_hasher(hash_builder.clone())),
            amended: false,
        };
        Self {
            hash_builder,
            read: Atomic::new(read),
            dirty: Mutex::new(Dirty {
                map: None,
                misses: 0,
            }),
        }
    }

    /// Access to the hasher the map was created with.
    pub fn hash_builder(&self) -> &S {
        &self.hash_builder
    }

    fn load_read<'g>(&self, pin: &'g Guard) -> &'g ReadOnly<K, V, S> {
        // Acquire: the snapshot was published with Release by whoever created it.
        let read = self.read.load(Ordering::Acquire, pin);
        unsafe { read.as_ref() }.expect("BUG: The read snapshot is never null")
    }

    /// Publishes a new snapshot. Must be called with the lock held.
    fn replace_read(&self, read: ReadOnly<K, V, S>, pin: &Guard) {
        let old = self.read.swap(Owned::new(read), Ordering::AcqRel, pin);
        // Readers may still look into the old one, so it waits for them.
        unsafe { pin.defer_destroy(old) };
    }

    /// Creates the dirty map out of the current snapshot, if there's none.
    fn materialize(&self, dirty: &mut Dirty<K, V, S>, read: &ReadOnly<K, V, S>, pin: &Guard) {
        if dirty.map.is_some() {
            return;
        }

        let mut map = HashMap::with_capacity_and_hasher(read.map.len(), self.hash_builder.clone());
        for (key, entry) in read.map.iter() {
            if !entry.try_expunge_locked(pin) {
                map.insert(key.clone(), Arc::clone(entry));
            }
        }
        trace!(
            "Materialized dirty map with {} of {} snapshot entries",
            map.len(),
            read.map.len()
        );
        dirty.map = Some(map);
    }

    /// Turns the dirty map into the new read snapshot.
    fn promote(&self, dirty: &mut Dirty<K, V, S>, reason: Promotion, pin: &Guard) {
        let map = dirty.map.take().expect(AMENDED_WITHOUT_DIRTY);
        trace!(
            "Promoting dirty map with {} entries after {} misses ({:?})",
            map.len(),
            dirty.misses,
            reason
        );
        dirty.misses = 0;
        self.replace_read(
            ReadOnly {
                map: Arc::new(map),
                amended: false,
            },
            pin,
        );
    }

    /// Records a lookup that had to go to the dirty map.
    ///
    /// Once the misses have paid for copying the whole dirty map, it gets promoted.
    fn miss(&self, dirty: &mut Dirty<K, V, S>, pin: &Guard) {
        dirty.misses += 1;
        let len = dirty.map.as_ref().map_or(0, HashMap::len);
        if dirty.misses >= len {
            self.promote(dirty, Promotion::Misses, pin);
        }
    }

    /// Finds the entry for a key, falling back to the dirty map if the snapshot doesn't have it.
    fn locate<'g, Q>(&self, key: &Q, mode: Locate, pin: &'g Guard) -> Option<Located<'g, V>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let read = self.load_read(pin);
        if let Some(entry) = read.map.get(key) {
            return Some(Located::Read(entry));
        }
        if !read.amended {
            return None;
        }

        let mut guard = self.dirty.lock();
        let dirty = &mut *guard;
        // Someone could have promoted while we were waiting for the lock.
        let read = self.load_read(pin);
        if let Some(entry) = read.map.get(key) {
            return Some(Located::Read(entry));
        }
        if !read.amended {
            return None;
        }
        let map = dirty.map.as_mut().expect(AMENDED_WITHOUT_DIRTY);
        let found = match mode {
            Locate::Keep => map.get(key).cloned(),
            Locate::Take => map.remove(key),
        };
        // Counted no matter if it was found. The key will take the slow path until the next
        // promotion either way.
        self.miss(dirty, pin);
        found.map(Located::Dirty)
    }

    /// Looks up a value.
    pub fn get<'r, 's, 'p, Q>(&'s self, key: &Q, pin: &'p Guard) -> Option<&'r V>
    where
        's: 'r,
        'p: 'r,
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        self.locate(key, Locate::Keep, pin)?.load(pin)
    }

    /// Inserts a value, replacing and returning the previously held one.
    pub fn swap<'r, 's, 'p>(&'s self, key: K, value: V, pin: &'p Guard) -> Option<&'r V>
    where
        's: 'r,
        'p: 'r,
    {
        let read = self.load_read(pin);
        let value = match read.map.get(&key) {
            Some(entry) => match entry.try_swap(value, pin) {
                Ok(previous) => return previous,
                // Expunged, needs to go back to the dirty map first.
                Err(value) => value,
            },
            None => value,
        };

        let mut guard = self.dirty.lock();
        let dirty = &mut *guard;
        let read = self.load_read(pin);
        if let Some(entry) = read.map.get(&key) {
            if entry.unexpunge_locked(pin) {
                // Expunged entries are created only when materializing the dirty map, and they
                // disappear from the snapshot on promotion. So there must be a dirty map.
                dirty
                    .map
                    .as_mut()
                    .expect(AMENDED_WITHOUT_DIRTY)
                    .insert(key, Arc::clone(entry));
            }
            entry.swap_locked(value, pin)
        } else if let Some(entry) = dirty.map.as_ref().and_then(|map| map.get(&key)) {
            entry.swap_locked(value, pin)
        } else {
            self.add_locked(dirty, read, key, Entry::new(value), pin);
            None
        }
    }

    /// Inserts a new key into the dirty map, marking the snapshot as amended if needed.
    fn add_locked(
        &self,
        dirty: &mut Dirty<K, V, S>,
        read: &ReadOnly<K, V, S>,
        key: K,
        entry: Entry<V>,
        pin: &Guard,
    ) {
        if !read.amended {
            self.materialize(dirty, read, pin);
            self.replace_read(
                ReadOnly {
                    map: Arc::clone(&read.map),
                    amended: true,
                },
                pin,
            );
        }
        dirty
            .map
            .as_mut()
            .expect(AMENDED_WITHOUT_DIRTY)
            .insert(key, Arc::new(entry));
    }

    /// Inserts a value, replacing any previous one.
    pub fn insert(&self, key: K, value: V, pin: &Guard) {
        self.swap(key, value, pin);
    }

    fn load_or_store<'r, 's, 'p, F>(
        &'s self,
        key: K,
        pending: Pending<V, F>,
        pin: &'p Guard,
    ) -> LoadOrStore<&'r V>
    where
        's: 'r,
        'p: 'r,
        F: FnOnce() -> V,
    {
        let read = self.load_read(pin);
        let pending = match read.map.get(&key) {
            Some(entry) => match entry.try_load_or_store(pending, pin) {
                Ok(result) => return result,
                Err(pending) => pending,
            },
            None => pending,
        };

        let mut guard = self.dirty.lock();
        let dirty = &mut *guard;
        let read = self.load_read(pin);
        let stored_locked = |entry: &Entry<V>, pending| match entry.try_load_or_store(pending, pin) {
            Ok(result) => result,
            Err(_) => unreachable!("BUG: Entry expunged while holding the lock"),
        };
        if let Some(entry) = read.map.get(&key) {
            if entry.unexpunge_locked(pin) {
                dirty
                    .map
                    .as_mut()
                    .expect(AMENDED_WITHOUT_DIRTY)
                    .insert(key, Arc::clone(entry));
            }
            stored_locked(entry, pending)
        } else if let Some(entry) = dirty.map.as_ref().and_then(|map| map.get(&key)) {
            let result = stored_locked(entry, pending);
            self.miss(dirty, pin);
            result
        } else {
            let entry = Entry::new(pending.into_value());
            let value = entry.load(pin).expect("BUG: Fresh entry without a value");
            self.add_locked(dirty, read, key, entry, pin);
            LoadOrStore::Stored(value)
        }
    }

    /// Looks up a value or inserts the provided one.
    ///
    /// Either way, returns the value now held in the map. Out of multiple concurrent calls for
    /// the same missing key, exactly one stores its value; the others load it.
    pub fn get_or_insert<'r, 's, 'p>(
        &'s self,
        key: K,
        value: V,
        pin: &'p Guard,
    ) -> LoadOrStore<&'r V>
    where
        's: 'r,
        'p: 'r,
    {
        self.load_or_store(key, Pending::<V, fn() -> V>::Created(value), pin)
    }

    /// Looks up a value or creates (and inserts) a new one.
    ///
    /// The closure may be called even if its value doesn't end up in the map, when another
    /// thread stores a value in between.
    pub fn get_or_insert_with<'r, 's, 'p, F>(
        &'s self,
        key: K,
        create: F,
        pin: &'p Guard,
    ) -> LoadOrStore<&'r V>
    where
        's: 'r,
        'p: 'r,
        F: FnOnce() -> V,
    {
        self.load_or_store(key, Pending::Future(create), pin)
    }

    /// Removes a value identified by the key, returning it if it was present.
    pub fn get_and_remove<'r, 's, 'p, Q>(&'s self, key: &Q, pin: &'p Guard) -> Option<&'r V>
    where
        's: 'r,
        'p: 'r,
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        self.locate(key, Locate::Take, pin)?.delete(pin)
    }

    /// Removes a value identified by the key.
    pub fn remove<Q>(&self, key: &Q, pin: &Guard)
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        self.get_and_remove(key, pin);
    }

    /// Replaces the value of a present key if the current value satisfies the predicate.
    ///
    /// Never inserts a new key. Returns if the value was replaced.
    pub fn compare_and_swap<Q, F>(&self, key: &Q, matches: F, value: V, pin: &Guard) -> bool
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        F: Fn(&V) -> bool,
    {
        match self.locate(key, Locate::Keep, pin) {
            Some(entry) => entry.try_compare_and_swap(matches, value, pin),
            None => false,
        }
    }

    /// Removes the key if its current value satisfies the predicate.
    ///
    /// The key is left in the dirty map (with an empty entry) even if it's removed. It'll be
    /// expunged with the next materialization of the dirty map.
    pub fn compare_and_remove<Q, F>(&self, key: &Q, matches: F, pin: &Guard) -> bool
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        F: Fn(&V) -> bool,
    {
        match self.locate(key, Locate::Keep, pin) {
            Some(entry) => entry.try_compare_and_delete(matches, pin),
            None => false,
        }
    }

    /// Returns a snapshot that is not amended, promoting the dirty map if needed.
    fn settle<'g>(&self, pin: &'g Guard) -> &'g ReadOnly<K, V, S> {
        let read = self.load_read(pin);
        if !read.amended {
            return read;
        }

        let mut dirty = self.dirty.lock();
        if self.load_read(pin).amended {
            self.promote(&mut dirty, Promotion::Iteration, pin);
        }
        self.load_read(pin)
    }

    /// Calls the closure for each key and value present, until it returns `false`.
    ///
    /// Each key present for the whole duration of the call is visited exactly once. Keys added
    /// or removed concurrently may or may not be visited. The order is unspecified.
    pub fn range<F>(&self, mut visit: F, pin: &Guard)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let read = self.settle(pin);
        for (key, entry) in read.map.iter() {
            if let Some(value) = entry.load(pin) {
                if !visit(key, value) {
                    break;
                }
            }
        }
    }

    /// Removes all the keys.
    pub fn clear(&self, pin: &Guard) {
        let read = self.load_read(pin);
        if read.map.is_empty() && !read.amended {
            return;
        }

        let mut dirty = self.dirty.lock();
        let read = self.load_read(pin);
        if !read.map.is_empty() || read.amended {
            trace!("Clearing snapshot of {} entries", read.map.len());
            self.replace_read(
                ReadOnly {
                    map: Arc::new(HashMap::with_hasher(self.hash_builder.clone())),
                    amended: false,
                },
                pin,
            );
        }
        dirty.map = None;
        dirty.misses = 0;
    }

    /// Checks for emptiness.
    ///
    /// Unlike [`range`][Raw::range], this doesn't promote the dirty map.
    pub fn is_empty(&self) -> bool {
        let pin = crossbeam_epoch::pin();
        let live = |map: &Mapping<K, V, S>| map.values().any(|entry| entry.load(&pin).is_some());

        let read = self.load_read(&pin);
        if live(&read.map) {
            return false;
        }
        if !read.amended {
            return true;
        }

        let dirty = self.dirty.lock();
        let read = self.load_read(&pin);
        !live(&read.map) && !dirty.map.as_ref().map_or(false, |map| live(map))
    }
}

impl<K, V, S> Drop for Raw<K, V, S> {
    fn drop(&mut self) {
        // We are in a destructor, so nobody else is looking. Therefore unprotected and Relaxed are
        // fine. The dirty map goes away on its own.
        unsafe {
            let pin = crossbeam_epoch::unprotected();
            let read = self.read.load(Ordering::Relaxed, pin);
            drop(read.into_owned());
        }
    }
}
