//! The [`SyncMap`][crate::SyncMap] type and its helpers.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;
use std::sync::Arc;

#[cfg(feature = "rayon")]
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

use crate::load_or_store::LoadOrStore;
use crate::raw::{self, Raw};

/// The iterator of the [`SyncMap`].
///
/// See the [`iter`][SyncMap::iter] method for details.
pub struct Iter<'a, K, V, S> {
    inner: raw::iterator::Iter<'a, K, Arc<V>, S>,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S>
where
    K: Clone,
{
    type Item = (K, Arc<V>);
    fn next(&mut self) -> Option<(K, Arc<V>)> {
        self.inner
            .next()
            .map(|(key, value)| (key.clone(), Arc::clone(value)))
    }
}

/// A concurrent map for read-mostly workloads.
///
/// Lookups of keys that are already settled in the map don't take any lock, they go through an
/// atomically published snapshot. New keys go to a mutex-protected overflow map, which is folded
/// into the snapshot once enough lookups had to go there. This makes the map a good fit when:
///
/// * The set of keys is mostly stable and each key is written once but read many times (caches
///   that only grow, registries).
/// * Multiple threads read, write and overwrite values of disjoint sets of keys.
///
/// Values are stored as [`Arc`]s and handed out as such, so there are no requirements on the
/// value type besides being shareable between threads. A value obtained from the map stays valid
/// even after it has been removed or replaced in the map.
///
/// # Examples
///
/// ```rust
/// use syncmap::SyncMap;
/// use crossbeam_utils::thread;
///
/// let map = SyncMap::new();
///
/// thread::scope(|s| {
///     s.spawn(|_| {
///         map.insert("hello", 1);
///     });
///     s.spawn(|_| {
///         map.insert("world", 2);
///     });
/// }).unwrap();
/// assert_eq!(1, *map.get("hello").unwrap());
/// assert_eq!(2, *map.get("world").unwrap());
/// ```
///
/// ```rust
/// use std::sync::Arc;
/// use syncmap::SyncMap;
///
/// let map: SyncMap<&str, Vec<u8>> = SyncMap::new();
/// let (stored, loaded) = map.get_or_insert("key", vec![1, 2, 3]).into_pair();
/// assert!(!loaded);
///
/// let (again, loaded) = map.get_or_insert("key", vec![]).into_pair();
/// assert!(loaded);
/// // The very same value, the new one was not stored.
/// assert!(Arc::ptr_eq(&stored, &again));
/// ```
pub struct SyncMap<K, V, S = RandomState> {
    raw: Raw<K, Arc<V>, S>,
}

impl<K, V> SyncMap<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a new empty map.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    /// Creates a new empty map, but with the provided hasher implementation.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            raw: Raw::with_hasher(hasher),
        }
    }

    /// Inserts a value, replacing any previous one.
    pub fn insert(&self, key: K, value: V) {
        self.insert_arc(key, Arc::new(value));
    }

    /// Inserts an already shared value.
    pub fn insert_arc(&self, key: K, value: Arc<V>) {
        let pin = crossbeam_epoch::pin();
        self.raw.insert(key, value, &pin);
    }

    /// Inserts a value, returning the previous one if there was any.
    pub fn swap(&self, key: K, value: V) -> Option<Arc<V>> {
        let pin = crossbeam_epoch::pin();
        self.raw.swap(key, Arc::new(value), &pin).cloned()
    }

    /// Looks up a value.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.get(key, &pin).cloned()
    }

    /// Looks up a value or inserts the provided one.
    ///
    /// Either way, the value now present in the map is returned. If multiple threads race to
    /// insert the same missing key, exactly one of them gets [`LoadOrStore::Stored`].
    pub fn get_or_insert(&self, key: K, value: V) -> LoadOrStore<Arc<V>> {
        self.get_or_insert_with(key, || value)
    }

    /// Looks up a value or inserts a newly created one.
    ///
    /// # Quirks
    ///
    /// Due to races in case of concurrent accesses, the closure may be called even if the value
    /// is not subsequently inserted and an existing value is returned. This should be relatively
    /// rare (another thread must insert the value between this method observes an empty slot
    /// and manages to store the new one).
    pub fn get_or_insert_with<F>(&self, key: K, create: F) -> LoadOrStore<Arc<V>>
    where
        F: FnOnce() -> V,
    {
        let pin = crossbeam_epoch::pin();
        self.raw
            .get_or_insert_with(key, || Arc::new(create()), &pin)
            .map(Arc::clone)
    }

    /// Looks up a value or inserts an already shared one.
    pub fn get_or_insert_arc(&self, key: K, value: Arc<V>) -> LoadOrStore<Arc<V>> {
        let pin = crossbeam_epoch::pin();
        self.raw.get_or_insert(key, value, &pin).map(Arc::clone)
    }

    /// Looks up a value or inserts a default one.
    pub fn get_or_insert_default(&self, key: K) -> LoadOrStore<Arc<V>>
    where
        V: Default,
    {
        self.get_or_insert_with(key, V::default)
    }

    /// Removes a key.
    pub fn remove<Q>(&self, key: &Q)
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.remove(key, &pin);
    }

    /// Removes a key, returning the value it had.
    pub fn get_and_remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.get_and_remove(key, &pin).cloned()
    }

    /// Replaces the value of a key if it is currently equal to `old`.
    ///
    /// Missing keys are never inserted. Returns if the value got replaced.
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V) -> bool
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        V: PartialEq,
    {
        let pin = crossbeam_epoch::pin();
        self.raw
            .compare_and_swap(key, |current| **current == *old, Arc::new(new), &pin)
    }

    /// Removes a key if its value is currently equal to `old`.
    pub fn compare_and_remove<Q>(&self, key: &Q, old: &V) -> bool
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        V: PartialEq,
    {
        let pin = crossbeam_epoch::pin();
        self.raw
            .compare_and_remove(key, |current| **current == *old, &pin)
    }

    /// Calls the closure with every key and value, until it returns `false`.
    ///
    /// Every key present for the whole duration of the call is visited exactly once. Keys
    /// inserted or removed concurrently may or may not be visited. No particular order is
    /// guaranteed.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.range(|key, value| visit(key, &**value), &pin);
    }

    /// Removes all the keys.
    pub fn clear(&self) {
        let pin = crossbeam_epoch::pin();
        self.raw.clear(&pin);
    }

    /// Checks if the map is currently empty.
    ///
    /// Note that due to the nature of concurrent map, this is inherently racy ‒ another thread
    /// may add or remove elements between you call this method and act based on the result.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns an iterator through the keys and values.
    ///
    /// It has the same guarantees as [`range`][SyncMap::range].
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            inner: raw::iterator::Iter::new(&self.raw),
        }
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Debug for SyncMap<K, V, S>
where
    K: Debug + Hash + Eq + Clone + Send + 'static,
    V: Debug + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_map().entries(self.iter()).finish()
    }
}

impl<'a, K, V, S> IntoIterator for &'a SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    type Item = (K, Arc<V>);
    type IntoIter = Iter<'a, K, V, S>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, S> Extend<(K, V)> for &'a SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl<K, V, S> Extend<(K, V)> for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me: &SyncMap<_, _, _> = self;
        me.extend(iter);
    }
}

impl<K, V> FromIterator<(K, V)> for SyncMap<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + Sync + 'static,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me = SyncMap::new();
        me.extend(iter);
        me
    }
}

#[cfg(feature = "rayon")]
impl<K, V, S> ParallelExtend<(K, V)> for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me: &SyncMap<_, _, _> = self;
        me.par_extend(par_iter);
    }
}

#[cfg(feature = "rayon")]
impl<'a, K, V, S> ParallelExtend<(K, V)> for &'a SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let me: &SyncMap<_, _, _> = *self;
        par_iter.into_par_iter().for_each(move |(k, v)| {
            me.insert(k, v);
        });
    }
}

#[cfg(feature = "rayon")]
impl<K, V> FromParallelIterator<(K, V)> for SyncMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn from_par_iter<T>(par_iter: T) -> Self
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me = SyncMap::new();
        me.par_extend(par_iter);
        me
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    use crossbeam_utils::thread;
    #[cfg(feature = "rayon")]
    use rayon::prelude::*;

    use super::*;
    use crate::raw::tests::NoHasher;

    const TEST_THREADS: usize = 4;
    const TEST_BATCH: usize = 10000;
    const TEST_BATCH_SMALL: usize = 100;
    const TEST_REP: usize = 20;

    #[test]
    fn create_destroy() {
        let map: SyncMap<String, usize> = SyncMap::new();
        drop(map);
    }

    #[test]
    fn lookup_empty() {
        let map: SyncMap<String, usize> = SyncMap::new();
        assert!(map.get("hello").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn insert_lookup() {
        let map = SyncMap::new();
        map.insert("hello", "world");
        assert!(map.get("world").is_none());
        assert_eq!("world", *map.get("hello").unwrap());
        assert!(!map.is_empty());
    }

    #[test]
    fn insert_overwrite_lookup() {
        let map = SyncMap::new();
        assert!(map.swap("hello", "world").is_none());
        let old = map.swap("hello", "universe").unwrap();
        assert_eq!("world", *old);
        assert_eq!("universe", *map.get("hello").unwrap());
    }

    /// The round trip through the whole lifecycle of a single key.
    #[test]
    fn store_delete_load_or_store() {
        let map = SyncMap::new();
        map.insert(1, 2);
        assert_eq!(2, *map.get(&1).unwrap());

        map.remove(&1);
        assert!(map.get(&1).is_none());

        let first = map.get_or_insert(1, 2);
        assert!(!first.is_loaded());
        assert_eq!(2, **first);
        let second = map.get_or_insert(1, 2);
        assert!(second.is_loaded());
        // It's the existing one, not the freshly passed one
        assert!(Arc::ptr_eq(&*first, &*second));

        let third = map.get_or_insert(2, 3);
        assert!(!third.is_loaded());

        let mut expected: HashMap<_, _> = vec![(1, 2), (2, 3)].into_iter().collect();
        map.range(|k, v| {
            assert_eq!(expected.remove(k), Some(*v));
            true
        });
        assert!(expected.is_empty());
    }

    #[test]
    fn get_and_remove_shared() {
        let map: SyncMap<&str, Vec<u8>> = SyncMap::new();
        map.insert("r", Vec::new());
        let stored = map.get("r").unwrap();

        let removed = map.get_and_remove("r").unwrap();
        assert!(Arc::ptr_eq(&stored, &removed));
        assert!(map.get("r").is_none());
        assert!(map.get_and_remove("r").is_none());

        let (again, loaded) = map.get_or_insert_arc("r", Arc::clone(&stored)).into_pair();
        assert!(!loaded);
        assert!(Arc::ptr_eq(&stored, &again));
    }

    #[test]
    fn compare_ops() {
        let map = SyncMap::new();
        assert!(!map.compare_and_swap("k", &1, 2));
        assert!(map.get("k").is_none());
        map.insert("k", 1);
        assert!(!map.compare_and_swap("k", &0, 2));
        assert!(map.compare_and_swap("k", &1, 2));
        assert_eq!(2, *map.get("k").unwrap());
        assert!(!map.compare_and_remove("k", &1));
        assert!(map.compare_and_remove("k", &2));
        assert!(map.get("k").is_none());
    }

    // Insert a lot of things, to make sure there are many promotions on the way.
    #[test]
    fn insert_many() {
        let map = SyncMap::new();
        for i in 0..TEST_BATCH {
            map.insert(i, i);
            // Read some so the dirty map gets promoted from time to time
            assert_eq!(i / 2, *map.get(&(i / 2)).unwrap());
        }

        for i in 0..TEST_BATCH {
            assert_eq!(i, *map.get(&i).unwrap());
        }
    }

    #[test]
    fn par_insert_many() {
        for _ in 0..TEST_REP {
            let map: SyncMap<usize, usize> = SyncMap::new();
            thread::scope(|s| {
                for t in 0..TEST_THREADS {
                    let map = &map;
                    s.spawn(move |_| {
                        for i in 0..TEST_BATCH {
                            let num = t * TEST_BATCH + i;
                            assert!(map.swap(num, num).is_none());
                        }
                    });
                }
            })
            .unwrap();

            for i in 0..TEST_BATCH * TEST_THREADS {
                assert_eq!(*map.get(&i).unwrap(), i);
            }
        }
    }

    #[test]
    fn par_get_many() {
        for _ in 0..TEST_REP {
            let map = SyncMap::new();
            for i in 0..TEST_BATCH * TEST_THREADS {
                map.insert(i, i);
            }
            thread::scope(|s| {
                for t in 0..TEST_THREADS {
                    let map = &map;
                    s.spawn(move |_| {
                        for i in 0..TEST_BATCH {
                            let num = t * TEST_BATCH + i;
                            assert_eq!(*map.get(&num).unwrap(), num);
                        }
                    });
                }
            })
            .unwrap();
        }
    }

    #[test]
    fn collisions() {
        let map = SyncMap::with_hasher(NoHasher);
        // While their hash is the same under the hasher, they don't kick each other out.
        for i in 0..TEST_BATCH_SMALL {
            map.insert(i, i);
        }
        // And all are present.
        for i in 0..TEST_BATCH_SMALL {
            assert_eq!(i, *map.get(&i).unwrap());
        }
        // But reusing the key kicks the other one out.
        for i in 0..TEST_BATCH_SMALL {
            assert_eq!(i, *map.swap(i, i + 1).unwrap());
            assert_eq!(i + 1, *map.get(&i).unwrap());
        }
    }

    #[test]
    fn get_or_insert_empty() {
        let map = SyncMap::new();
        let val = map.get_or_insert("hello", 42);
        assert_eq!(42, **val);
        assert!(!val.is_loaded());
    }

    #[test]
    fn get_or_insert_existing() {
        let map = SyncMap::new();
        map.insert("hello", 42);
        let val = map.get_or_insert("hello", 0);
        // We still have the original
        assert_eq!(42, **val);
        assert!(val.is_loaded());
    }

    #[test]
    fn get_or_insert_with_lazy() {
        let map = SyncMap::new();
        map.insert("hello", 42);
        let val = map.get_or_insert_with("hello", || panic!("Must not be called"));
        assert_eq!(42, **val);
        assert_eq!(0, **map.get_or_insert_default("world"));
    }

    fn get_or_insert_many_inner<H>(map: SyncMap<usize, usize, H>, len: usize)
    where
        H: BuildHasher + Clone + Send + 'static,
    {
        for i in 0..len {
            let val = map.get_or_insert(i, i);
            assert_eq!(i, **val);
            assert!(!val.is_loaded());
        }

        for i in 0..len {
            let val = map.get_or_insert(i, 0);
            assert_eq!(i, **val);
            assert!(val.is_loaded());
        }
    }

    #[test]
    fn get_or_insert_many() {
        get_or_insert_many_inner(SyncMap::new(), TEST_BATCH);
    }

    #[test]
    fn get_or_insert_collision() {
        get_or_insert_many_inner(SyncMap::with_hasher(NoHasher), TEST_BATCH_SMALL);
    }

    /// Many threads try to be the first one to insert the same keys. Only one of them may win
    /// each key and everyone else must see the winner's value.
    #[test]
    fn par_get_or_insert_single_winner() {
        for _ in 0..TEST_REP {
            let map: SyncMap<usize, usize> = SyncMap::new();
            let wins = AtomicUsize::new(0);
            let barrier = Barrier::new(TEST_THREADS);
            thread::scope(|s| {
                for t in 0..TEST_THREADS {
                    let map = &map;
                    let wins = &wins;
                    let barrier = &barrier;
                    s.spawn(move |_| {
                        barrier.wait();
                        for i in 0..TEST_BATCH_SMALL {
                            let val = map.get_or_insert(i, t);
                            if val.is_loaded() {
                                assert_ne!(t, **val);
                            } else {
                                assert_eq!(t, **val);
                                wins.fetch_add(1, Ordering::Relaxed);
                            }
                            assert_eq!(**val, *map.get(&i).unwrap());
                        }
                    });
                }
            })
            .unwrap();
            assert_eq!(TEST_BATCH_SMALL, wins.load(Ordering::Relaxed));
        }
    }

    #[test]
    fn simple_remove() {
        let map = SyncMap::new();
        assert!(map.get_and_remove(&42).is_none());
        map.insert(42, "hello");
        assert_eq!("hello", *map.get(&42).unwrap());
        assert_eq!("hello", *map.get_and_remove(&42).unwrap());
        assert!(map.get(&42).is_none());
        assert!(map.is_empty());
        assert!(map.get_and_remove(&42).is_none());
        assert!(map.is_empty());
    }

    fn remove_many_inner<H>(mut map: SyncMap<usize, usize, H>, len: usize)
    where
        H: BuildHasher + Clone + Send + 'static,
    {
        for i in 0..len {
            map.insert(i, i);
        }
        for i in 0..len {
            assert_eq!(i, *map.get(&i).unwrap());
            assert_eq!(i, *map.get_and_remove(&i).unwrap());
            assert!(map.get(&i).is_none());
            map.raw.assert_consistent();
        }

        assert!(map.is_empty());
    }

    #[test]
    fn remove_many() {
        remove_many_inner(SyncMap::new(), TEST_BATCH_SMALL * 10);
    }

    #[test]
    fn remove_many_collision() {
        remove_many_inner(SyncMap::with_hasher(NoHasher), TEST_BATCH_SMALL);
    }

    #[test]
    fn remove_par() {
        let mut map = SyncMap::new();
        for i in 0..TEST_THREADS * TEST_BATCH {
            map.insert(i, i);
        }

        thread::scope(|s| {
            for t in 0..TEST_THREADS {
                let map = &map;
                s.spawn(move |_| {
                    for i in 0..TEST_BATCH {
                        let num = t * TEST_BATCH + i;
                        let val = map.get_and_remove(&num).unwrap();
                        assert_eq!(num, *val);
                    }
                });
            }
        })
        .unwrap();

        map.raw.assert_consistent();
        assert!(map.is_empty());
    }

    #[test]
    fn iter_and_collect() {
        let map: SyncMap<usize, usize> = (0..100).map(|i| (i, i * 2)).collect();
        let mut seen: Vec<_> = map.iter().map(|(k, v)| (k, *v)).collect();
        seen.sort();
        assert_eq!((0..100).map(|i| (i, i * 2)).collect::<Vec<_>>(), seen);

        let mut seen = 0;
        for (k, v) in &map {
            assert_eq!(k * 2, *v);
            seen += 1;
        }
        assert_eq!(100, seen);
    }

    #[test]
    fn clear_all() {
        let map: SyncMap<usize, usize> = (0..10).map(|i| (i, i)).collect();
        let held = map.get(&3).unwrap();
        map.clear();
        assert!(map.is_empty());
        assert!(map.get(&3).is_none());
        assert_eq!(3, *held);
        map.insert(3, 4);
        assert_eq!(4, *map.get(&3).unwrap());
    }

    #[test]
    fn debug_formatting() {
        let map: SyncMap<&str, &str> = SyncMap::new();
        map.insert("hello", "world");
        assert_eq!("{\"hello\": \"world\"}", format!("{:?}", map));
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn rayon_extend() {
        let mut map = SyncMap::new();
        map.par_extend((0..TEST_BATCH_SMALL).into_par_iter().map(|i| (i, i)));
        for i in 0..TEST_BATCH_SMALL {
            assert_eq!(i, *map.get(&i).unwrap());
        }
        let map: SyncMap<_, _> = (0..TEST_BATCH_SMALL).into_par_iter().map(|i| (i, i)).collect();
        assert_eq!(TEST_BATCH_SMALL, map.iter().count());
    }
}
