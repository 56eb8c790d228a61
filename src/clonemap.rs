//! The [`CloneSyncMap`][crate::CloneSyncMap] type and its helpers.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;

#[cfg(feature = "rayon")]
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

use crate::load_or_store::LoadOrStore;
use crate::raw::{self, Raw};

/// The iterator of the [`CloneSyncMap`].
///
/// See the [`iter`][CloneSyncMap::iter] method for details.
pub struct Iter<'a, K, V, S> {
    inner: raw::iterator::Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);
    fn next(&mut self) -> Option<(K, V)> {
        self.inner
            .next()
            .map(|(key, value)| (key.clone(), value.clone()))
    }
}

/// A concurrent read-mostly map that clones its values.
///
/// This flavour stores the values directly, without wrapping them into an [`Arc`][std::sync::Arc].
/// The return values of its functions are clones of the stored ones. This makes it suitable for
/// types cheap to clone (numbers, `Arc`s, small strings).
///
/// Iteration returns cloned copies of the keys and values. The [`FromIterator`] and [`Extend`]
/// traits accept tuples as arguments. Furthermore, the [`Extend`] is also implemented for shared
/// references (to allow extending the same map concurrently from multiple threads).
///
/// Otherwise it behaves the same as [`SyncMap`][crate::SyncMap].
///
/// # Examples
///
/// ```rust
/// use syncmap::CloneSyncMap;
/// use crossbeam_utils::thread;
///
/// let map = CloneSyncMap::new();
///
/// thread::scope(|s| {
///     s.spawn(|_| {
///         map.insert("hello", 1);
///     });
///     s.spawn(|_| {
///         map.insert("world", 2);
///     });
/// }).unwrap();
/// assert_eq!(Some(1), map.get("hello"));
/// assert_eq!(Some(2), map.get("world"));
/// ```
///
/// ```rust
/// use syncmap::clonemap::CloneSyncMap;
///
/// let map: CloneSyncMap<usize, Vec<usize>> = CloneSyncMap::new();
///
/// map.insert(42, vec![1, 2, 3]);
/// map.insert(43, vec![1, 2, 3, 4]);
///
/// assert_eq!(3, map.get(&42).unwrap().len());
/// assert_eq!(4, map.get(&43).unwrap().len());
/// assert_eq!(None, map.get(&44));
///
/// assert_eq!(Some(vec![1, 2, 3]), map.get_and_remove(&42));
/// assert_eq!(None, map.get(&42));
/// ```
pub struct CloneSyncMap<K, V, S = RandomState> {
    raw: Raw<K, V, S>,
}

impl<K, V> CloneSyncMap<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Creates a new empty map.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V, S> CloneSyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
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
        let pin = crossbeam_epoch::pin();
        self.raw.insert(key, value, &pin);
    }

    /// Inserts a value, returning the previous one if there was any.
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        let pin = crossbeam_epoch::pin();
        self.raw.swap(key, value, &pin).cloned()
    }

    /// Looks up a value.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.get(key, &pin).cloned()
    }

    /// Looks up a value or inserts the provided one.
    ///
    /// It looks up a value. If it isn't present, the provided one is inserted instead. Either
    /// way, the value now in the map is returned.
    pub fn get_or_insert(&self, key: K, value: V) -> LoadOrStore<V> {
        let pin = crossbeam_epoch::pin();
        self.raw.get_or_insert(key, value, &pin).map(V::clone)
    }

    /// Looks up or inserts a newly created value.
    ///
    /// # Quirks
    ///
    /// Due to races in case of concurrent accesses, the closure may be called even if the value
    /// is not subsequently inserted and an existing one is returned. This should be relatively
    /// rare (another thread must insert the value between this method observes an empty slot
    /// and manages to store the new one).
    pub fn get_or_insert_with<F>(&self, key: K, create: F) -> LoadOrStore<V>
    where
        F: FnOnce() -> V,
    {
        let pin = crossbeam_epoch::pin();
        self.raw
            .get_or_insert_with(key, create, &pin)
            .map(V::clone)
    }

    /// Looks up or inserts a default value.
    ///
    /// This is like [get_or_insert_with][CloneSyncMap::get_or_insert_with], but a default value
    /// is used instead of manually providing a closure.
    pub fn get_or_insert_default(&self, key: K) -> LoadOrStore<V>
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

    /// Removes a key, returning its value.
    pub fn get_and_remove<Q>(&self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.get_and_remove(key, &pin).cloned()
    }

    /// Replaces the value of a key if it is currently equal to `old`.
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V) -> bool
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        V: PartialEq,
    {
        let pin = crossbeam_epoch::pin();
        self.raw
            .compare_and_swap(key, |current| current == old, new, &pin)
    }

    /// Removes a key if its value is currently equal to `old`.
    pub fn compare_and_remove<Q>(&self, key: &Q, old: &V) -> bool
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        V: PartialEq,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.compare_and_remove(key, |current| current == old, &pin)
    }

    /// Calls the closure with every key and value, until it returns `false`.
    ///
    /// The values are not cloned for the call.
    pub fn range<F>(&self, visit: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.range(visit, &pin);
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

    /// Returns an iterator through the elements of the map.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            inner: raw::iterator::Iter::new(&self.raw),
        }
    }
}

impl<K, V> Default for CloneSyncMap<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Debug for CloneSyncMap<K, V, S>
where
    K: Debug + Hash + Eq + Clone + Send + 'static,
    V: Debug + Clone + Send + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> Clone for CloneSyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    fn clone(&self) -> Self {
        let builder = self.raw.hash_builder().clone();
        let mut new = Self::with_hasher(builder);
        new.extend(self);
        new
    }
}

impl<'a, K, V, S> IntoIterator for &'a CloneSyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, S>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, S> Extend<(K, V)> for &'a CloneSyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
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

impl<K, V, S> Extend<(K, V)> for CloneSyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me: &CloneSyncMap<_, _, _> = self;
        me.extend(iter);
    }
}

impl<K, V> FromIterator<(K, V)> for CloneSyncMap<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut me = CloneSyncMap::new();
        me.extend(iter);
        me
    }
}

#[cfg(feature = "rayon")]
impl<K, V, S> ParallelExtend<(K, V)> for CloneSyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me: &CloneSyncMap<_, _, _> = self;
        me.par_extend(par_iter);
    }
}

#[cfg(feature = "rayon")]
impl<'a, K, V, S> ParallelExtend<(K, V)> for &'a CloneSyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn par_extend<T>(&mut self, par_iter: T)
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let me: &CloneSyncMap<_, _, _> = *self;
        par_iter.into_par_iter().for_each(move |(k, v)| {
            me.insert(k, v);
        });
    }
}

#[cfg(feature = "rayon")]
impl<K, V> FromParallelIterator<(K, V)> for CloneSyncMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn from_par_iter<T>(par_iter: T) -> Self
    where
        T: IntoParallelIterator<Item = (K, V)>,
    {
        let mut me = CloneSyncMap::new();
        me.par_extend(par_iter);
        me
    }
}
