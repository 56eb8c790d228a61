//! Iteration through the read snapshot of a [`Raw`] map.

use std::collections::hash_map;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::Arc;

use crossbeam_epoch::Guard;

use super::entry::Entry;
use super::{Mapping, Raw};

// Notes about the lifetimes:
// The 'a here is actually a lie. We need these things:
// * We must not outlive the map we are iterating through.
// * The keys must not outlive the snapshot mapping. We hold our own reference to it, so it stays
//   at the same place in memory for as long as we live, even if the map publishes a new snapshot
//   in the meantime.
// * The values must not outlive the pin we hold, as they are reclaimed through the epochs.
//
// Technically the lifetime of the inner iterator should be something like `'self`, but it's not
// possible to describe. Therefore we have to make very sure to never return a reference with the
// 'a lifetime. The fields are also dropped in the declaration order, so the inner iterator goes
// away before the mapping it borrows from.
/// Iterator through the snapshot of a [`Raw`] map.
///
/// Creating it promotes the dirty map (if there's any) first, so all the keys present at that
/// time are visited. Keys added or removed later may or may not be seen.
pub struct Iter<'a, K, V, S> {
    inner: hash_map::Iter<'a, K, Arc<Entry<V>>>,
    _snapshot: Arc<Mapping<K, V, S>>,
    pin: Guard,
    _map: PhantomData<&'a Raw<K, V, S>>,
}

impl<'a, K, V, S> Iter<'a, K, V, S>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    /// Starts iterating through the given map.
    pub fn new<'m: 'a>(map: &'m Raw<K, V, S>) -> Self {
        let pin = crossbeam_epoch::pin();
        let snapshot = Arc::clone(&map.settle(&pin).map);
        let inner = unsafe { (*Arc::as_ptr(&snapshot)).iter() };
        Iter {
            inner,
            _snapshot: snapshot,
            pin,
            _map: PhantomData,
        }
    }
}

impl<K, V, S> Iter<'_, K, V, S> {
    // Not an iterator because this borrows out of the iterator itself (and effectively its pin).
    /// Returns the next live key and value, borrowed for as long as the iterator lives.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<(&K, &V)> {
        loop {
            let (key, entry) = self.inner.next()?;
            // Skip the ones deleted in the meantime.
            if let Some(value) = entry.load(&self.pin) {
                return Some((key, value));
            }
        }
    }
}
