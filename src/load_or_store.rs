//! The [`LoadOrStore`][crate::LoadOrStore] enum.

use std::ops::{Deref, DerefMut};

/// Outcome of the `get_or_insert` family of methods.
///
/// Tells apart a value that was already present in the map from one that had to be stored to
/// satisfy the request. It dereferences to the held value, so in many circumstances it acts just
/// as the value `T`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LoadOrStore<T> {
    /// The key was present, this is the value found there.
    Loaded(T),
    /// The key was missing and the provided value got stored.
    Stored(T),
}

impl<T> LoadOrStore<T> {
    /// Extracts the inner value.
    pub fn into_inner(self) -> T {
        match self {
            LoadOrStore::Loaded(value) | LoadOrStore::Stored(value) => value,
        }
    }

    /// Splits into the value and a flag if it was loaded (`true`) or stored (`false`).
    pub fn into_pair(self) -> (T, bool) {
        let loaded = self.is_loaded();
        (self.into_inner(), loaded)
    }

    /// Applies a transformation to the value, keeping the information where it came from.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> LoadOrStore<U> {
        match self {
            LoadOrStore::Loaded(value) => LoadOrStore::Loaded(f(value)),
            LoadOrStore::Stored(value) => LoadOrStore::Stored(f(value)),
        }
    }

    /// Checks if the value was already present.
    pub fn is_loaded(&self) -> bool {
        match self {
            LoadOrStore::Loaded(_) => true,
            LoadOrStore::Stored(_) => false,
        }
    }
}

impl<T> Deref for LoadOrStore<T> {
    type Target = T;
    fn deref(&self) -> &T {
        match self {
            LoadOrStore::Loaded(value) | LoadOrStore::Stored(value) => value,
        }
    }
}

impl<T> DerefMut for LoadOrStore<T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            LoadOrStore::Loaded(value) | LoadOrStore::Stored(value) => value,
        }
    }
}
