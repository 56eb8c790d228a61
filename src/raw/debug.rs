//! A module containing few debug utilities.
//!
//! In general, they are meant for debugging the *map itself*, but it is exposed as potentially
//! useful.

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::Ordering;

use crossbeam_epoch::Guard;

use super::entry::Entry;
use super::{Mapping, Raw};

impl<K, V, S> Raw<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    // Hack: &mut to make sure it is not shared between threads and nobody is modifying the thing
    // right now.
    /// Panics if the snapshot and the dirty map don't agree with each other.
    ///
    /// In particular:
    /// * The dirty map exists exactly when the snapshot is amended.
    /// * Expunged entries are only in the snapshot, never in the dirty map.
    /// * Every other snapshot entry is in the dirty map, as the very same entry.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&mut self) {
        use std::sync::Arc;

        use super::entry::State;

        // Unprotected and Relaxed are fine, we are &mut so nobody else is allowed to do stuff to
        // us at the moment.
        let pin = unsafe { crossbeam_epoch::unprotected() };
        let read = self.read.load(Ordering::Relaxed, pin);
        let read = unsafe { read.as_ref() }.expect("Null snapshot");
        let dirty = self.dirty.get_mut();

        assert_eq!(
            read.amended,
            dirty.map.is_some(),
            "Amended flag doesn't match presence of the dirty map"
        );

        match &dirty.map {
            None => {
                for entry in read.map.values() {
                    assert_ne!(
                        State::Expunged,
                        entry.state(pin),
                        "Expunged entry without a dirty map"
                    );
                }
            }
            Some(dirty) => {
                for (key, entry) in read.map.iter() {
                    match (entry.state(pin), dirty.get(key)) {
                        (State::Expunged, None) => (),
                        (State::Expunged, Some(_)) => panic!("Expunged entry in the dirty map"),
                        (_, Some(other)) => assert!(
                            Arc::ptr_eq(entry, other),
                            "Snapshot and dirty map hold different entries for the same key"
                        ),
                        (_, None) => panic!("Live snapshot entry missing from the dirty map"),
                    }
                }
                for entry in dirty.values() {
                    assert_ne!(State::Expunged, entry.state(pin));
                }
            }
        }
    }

    fn print_mapping(
        name: &str,
        map: &Mapping<K, V, S>,
        fmt: &mut Formatter,
        pin: &Guard,
    ) -> FmtResult
    where
        K: Debug,
        V: Debug,
    {
        write!(fmt, "{}(", name)?;
        for (key, entry) in map.iter() {
            write!(fmt, " {:?}:", key)?;
            Self::print_entry(entry, fmt, pin)?;
        }
        write!(fmt, " )")
    }

    fn print_entry(entry: &Entry<V>, fmt: &mut Formatter, pin: &Guard) -> FmtResult
    where
        V: Debug,
    {
        match entry.load(pin) {
            Some(value) => write!(fmt, "{:?}", value),
            None => write!(fmt, "<{:?}>", entry.state(pin)),
        }
    }

    fn print_shape(&self, fmt: &mut Formatter) -> FmtResult
    where
        K: Debug,
        V: Debug,
    {
        let pin = crossbeam_epoch::pin();
        let read = self.read.load(Ordering::Acquire, &pin);
        let read = unsafe { read.as_ref() }.expect("Null snapshot");
        Self::print_mapping("read", &read.map, fmt, &pin)?;
        if read.amended {
            write!(fmt, "+")?;
        }
        let dirty = self.dirty.lock();
        write!(fmt, " misses: {} ", dirty.misses)?;
        match &dirty.map {
            Some(map) => Self::print_mapping("dirty", map, fmt, &pin),
            None => write!(fmt, "dirty: -"),
        }
    }
}

/// A pretty-printing wrapper around the raw map.
///
/// Both the snapshot and the dirty map are printed, including the deleted and expunged entries
/// and the miss counter.
pub struct PrintShape<'a, K, V, S>(pub &'a Raw<K, V, S>);

impl<K, V, S> Display for PrintShape<'_, K, V, S>
where
    K: Debug + Hash + Eq,
    V: Debug,
    S: BuildHasher,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        self.0.print_shape(fmt)
    }
}
