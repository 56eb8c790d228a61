//! The per-key value cell shared between the read snapshot and the dirty map.

use std::sync::atomic::Ordering;

use bitflags::bitflags;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::load_or_store::LoadOrStore;

bitflags! {
    /// Flags that can be put onto the pointer to the value slot.
    ///
    /// They live in the unused low bits of the pointer. [`Slot`] is over-aligned, so there's
    /// always room for them, no matter what the alignment of the value is.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct SlotFlags: usize {
        /// The entry is deleted and it is known to be missing from the dirty map.
        ///
        /// Only ever found on a null pointer. A plain null pointer (without this flag) means the
        /// entry is deleted, but the dirty map (if there's one) may still reference it.
        const EXPUNGED = 0b01;
    }
}

/// Extracts [`SlotFlags`] from a pointer.
fn sf<V>(slot: Shared<Slot<V>>) -> SlotFlags {
    SlotFlags::from_bits(slot.tag()).expect("Invalid slot flags")
}

#[repr(align(4))]
struct Slot<V>(V);

/// The liveness of an [`Entry`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum State {
    Valid,
    Deleted,
    Expunged,
}

/// A value that is either already created or is to be created only once it's really needed.
pub(crate) enum Pending<V, F> {
    Created(V),
    Future(F),
}

impl<V, F: FnOnce() -> V> Pending<V, F> {
    pub(crate) fn into_value(self) -> V {
        match self {
            Pending::Created(value) => value,
            Pending::Future(create) => create(),
        }
    }
}

/// A cell holding the current value of one key.
///
/// The same entry is referenced from the read snapshot and from the dirty map, so modifying the
/// value through either of them is visible through both. The state is encoded in a single atomic
/// pointer:
///
/// * Non-null: valid, the pointer leads to the value.
/// * Null: deleted.
/// * Null tagged with [`SlotFlags::EXPUNGED`]: expunged.
///
/// The methods with the `_locked` suffix must be called only with the dirty map lock held. These
/// are the only ones that move the entry from or to the expunged state.
///
/// Replaced values are scheduled for destruction through the epoch [`Guard`], so a value returned
/// from any of the methods stays valid until the guard is dropped.
pub(crate) struct Entry<V> {
    slot: Atomic<Slot<V>>,
}

impl<V> Entry<V> {
    pub(crate) fn new(value: V) -> Self {
        Entry {
            slot: Atomic::new(Slot(value)),
        }
    }

    fn expunged<'g>() -> Shared<'g, Slot<V>> {
        Shared::null().with_tag(SlotFlags::EXPUNGED.bits())
    }

    /// Schedules a replaced slot for destruction, returning the value it held.
    ///
    /// The slot must already be unlinked from the entry.
    unsafe fn retire<'g>(old: Shared<'g, Slot<V>>, pin: &'g Guard) -> Option<&'g V> {
        let value = old.as_ref().map(|slot| &slot.0);
        if !old.is_null() {
            pin.defer_destroy(old);
        }
        value
    }

    pub(crate) fn state(&self, pin: &Guard) -> State {
        let slot = self.slot.load(Ordering::Acquire, pin);
        if !slot.is_null() {
            State::Valid
        } else if sf(slot).contains(SlotFlags::EXPUNGED) {
            State::Expunged
        } else {
            State::Deleted
        }
    }

    /// Reads the current value, if the entry is valid.
    pub(crate) fn load<'g>(&self, pin: &'g Guard) -> Option<&'g V> {
        let slot = self.slot.load(Ordering::Acquire, pin);
        unsafe { slot.as_ref() }.map(|slot| &slot.0)
    }

    /// Stores a value unless the entry is expunged, returning the previous one.
    ///
    /// A deleted (but not expunged) entry gets resurrected. An expunged one is not in the dirty
    /// map, so it can't be brought back without the lock; the value is handed back in the `Err`
    /// in that case.
    pub(crate) fn try_swap<'g>(&self, value: V, pin: &'g Guard) -> Result<Option<&'g V>, V> {
        let mut current = self.slot.load(Ordering::Acquire, pin);
        if sf(current).contains(SlotFlags::EXPUNGED) {
            return Err(value);
        }
        let mut new = Owned::new(Slot(value));
        loop {
            // AcqRel: publish the new value, acquire the old one we are going to hand out.
            match self.slot.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(_) => return Ok(unsafe { Self::retire(current, pin) }),
                Err(e) => {
                    if sf(e.current).contains(SlotFlags::EXPUNGED) {
                        return Err((*e.new.into_box()).0);
                    }
                    current = e.current;
                    new = e.new;
                }
            }
        }
    }

    /// Unconditionally stores a value, returning the previous one.
    ///
    /// The entry must not be expunged. As only the lock holder can expunge, it's enough to
    /// either unexpunge it or know it's in the dirty map.
    pub(crate) fn swap_locked<'g>(&self, value: V, pin: &'g Guard) -> Option<&'g V> {
        let old = self
            .slot
            .swap(Owned::new(Slot(value)), Ordering::AcqRel, pin);
        assert!(
            !sf(old).contains(SlotFlags::EXPUNGED),
            "Stored into an expunged entry"
        );
        unsafe { Self::retire(old, pin) }
    }

    /// Marks the entry as deleted, returning the value it held.
    pub(crate) fn delete<'g>(&self, pin: &'g Guard) -> Option<&'g V> {
        let mut current = self.slot.load(Ordering::Acquire, pin);
        loop {
            if current.is_null() {
                return None;
            }
            match self.slot.compare_exchange_weak(
                current,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(_) => return unsafe { Self::retire(current, pin) },
                Err(e) => current = e.current,
            }
        }
    }

    /// Returns the current value or stores the pending one if the entry is deleted.
    ///
    /// Fails (handing the pending value back) if the entry is expunged. The pending value may get
    /// created even if it ends up not being stored, in case some other thread stores a value in
    /// between.
    pub(crate) fn try_load_or_store<'g, F>(
        &self,
        pending: Pending<V, F>,
        pin: &'g Guard,
    ) -> Result<LoadOrStore<&'g V>, Pending<V, F>>
    where
        F: FnOnce() -> V,
    {
        let current = self.slot.load(Ordering::Acquire, pin);
        if sf(current).contains(SlotFlags::EXPUNGED) {
            return Err(pending);
        }
        if let Some(slot) = unsafe { current.as_ref() } {
            return Ok(LoadOrStore::Loaded(&slot.0));
        }

        let mut new = Owned::new(Slot(pending.into_value()));
        loop {
            match self.slot.compare_exchange(
                Shared::null(),
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(stored) => return Ok(LoadOrStore::Stored(&unsafe { stored.deref() }.0)),
                Err(e) => {
                    if sf(e.current).contains(SlotFlags::EXPUNGED) {
                        return Err(Pending::Created((*e.new.into_box()).0));
                    }
                    if let Some(slot) = unsafe { e.current.as_ref() } {
                        return Ok(LoadOrStore::Loaded(&slot.0));
                    }
                    new = e.new;
                }
            }
        }
    }

    /// Replaces the value if the entry is valid and its current value matches.
    pub(crate) fn try_compare_and_swap<'g, F>(&self, matches: F, value: V, pin: &'g Guard) -> bool
    where
        V: 'g,
        F: Fn(&V) -> bool,
    {
        let matching = |slot: Shared<'g, Slot<V>>| {
            unsafe { slot.as_ref() }.map_or(false, |slot| matches(&slot.0))
        };

        let mut current = self.slot.load(Ordering::Acquire, pin);
        if !matching(current) {
            return false;
        }
        let mut new = Owned::new(Slot(value));
        loop {
            match self.slot.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(_) => {
                    unsafe { Self::retire(current, pin) };
                    return true;
                }
                Err(e) => {
                    if !matching(e.current) {
                        return false;
                    }
                    current = e.current;
                    new = e.new;
                }
            }
        }
    }

    /// Deletes the entry if it is valid and its current value matches.
    pub(crate) fn try_compare_and_delete<'g, F>(&self, matches: F, pin: &'g Guard) -> bool
    where
        F: Fn(&V) -> bool,
    {
        let mut current = self.slot.load(Ordering::Acquire, pin);
        loop {
            match unsafe { current.as_ref() } {
                Some(slot) if matches(&slot.0) => (),
                _ => return false,
            }
            match self.slot.compare_exchange_weak(
                current,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(_) => {
                    unsafe { Self::retire(current, pin) };
                    return true;
                }
                Err(e) => current = e.current,
            }
        }
    }

    /// Moves a deleted entry to the expunged state.
    ///
    /// Returns if the entry is expunged now (either by this call or previously).
    pub(crate) fn try_expunge_locked(&self, pin: &Guard) -> bool {
        let mut current = self.slot.load(Ordering::Acquire, pin);
        while current.is_null() && !sf(current).contains(SlotFlags::EXPUNGED) {
            match self.slot.compare_exchange(
                current,
                Self::expunged(),
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            ) {
                Ok(_) => return true,
                Err(e) => current = e.current,
            }
        }
        sf(current).contains(SlotFlags::EXPUNGED)
    }

    /// Moves an expunged entry to the deleted state.
    ///
    /// Returns true if the entry was expunged. The caller must put it back into the dirty map
    /// before releasing the lock.
    pub(crate) fn unexpunge_locked(&self, pin: &Guard) -> bool {
        self.slot
            .compare_exchange(
                Self::expunged(),
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                pin,
            )
            .is_ok()
    }
}

impl<V> Drop for Entry<V> {
    fn drop(&mut self) {
        // A reader that found this entry through the dirty map may still hold the value, even
        // though the entry itself is going away. So it needs to wait for the epoch as well.
        let pin = crossbeam_epoch::pin();
        let slot = self.slot.load(Ordering::Acquire, &pin);
        if !slot.is_null() {
            unsafe { pin.defer_destroy(slot) };
        }
    }
}
