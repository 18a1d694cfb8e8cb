//! Change-notifying state cell.
//!
//! A `SafeCell` guards one value behind a mutex and pokes a shared,
//! capacity-1 notification channel whenever the value observably changes.
//! Notifications coalesce: a burst of changes while nobody is listening
//! leaves exactly one pending wake-up.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Create the notification channel shared by every cell of one cache.
pub fn notification_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

struct Slot<T> {
    value: T,
    initialized: bool,
}

pub struct SafeCell<T> {
    slot: Mutex<Slot<T>>,
    notify: mpsc::Sender<()>,
}

impl<T> SafeCell<T>
where
    T: Clone + Default + PartialEq,
{
    pub fn new(notify: mpsc::Sender<()>) -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: T::default(),
                initialized: false,
            }),
            notify,
        }
    }

    /// Returns a copy of the value and whether it was ever initialized.
    pub fn load(&self) -> (T, bool) {
        let slot = self.slot.lock();
        (slot.value.clone(), slot.initialized)
    }

    /// Replace the value and notify observers.
    pub fn store(&self, value: T) {
        {
            let mut slot = self.slot.lock();
            slot.value = value;
            slot.initialized = true;
        }
        self.poke();
    }

    /// Replace the value without notifying anyone.
    pub fn set(&self, value: T) {
        let mut slot = self.slot.lock();
        slot.value = value;
        slot.initialized = true;
    }

    /// Mutate the value under the lock. Observers are notified iff the value
    /// differs afterwards.
    pub fn with_exclusive_access<R>(&self, f: impl FnOnce(&mut T, bool) -> R) -> R {
        let (result, changed) = {
            let mut slot = self.slot.lock();
            let before = slot.value.clone();
            let initialized = slot.initialized;
            let result = f(&mut slot.value, initialized);
            let changed = slot.value != before;
            if changed {
                slot.initialized = true;
            }
            (result, changed)
        };
        if changed {
            self.poke();
        }
        result
    }

    fn poke(&self) {
        // Full channel means a wake-up is already pending
        let _ = self.notify.try_send(());
    }
}

impl<T: Serialize> fmt::Display for SafeCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        match serde_json::to_string(&slot.value) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("<unserializable>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_load_uninitialized() {
        let (tx, _rx) = notification_channel();
        let cell: SafeCell<Sample> = SafeCell::new(tx);
        let (value, initialized) = cell.load();
        assert!(!initialized);
        assert_eq!(value, Sample::default());
    }

    #[test]
    fn test_store_notifies_and_set_does_not() {
        let (tx, mut rx) = notification_channel();
        let cell: SafeCell<Sample> = SafeCell::new(tx);

        cell.set(Sample { name: "quiet".into(), count: 1 });
        assert!(rx.try_recv().is_err());

        cell.store(Sample { name: "loud".into(), count: 2 });
        assert!(rx.try_recv().is_ok());
        assert_eq!(cell.load().0.name, "loud");
    }

    #[test]
    fn test_exclusive_access_notifies_only_on_change() {
        let (tx, mut rx) = notification_channel();
        let cell: SafeCell<Sample> = SafeCell::new(tx);

        cell.with_exclusive_access(|_, _| {});
        assert!(rx.try_recv().is_err());

        let seen_initialized = cell.with_exclusive_access(|value, initialized| {
            value.count = 7;
            initialized
        });
        assert!(!seen_initialized);
        assert!(rx.try_recv().is_ok());
        assert!(cell.load().1);
    }

    #[test]
    fn test_notifications_coalesce() {
        let (tx, mut rx) = notification_channel();
        let cell: SafeCell<Sample> = SafeCell::new(tx);

        for i in 0..5 {
            cell.store(Sample { name: "n".into(), count: i });
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_display_is_json() {
        let (tx, _rx) = notification_channel();
        let cell: SafeCell<Sample> = SafeCell::new(tx);
        cell.set(Sample { name: "b1".into(), count: 3 });
        assert_eq!(cell.to_string(), r#"{"name":"b1","count":3}"#);
    }
}
