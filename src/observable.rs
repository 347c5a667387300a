//! Observable values
//!
//! Change notification for the session state, built on `tokio::sync::watch`.
//! The session publishes its desired settings, the active running mode and the
//! position-list cursor through observables; any UI surface subscribes without
//! the core knowing anything about the toolkit.
//!
//! # Example
//!
//! ```rust,ignore
//! let mode = Observable::new("running_mode", RunningMode::Idle);
//!
//! let mut rx = mode.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("mode is now {}", *rx.borrow());
//!     }
//! });
//!
//! mode.set(RunningMode::Live);
//! ```

use std::fmt::Debug;

use tokio::sync::watch;

/// A value with change notifications.
///
/// Uses `tokio::sync::watch` internally, so every subscriber sees the latest
/// value and intermediate values may be coalesced.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    name: String,
}

impl<T: Clone + Send + Sync + 'static> Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.name)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            name: self.name.clone(),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            name: name.into(),
        }
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Replace the value and notify all subscribers.
    ///
    /// Succeeds even when nobody is subscribed.
    pub fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Modify the value in place and notify all subscribers.
    pub fn modify<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
    {
        self.sender.send_modify(f);
    }

    /// Subscribe to future changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Observable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Set the value, notifying subscribers only if it changed.
    ///
    /// Returns whether a notification was sent.
    pub fn set_if_changed(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}
