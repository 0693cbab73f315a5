//! One-shot readiness gates for init-once handles.
//!
//! The scan engine compiles its signature database concurrently with metadata indexing; every
//! scan worker awaits the same [`Ready`] before touching the engine.  Unlike a wait group, a
//! dropped [`ReadySetter`] wakes the waiters with an error instead of hanging them, which is what
//! we want when initialization fails during shutdown.

use tokio::sync::watch;

/// Create a connected setter/waiter pair.
pub fn ready_pair<T: Clone + Send + Sync>() -> (ReadySetter<T>, Ready<T>) {
    let (tx, rx) = watch::channel(None);
    (ReadySetter(tx), Ready(rx))
}

/// Waiting side; cheap to clone, one clone per consumer.
#[derive(Clone)]
pub struct Ready<T>(watch::Receiver<Option<T>>);

impl<T: Clone> Ready<T> {
    /// Wait until the value is published.
    ///
    /// Returns `None` if the setter was dropped without publishing, i.e. initialization failed.
    pub async fn wait(&self) -> Option<T> {
        let mut rx = self.0.clone();

        loop {
            if let Some(value) = rx.borrow().as_ref() {
                return Some(value.clone());
            }

            if rx.changed().await.is_err() {
                // Setter dropped; one final look in case the value landed right before the drop
                return rx.borrow().clone();
            }
        }
    }
}

/// Publishing side; consumed by [`set`](Self::set).
pub struct ReadySetter<T>(watch::Sender<Option<T>>);

impl<T> ReadySetter<T> {
    /// Publish the value and wake every waiter.
    pub fn set(self, value: T) {
        // An error here just means nobody is waiting, which is fine
        let _ = self.0.send(Some(value));
    }
}
