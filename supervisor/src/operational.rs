//! Broadcast of the watcher's "usable right now" flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Called with `true` when the watcher gains a live daemon subscription and
/// `false` when it loses one.
pub type OperationalCallback = Arc<dyn Fn(bool) + Send + Sync>;

const DEFAULT_CAPACITY: usize = 16;

/// Republishes the operational flag to any number of observers.
///
/// Construct one at startup and hand clones to whoever needs it.
#[derive(Clone)]
pub struct OperationalStateBroadcaster {
    inner: Arc<Inner>,
}

struct Inner {
    sender: broadcast::Sender<bool>,
    last: AtomicBool,
}

impl OperationalStateBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                sender,
                last: AtomicBool::new(false),
            }),
        }
    }

    pub fn publish(&self, operational: bool) {
        self.inner.last.store(operational, Ordering::SeqCst);
        tracing::debug!("operational state: {operational}");
        // No receivers is fine.
        let _ = self.inner.sender.send(operational);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.inner.sender.subscribe()
    }

    /// Last published value; `false` before anything was published.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.inner.last.load(Ordering::SeqCst)
    }

    /// A callback that publishes here, for [`crate::PassiveWatcherSupervisor::new`].
    #[must_use]
    pub fn as_callback(&self) -> OperationalCallback {
        let broadcaster = self.clone();
        Arc::new(move |operational: bool| broadcaster.publish(operational))
    }
}

impl Default for OperationalStateBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for OperationalStateBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationalStateBroadcaster")
            .field("operational", &self.is_operational())
            .field("receivers", &self.inner.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_to_every_subscriber() {
        let broadcaster = OperationalStateBroadcaster::default();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();
        assert!(!broadcaster.is_operational());

        broadcaster.publish(true);
        broadcaster.publish(false);

        assert!(a.recv().await.unwrap());
        assert!(!a.recv().await.unwrap());
        assert!(b.recv().await.unwrap());
        assert!(!broadcaster.is_operational());
    }

    #[test]
    fn publishing_without_subscribers_still_records() {
        let broadcaster = OperationalStateBroadcaster::new(4);
        let callback = broadcaster.as_callback();
        callback(true);
        assert!(broadcaster.is_operational());
    }
}
