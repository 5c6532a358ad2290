//! Alert listener registry

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::engine::{Alert, AlertType};

/// Receives engine alerts from the session's dispatch task.
///
/// Callbacks run on the dispatch task, one alert at a time and in engine
/// order. They must not block.
pub trait AlertListener: Send + Sync {
    /// Alert types this listener wants. Empty means every type.
    fn alert_types(&self) -> &[AlertType];

    fn on_alert(&self, alert: &Alert);
}

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mutex-guarded listener list that is snapshotted before each dispatch,
/// so subscription changes never race with an in-progress delivery.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionId, Arc<dyn AlertListener>)>>,
}

impl ListenerRegistry {
    pub(crate) fn add(&self, listener: Arc<dyn AlertListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn clear(&self) {
        self.listeners.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Delivers `alert` to every interested listener. A panicking listener
    /// is logged and skipped.
    pub(crate) fn dispatch(&self, alert: &Alert) {
        let alert_type = alert.alert_type();
        let interested: Vec<(SubscriptionId, Arc<dyn AlertListener>)> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, listener)| {
                let types = listener.alert_types();
                types.is_empty() || types.contains(&alert_type)
            })
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in interested {
            if catch_unwind(AssertUnwindSafe(|| listener.on_alert(alert))).is_err() {
                tracing::error!("Alert listener {} panicked handling {}", id, alert_type);
            }
        }
    }
}
