//! The HTTP endpoint's `{id -> SubscriberRuntime}` table backing
//! `?terminate=<id>`. Protected by one mutex, entries removed when the
//! runtime they name exits.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::subscriber::TerminationHandle;

#[derive(Default)]
pub struct Registry {
    subscriptions: Mutex<HashMap<String, TerminationHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: String, handle: TerminationHandle) {
        self.subscriptions.lock().unwrap().insert(id, handle);
    }

    pub fn remove(&self, id: &str) {
        self.subscriptions.lock().unwrap().remove(id);
    }

    /// Requests termination of the named subscription. Returns `false`
    /// if no subscription with that id is currently registered.
    pub fn terminate(&self, id: &str) -> bool {
        match self.subscriptions.lock().unwrap().get(id) {
            Some(handle) => {
                handle.request_terminate();
                true
            }
            None => false,
        }
    }

    /// Ids of every subscription currently registered, in no particular
    /// order. Exposed for admin/monitoring use, not wired to any HTTP route.
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::persister::MemoryPersister;
    use crate::stream::Stream;
    use crate::subscriber::CallbackResponse;
    use std::sync::Arc;

    #[test]
    fn terminate_unknown_id_reports_false() {
        let registry = Registry::new();
        assert!(!registry.terminate("nope"));
    }

    #[test]
    fn terminate_known_id_stops_subscriber() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new(0));
        let stream = Stream::new(Arc::new(MemoryPersister::<String>::new()), clock);
        let scope = stream
            .subscribe(|_entry, _idxts, _last| CallbackResponse::More)
            .unwrap();

        let registry = Registry::new();
        registry.insert("abc".into(), scope.termination_handle());
        assert_eq!(registry.active_subscriptions(), vec!["abc".to_string()]);
        assert!(registry.terminate("abc"));
        scope.join();
        registry.remove("abc");
        assert!(registry.active_subscriptions().is_empty());
    }
}
