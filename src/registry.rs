//! Process-local connection registry (spec.md §5 "Connection registry"):
//! a map of canonical device key to a live-connection handle, used only for
//! diagnostics and graceful-shutdown accounting by the Listener/Supervisor —
//! never consulted by the parsing path (spec.md §5's explicit constraint).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Bookkeeping for one live connection: its cancellation handle and the
/// last timestamp observed on it.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub cancel: CancellationToken,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the live connection for `canonical_key`, returning a guard
    /// that deregisters it on drop regardless of which exit path the
    /// connection task takes.
    pub fn register(self: &Arc<Self>, canonical_key: String, cancel: CancellationToken) -> RegistrationGuard {
        self.connections
            .lock()
            .unwrap()
            .insert(canonical_key.clone(), ConnectionHandle { cancel, last_seen: Utc::now() });
        RegistrationGuard { registry: self.clone(), canonical_key }
    }

    /// Updates the last-seen timestamp for an already-registered connection.
    /// A no-op if the connection was never registered (diagnostics only).
    pub fn touch(&self, canonical_key: &str, ts: DateTime<Utc>) {
        if let Some(handle) = self.connections.lock().unwrap().get_mut(canonical_key) {
            handle.last_seen = ts;
        }
    }

    fn deregister(&self, canonical_key: &str) {
        self.connections.lock().unwrap().remove(canonical_key);
    }

    /// Canonical keys of every connection this process currently considers
    /// live. Diagnostic/shutdown use only.
    pub fn active_connections(&self) -> Vec<String> {
        self.connections.lock().unwrap().keys().cloned().collect()
    }
}

pub struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    canonical_key: String,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.canonical_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_drop_removes_entry() {
        let registry = Arc::new(ConnectionRegistry::new());
        {
            let _guard = registry.register("TFMS90_100".to_string(), CancellationToken::new());
            assert_eq!(registry.active_connections(), vec!["TFMS90_100".to_string()]);
        }
        assert!(registry.active_connections().is_empty());
    }

    #[test]
    fn touch_updates_last_seen_for_registered_key_only() {
        let registry = Arc::new(ConnectionRegistry::new());
        let _guard = registry.register("TFMS90_100".to_string(), CancellationToken::new());
        let ts = Utc::now();
        registry.touch("TFMS90_100", ts);
        registry.touch("unknown", ts); // no-op, must not panic
        assert_eq!(registry.connections.lock().unwrap()["TFMS90_100"].last_seen, ts);
    }
}
