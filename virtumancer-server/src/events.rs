//! In-process pub/sub of typed events to connected UI clients.
//!
//! Each client owns a bounded channel. Publishing serializes the event
//! once and offers it to every client without blocking; a client whose
//! buffer is full is considered slow and evicted. Delivery is best-effort:
//! no retries, no backfill - reconnecting clients refetch state over HTTP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use virtumancer_driver::VmSample;

/// Outbound buffer size per client, in messages.
pub const CLIENT_BUFFER: usize = 32;

/// Identifies one registered UI client.
pub type ClientId = u64;

/// Typed event published to the UI.
#[derive(Debug, Clone)]
pub enum Event {
    HostsChanged,
    VmsChanged {
        host_id: String,
    },
    VmStatsUpdated {
        host_id: String,
        vm_name: String,
        sample: VmSample,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::HostsChanged => "hosts-changed",
            Event::VmsChanged { .. } => "vms-changed",
            Event::VmStatsUpdated { .. } => "vm-stats-updated",
        }
    }

    fn payload(&self) -> Value {
        match self {
            Event::HostsChanged => Value::Null,
            Event::VmsChanged { host_id } => json!({ "hostId": host_id }),
            Event::VmStatsUpdated {
                host_id,
                vm_name,
                sample,
            } => json!({ "hostId": host_id, "vmName": vm_name, "stats": sample }),
        }
    }

    /// Wire form: `{"type": ..., "payload": ...}`.
    pub fn to_json(&self) -> String {
        json!({ "type": self.kind(), "payload": self.payload() }).to_string()
    }
}

/// Fan-out registry of connected UI clients.
pub struct EventBus {
    clients: Mutex<HashMap<ClientId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a client, returning its id and the receiving end of its
    /// outbound channel.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        self.clients.lock().expect("event bus lock").insert(id, tx);
        debug!(client = id, "Event bus client registered");
        (id, rx)
    }

    pub fn unregister(&self, id: ClientId) {
        if self
            .clients
            .lock()
            .expect("event bus lock")
            .remove(&id)
            .is_some()
        {
            debug!(client = id, "Event bus client unregistered");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("event bus lock").len()
    }

    /// Serialize once and offer to every client. Slow or closed clients
    /// are evicted; their channel closes when the sender drops.
    pub fn publish(&self, event: &Event) {
        let message = event.to_json();

        let targets: Vec<(ClientId, mpsc::Sender<String>)> = {
            let clients = self.clients.lock().expect("event bus lock");
            clients.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        let mut evicted = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = id, kind = event.kind(), "Evicting slow event bus client");
                    evicted.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(id),
            }
        }

        if !evicted.is_empty() {
            let mut clients = self.clients.lock().expect("event bus lock");
            for id in evicted {
                clients.remove(&id);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_serialize_with_type_and_payload() {
        let event = Event::VmsChanged {
            host_id: "h1".to_string(),
        };
        let value: Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], "vms-changed");
        assert_eq!(value["payload"]["hostId"], "h1");

        let hosts: Value =
            serde_json::from_str(&Event::HostsChanged.to_json()).unwrap();
        assert_eq!(hosts["payload"], Value::Null);
    }

    #[tokio::test]
    async fn slow_client_is_evicted_fast_client_unaffected() {
        let bus = EventBus::new();
        let (_slow_id, mut slow_rx) = bus.register();
        let (_fast_id, mut fast_rx) = bus.register();

        // The fast client drains between publishes; the slow one never reads.
        for i in 0..CLIENT_BUFFER + 8 {
            bus.publish(&Event::VmsChanged {
                host_id: format!("h{i}"),
            });
            assert!(fast_rx.recv().await.is_some());
        }

        assert_eq!(bus.client_count(), 1);

        // The slow client got exactly one buffer's worth before its channel
        // closed on eviction.
        let mut received = 0;
        while slow_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CLIENT_BUFFER);
        assert!(slow_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unregister_removes_client() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.register();
        assert_eq!(bus.client_count(), 1);

        bus.unregister(id);
        assert_eq!(bus.client_count(), 0);
        assert!(rx.recv().await.is_none());
    }
}
