//! Reference-counted per-VM statistics pollers.
//!
//! One background task polls each distinct `(host, vm)` that has at least
//! one subscriber; samples are broadcast over the event bus. The poller
//! stops when its subscriber set empties or when the VM leaves the running
//! state. Lock discipline: one mutex guards the subscription map, each
//! entry has its own mutex for the subscriber set and last sample; the
//! outer lock is always taken first and never held across an await.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, warn};
use virtumancer_driver::{VmSample, VmState};

use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::pool::ConnectionPool;

/// Identifies one UI session across the subscription map.
pub type SessionId = u64;

/// Default polling interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubKey {
    host_id: String,
    vm_name: String,
}

struct Subscription {
    subscribers: Mutex<HashSet<SessionId>>,
    last_sample: Mutex<Option<VmSample>>,
    stop: Notify,
}

impl Subscription {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashSet::new()),
            last_sample: Mutex::new(None),
            stop: Notify::new(),
        }
    }
}

pub struct SubscriptionManager {
    subscriptions: Mutex<HashMap<SubKey, Arc<Subscription>>>,
    pool: Arc<ConnectionPool>,
    bus: Arc<EventBus>,
    poll_interval: Duration,
}

impl SubscriptionManager {
    pub fn new(pool: Arc<ConnectionPool>, bus: Arc<EventBus>) -> Arc<Self> {
        Self::with_interval(pool, bus, POLL_INTERVAL)
    }

    pub fn with_interval(
        pool: Arc<ConnectionPool>,
        bus: Arc<EventBus>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            subscriptions: Mutex::new(HashMap::new()),
            pool,
            bus,
            poll_interval,
        })
    }

    /// Add a session to the `(host, vm)` subscription, creating it (and
    /// spawning its poller) when it does not exist yet.
    pub fn subscribe(self: &Arc<Self>, session: SessionId, host_id: &str, vm_name: &str) {
        let key = SubKey {
            host_id: host_id.to_string(),
            vm_name: vm_name.to_string(),
        };

        let (subscription, spawned) = {
            let mut map = self.subscriptions.lock().expect("subscription map lock");
            match map.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let created = Arc::new(Subscription::new());
                    map.insert(key.clone(), created.clone());
                    (created, true)
                }
            }
        };

        subscription
            .subscribers
            .lock()
            .expect("subscriber set lock")
            .insert(session);

        if spawned {
            debug!(host = %key.host_id, vm = %key.vm_name, "Starting stats poller");
            self.clone().spawn_poller(key, subscription);
        }
    }

    /// Remove a session; an emptied subscription is stopped and reaped.
    pub fn unsubscribe(&self, session: SessionId, host_id: &str, vm_name: &str) {
        let key = SubKey {
            host_id: host_id.to_string(),
            vm_name: vm_name.to_string(),
        };
        let subscription = {
            let map = self.subscriptions.lock().expect("subscription map lock");
            map.get(&key).cloned()
        };
        if let Some(subscription) = subscription {
            self.release(&key, &subscription, session);
        }
    }

    /// Drop a session from every subscription it appears in. Called on
    /// session close.
    pub fn unsubscribe_all(&self, session: SessionId) {
        let entries: Vec<(SubKey, Arc<Subscription>)> = {
            let map = self.subscriptions.lock().expect("subscription map lock");
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (key, subscription) in entries {
            self.release(&key, &subscription, session);
        }
    }

    /// Latest sample from an active poller, if any. Lets the one-shot
    /// stats endpoint piggyback instead of issuing an extra driver call.
    pub fn last_known(&self, host_id: &str, vm_name: &str) -> Option<VmSample> {
        let key = SubKey {
            host_id: host_id.to_string(),
            vm_name: vm_name.to_string(),
        };
        let subscription = {
            let map = self.subscriptions.lock().expect("subscription map lock");
            map.get(&key).cloned()
        }?;
        let sample = subscription
            .last_sample
            .lock()
            .expect("last sample lock")
            .clone();
        sample
    }

    /// Whether a poller currently exists for `(host, vm)`.
    pub fn is_active(&self, host_id: &str, vm_name: &str) -> bool {
        let key = SubKey {
            host_id: host_id.to_string(),
            vm_name: vm_name.to_string(),
        };
        self.subscriptions
            .lock()
            .expect("subscription map lock")
            .contains_key(&key)
    }

    fn release(&self, key: &SubKey, subscription: &Arc<Subscription>, session: SessionId) {
        let emptied = {
            let mut subscribers = subscription
                .subscribers
                .lock()
                .expect("subscriber set lock");
            subscribers.remove(&session) && subscribers.is_empty()
        };
        if emptied {
            subscription.stop.notify_one();
            self.remove_entry(key, subscription);
            debug!(host = %key.host_id, vm = %key.vm_name, "Subscription emptied, poller stopped");
        }
    }

    /// Remove the map entry, but only if it still points at this
    /// subscription (a replacement may have been created meanwhile).
    fn remove_entry(&self, key: &SubKey, subscription: &Arc<Subscription>) {
        let mut map = self.subscriptions.lock().expect("subscription map lock");
        if let Some(current) = map.get(key) {
            if Arc::ptr_eq(current, subscription) {
                map.remove(key);
            }
        }
    }

    fn spawn_poller(self: Arc<Self>, key: SubKey, subscription: Arc<Subscription>) {
        tokio::spawn(async move {
            let mut ticker = interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = subscription.stop.notified() => {
                        debug!(host = %key.host_id, vm = %key.vm_name, "Poller stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let sample = self.collect_sample(&key).await;
                        let state = sample.state;

                        *subscription
                            .last_sample
                            .lock()
                            .expect("last sample lock") = Some(sample.clone());

                        self.bus.publish(&Event::VmStatsUpdated {
                            host_id: key.host_id.clone(),
                            vm_name: key.vm_name.clone(),
                            sample,
                        });

                        if !state.is_running() {
                            debug!(
                                host = %key.host_id,
                                vm = %key.vm_name,
                                state = state.as_str(),
                                "VM left running state, reaping subscription"
                            );
                            self.remove_entry(&key, &subscription);
                            break;
                        }
                    }
                }
            }
        });
    }

    /// One poll. A failure substitutes a synthetic STOPPED sample so the
    /// UI observes the VM going away instead of a silent gap.
    async fn collect_sample(&self, key: &SubKey) -> VmSample {
        match self.try_collect(key).await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(host = %key.host_id, vm = %key.vm_name, error = %e, "Stats poll failed");
                VmSample::offline(VmState::Stopped, 0, 0)
            }
        }
    }

    async fn try_collect(&self, key: &SubKey) -> Result<VmSample> {
        let driver = self.pool.get(&key.host_id).await?;
        let domain = driver.lookup_domain(&key.vm_name).await?;
        Ok(driver.stats(&domain).await?)
    }
}
