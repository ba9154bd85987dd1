//! Control-plane facade: the operation surface the HTTP layer calls.
//!
//! Reads are served from the cache wherever it covers them; mutations go
//! through the driver and the reconciler, and state changes publish events
//! so connected UIs refetch. Background reconciliation keeps cached reads
//! fast without blocking request handlers.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};
use virtumancer_driver::{HostSystemInfo, HypervisorUri, VmSample};
use virtumancer_store::{HardwareView, HostRow, Store, StoreError, VmRow};

use crate::error::{ControlError, Result};
use crate::events::{Event, EventBus};
use crate::pool::ConnectionPool;
use crate::reconciler::Reconciler;
use crate::subscriptions::SubscriptionManager;

/// Request body for registering a host.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddHostRequest {
    pub id: String,
    pub uri: String,
}

pub struct ControlPlaneService {
    store: Store,
    pool: Arc<ConnectionPool>,
    reconciler: Reconciler,
    subscriptions: Arc<SubscriptionManager>,
    bus: Arc<EventBus>,
}

impl ControlPlaneService {
    pub fn new(
        store: Store,
        pool: Arc<ConnectionPool>,
        subscriptions: Arc<SubscriptionManager>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let reconciler = Reconciler::new(store.clone(), pool.clone());
        Arc::new(Self {
            store,
            pool,
            reconciler,
            subscriptions,
            bus,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Connect every stored host on process start. Individual failures are
    /// logged, never fatal; the UI can retry by re-adding or rebooting.
    pub async fn connect_stored_hosts(&self) {
        let hosts = match self.store.list_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate stored hosts");
                return;
            }
        };
        for host in hosts {
            match self.pool.add(&host.id, &host.uri).await {
                Ok(_) => {
                    info!(host = %host.id, "Reconnected stored host");
                    self.spawn_host_reconcile(host.id);
                }
                Err(e) => warn!(host = %host.id, error = %e, "Failed to reconnect stored host"),
            }
        }
    }

    /// Persist and connect a new host. The row is rolled back when the
    /// dial fails, so a stored host is always one that connected at least
    /// once.
    pub async fn add_host(&self, request: AddHostRequest) -> Result<HostRow> {
        let id = request.id.trim();
        if id.is_empty() {
            return Err(ControlError::InvalidRequest("host id is empty".to_string()));
        }
        // Validate before persisting; scheme errors are caller errors.
        HypervisorUri::parse(&request.uri)?;

        let host = self.store.insert_host(id, &request.uri).await?;

        if let Err(e) = self.pool.add(id, &request.uri).await {
            if let Err(rollback) = self.store.delete_host(id).await {
                warn!(host = %id, error = %rollback, "Failed to roll back host row");
            }
            return Err(e);
        }

        info!(host = %id, uri = %request.uri, "Host added");
        self.bus.publish(&Event::HostsChanged);
        self.spawn_host_reconcile(host.id.clone());
        Ok(host)
    }

    /// Disconnect (best-effort), cascade-delete the cached rows and the
    /// host row itself.
    pub async fn remove_host(&self, id: &str) -> Result<()> {
        self.pool.remove(id).await;
        self.store.delete_host(id).await?;
        info!(host = %id, "Host removed");
        self.bus.publish(&Event::HostsChanged);
        Ok(())
    }

    pub async fn list_hosts(&self) -> Result<Vec<HostRow>> {
        Ok(self.store.list_hosts().await?)
    }

    /// Live host information; never cached.
    pub async fn host_info(&self, id: &str) -> Result<HostSystemInfo> {
        let driver = self.pool.get(id).await?;
        Ok(driver.host_info().await?)
    }

    /// Cached VM list, with a background reconciliation kicked off so the
    /// cache converges shortly after.
    pub async fn list_vms(&self, host_id: &str) -> Result<Vec<VmRow>> {
        let rows = self.store.vms_for_host(host_id).await?;
        self.spawn_host_reconcile(host_id.to_string());
        Ok(rows)
    }

    /// Latest sample: piggyback on an active poller when one exists, fall
    /// back to a one-shot driver call.
    pub async fn vm_stats(&self, host_id: &str, vm_name: &str) -> Result<VmSample> {
        if let Some(sample) = self.subscriptions.last_known(host_id, vm_name) {
            return Ok(sample);
        }
        let driver = self.pool.get(host_id).await?;
        let domain = driver.lookup_domain(vm_name).await?;
        Ok(driver.stats(&domain).await?)
    }

    /// Reconcile the VM, then serve its normalized hardware from the cache.
    pub async fn vm_hardware(&self, host_id: &str, vm_name: &str) -> Result<HardwareView> {
        if self.reconciler.reconcile_vm(host_id, vm_name).await? {
            self.bus.publish(&Event::VmsChanged {
                host_id: host_id.to_string(),
            });
        }
        let row = self
            .store
            .vm_by_name(host_id, vm_name)
            .await?
            .ok_or_else(|| {
                ControlError::Store(StoreError::NotFound(format!("{host_id}/{vm_name}")))
            })?;
        Ok(self.store.hardware_for_vm(row.id).await?)
    }

    /// Execute a lifecycle verb, then reconcile; a cache change publishes
    /// `vms-changed`.
    pub async fn lifecycle(&self, host_id: &str, vm_name: &str, verb: &str) -> Result<()> {
        let driver = self.pool.get(host_id).await?;
        let domain = driver.lookup_domain(vm_name).await?;

        match verb {
            "start" => driver.start(&domain).await?,
            "shutdown" => driver.shutdown(&domain).await?,
            "reboot" => driver.reboot(&domain).await?,
            "forceoff" => driver.destroy(&domain).await?,
            "forcereset" => driver.reset(&domain).await?,
            other => {
                return Err(ControlError::InvalidRequest(format!(
                    "unknown lifecycle verb: {other}"
                )))
            }
        }
        info!(host = %host_id, vm = %vm_name, verb = %verb, "Lifecycle verb executed");

        if self.reconciler.reconcile_vm(host_id, vm_name).await? {
            self.bus.publish(&Event::VmsChanged {
                host_id: host_id.to_string(),
            });
        }
        Ok(())
    }

    /// Synchronous host reconciliation; publishes `vms-changed` on change.
    pub async fn reconcile_host(&self, host_id: &str) -> Result<bool> {
        let changed = self.reconciler.reconcile_host(host_id).await?;
        if changed {
            self.bus.publish(&Event::VmsChanged {
                host_id: host_id.to_string(),
            });
        }
        Ok(changed)
    }

    fn spawn_host_reconcile(&self, host_id: String) {
        let reconciler = self.reconciler.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            match reconciler.reconcile_host(&host_id).await {
                Ok(true) => bus.publish(&Event::VmsChanged { host_id }),
                Ok(false) => {}
                Err(e) => {
                    warn!(host = %host_id, error = %e, "Background reconciliation failed")
                }
            }
        });
    }
}
