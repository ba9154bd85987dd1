//! Pool of live hypervisor connections, one per host id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use virtumancer_driver::{Connector, Driver};

use crate::error::{ControlError, Result};

/// Map of host id to live driver handle under a read-biased lock.
///
/// The lock guards only the map; callers receive a cloned `Arc` handle and
/// make driver calls with no lock held (the handle is independently safe).
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// Dial `uri` and register the handle under `host_id`.
    ///
    /// Fails with `AlreadyConnected` when the id is present; a failed dial
    /// leaves no entry behind.
    pub async fn add(&self, host_id: &str, uri: &str) -> Result<Arc<dyn Driver>> {
        if self.drivers.read().await.contains_key(host_id) {
            return Err(ControlError::AlreadyConnected(host_id.to_string()));
        }

        // Dial with no lock held.
        let driver = self.connector.connect(uri).await?;

        let mut drivers = self.drivers.write().await;
        if drivers.contains_key(host_id) {
            drop(drivers);
            if let Err(e) = driver.disconnect().await {
                warn!(host = %host_id, error = %e, "Error discarding duplicate connection");
            }
            return Err(ControlError::AlreadyConnected(host_id.to_string()));
        }
        drivers.insert(host_id.to_string(), driver.clone());
        info!(host = %host_id, "Hypervisor connection added to pool");
        Ok(driver)
    }

    /// Disconnect (best-effort) and drop the entry.
    pub async fn remove(&self, host_id: &str) {
        let driver = self.drivers.write().await.remove(host_id);
        if let Some(driver) = driver {
            if let Err(e) = driver.disconnect().await {
                warn!(host = %host_id, error = %e, "Error disconnecting hypervisor");
            }
            info!(host = %host_id, "Hypervisor connection removed from pool");
        }
    }

    /// Fetch the live handle for a host.
    pub async fn get(&self, host_id: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .read()
            .await
            .get(host_id)
            .cloned()
            .ok_or_else(|| ControlError::NotConnected(host_id.to_string()))
    }

    pub async fn contains(&self, host_id: &str) -> bool {
        self.drivers.read().await.contains_key(host_id)
    }
}
