//! Daemon wiring and HTTPS server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;
use tracing::{debug, info, warn};
use virtumancer_driver::{Connector, MockConnector};
use virtumancer_store::Store;

use crate::config::{Config, HypervisorBackend};
use crate::events::EventBus;
use crate::http;
use crate::pool::ConnectionPool;
use crate::service::ControlPlaneService;
use crate::subscriptions::SubscriptionManager;
use crate::tls::TlsManager;

/// Run the daemon until the server exits.
pub async fn run(config: Config) -> Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    let store = Store::open(&config.database.path).await?;

    let connector: Arc<dyn Connector> = match config.hypervisor.backend {
        HypervisorBackend::Mock => {
            info!("Using mock hypervisor connector");
            Arc::new(MockConnector::new())
        }
        HypervisorBackend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                info!("Using libvirt hypervisor connector");
                Arc::new(virtumancer_driver::LibvirtConnector)
            }
            #[cfg(not(feature = "libvirt"))]
            {
                warn!("Libvirt backend requested but not compiled in, falling back to mock");
                Arc::new(MockConnector::new())
            }
        }
    };

    let bus = Arc::new(EventBus::new());
    let pool = Arc::new(ConnectionPool::new(connector));
    let subscriptions = SubscriptionManager::new(pool.clone(), bus.clone());
    let service = ControlPlaneService::new(store, pool, subscriptions, bus);

    // Reconnect every stored host; individual failures are logged only.
    service.connect_stored_hosts().await;

    let tls_manager = TlsManager::new(config.server.tls.clone());
    tls_manager.ensure_certificates().await?;

    let rustls_config = RustlsConfig::from_pem_file(
        &config.server.tls.cert_path,
        &config.server.tls.key_path,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to load TLS certificates: {e}"))?;

    let addr: SocketAddr = config
        .server
        .listen_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {e}"))?;

    let app = http::router(service);

    info!(
        address = %addr,
        cert = %config.server.tls.cert_path,
        "Starting HTTPS server"
    );

    axum_server::bind_rustls(addr, rustls_config)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
