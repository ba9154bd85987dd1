//! Facade-level tests over a mock connector and an in-memory cache.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use virtumancer_driver::{Driver, GraphicsKind, MockConnector, MockDomain, MockDriver, VmState};
use virtumancer_server::service::AddHostRequest;
use virtumancer_server::{ConnectionPool, ControlPlaneService, EventBus, SubscriptionManager};
use virtumancer_store::Store;

const URI_A: &str = "qemu+ssh://root@kvm-a.example/system";
const URI_B: &str = "qemu+ssh://root@kvm-b.example/system";

struct Harness {
    service: Arc<ControlPlaneService>,
    connector: Arc<MockConnector>,
    store: Store,
    pool: Arc<ConnectionPool>,
    bus: Arc<EventBus>,
    subscriptions: Arc<SubscriptionManager>,
}

async fn harness() -> Harness {
    harness_with_interval(Duration::from_millis(10)).await
}

async fn harness_with_interval(poll_interval: Duration) -> Harness {
    let store = Store::open_in_memory().await.unwrap();
    let connector = Arc::new(MockConnector::with_registry());
    let bus = Arc::new(EventBus::new());
    let pool = Arc::new(ConnectionPool::new(connector.clone()));
    let subscriptions = SubscriptionManager::with_interval(pool.clone(), bus.clone(), poll_interval);
    let service = ControlPlaneService::new(
        store.clone(),
        pool.clone(),
        subscriptions.clone(),
        bus.clone(),
    );
    Harness {
        service,
        connector,
        store,
        pool,
        bus,
        subscriptions,
    }
}

impl Harness {
    /// Register a mock driver and connect it without going through
    /// `add_host`, so no background reconciliation races the test.
    async fn connect_host(&self, host_id: &str, uri: &str) -> Arc<MockDriver> {
        let driver = self.connector.register(uri, Arc::new(MockDriver::new()));
        self.store.insert_host(host_id, uri).await.unwrap();
        self.pool.add(host_id, uri).await.unwrap();
        driver
    }
}

async fn recv_event_kind(rx: &mut mpsc::Receiver<String>, kind: &str) -> Value {
    loop {
        let message = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let value: Value = serde_json::from_str(&message).unwrap();
        if value["type"] == kind {
            return value;
        }
    }
}

#[tokio::test]
async fn add_host_persists_connects_and_publishes() {
    let h = harness().await;
    let (_id, mut rx) = h.bus.register();
    h.connector.register(URI_A, Arc::new(MockDriver::new()));

    let host = h
        .service
        .add_host(AddHostRequest {
            id: "host-a".to_string(),
            uri: URI_A.to_string(),
        })
        .await
        .unwrap();

    assert_eq!(host.id, "host-a");
    assert!(h.store.get_host("host-a").await.unwrap().is_some());
    assert!(h.pool.contains("host-a").await);

    recv_event_kind(&mut rx, "hosts-changed").await;
}

#[tokio::test]
async fn add_host_rolls_back_row_on_connect_failure() {
    let h = harness().await;
    h.connector.register(URI_A, Arc::new(MockDriver::new()));
    h.connector.fail_uri(URI_A);

    let err = h
        .service
        .add_host(AddHostRequest {
            id: "host-a".to_string(),
            uri: URI_A.to_string(),
        })
        .await
        .unwrap_err();

    assert!(!err.is_invalid());
    assert!(h.store.get_host("host-a").await.unwrap().is_none());
    assert!(!h.pool.contains("host-a").await);
}

#[tokio::test]
async fn add_host_rejects_bad_input() {
    let h = harness().await;

    let empty_id = h
        .service
        .add_host(AddHostRequest {
            id: "  ".to_string(),
            uri: URI_A.to_string(),
        })
        .await
        .unwrap_err();
    assert!(empty_id.is_invalid());

    let bad_scheme = h
        .service
        .add_host(AddHostRequest {
            id: "host-a".to_string(),
            uri: "vbox://host/system".to_string(),
        })
        .await
        .unwrap_err();
    assert!(bad_scheme.is_invalid());
    assert!(h.store.get_host("host-a").await.unwrap().is_none());
}

#[tokio::test]
async fn reconcile_mirrors_live_domains_and_is_idempotent() {
    let h = harness().await;
    let driver = h.connect_host("host-a", URI_A).await;
    driver.add_domain("vm1", MockDomain::new("uuid-1"));
    driver.add_domain(
        "vm2",
        MockDomain::new("uuid-2").with_state(VmState::Stopped),
    );

    assert!(h.service.reconcile_host("host-a").await.unwrap());

    let rows = h.store.vms_for_host("host-a").await.unwrap();
    assert_eq!(rows.len(), 2);
    let vm1 = rows.iter().find(|r| r.name == "vm1").unwrap();
    assert_eq!(vm1.domain_uuid, "uuid-1");
    assert_eq!(vm1.internal_uuid, "uuid-1");
    assert_eq!(vm1.state, "ACTIVE");
    let vm2 = rows.iter().find(|r| r.name == "vm2").unwrap();
    assert_eq!(vm2.state, "STOPPED");

    // Nothing changed on the hypervisor: the second pass mutates nothing.
    assert!(!h.service.reconcile_host("host-a").await.unwrap());
}

#[tokio::test]
async fn cross_host_uuid_conflict_mints_internal_uuid() {
    let h = harness().await;

    let driver_a = h.connect_host("host-a", URI_A).await;
    driver_a.add_domain("d", MockDomain::new("uuid-shared"));
    h.service.reconcile_host("host-a").await.unwrap();

    // Host B reports a domain with the same hypervisor UUID (clone/restore).
    let driver_b = h.connect_host("host-b", URI_B).await;
    driver_b.add_domain("d2", MockDomain::new("uuid-shared"));
    h.service.reconcile_host("host-b").await.unwrap();

    let row_a = &h.store.vms_for_host("host-a").await.unwrap()[0];
    let row_b = &h.store.vms_for_host("host-b").await.unwrap()[0];

    assert_eq!(row_a.domain_uuid, "uuid-shared");
    assert_eq!(row_a.internal_uuid, "uuid-shared");
    assert_eq!(row_b.domain_uuid, "uuid-shared");
    assert_ne!(row_b.internal_uuid, "uuid-shared");
    assert_ne!(row_a.internal_uuid, row_b.internal_uuid);
}

#[tokio::test]
async fn reconcile_prunes_vanished_domains() {
    let h = harness().await;
    let driver = h.connect_host("host-a", URI_A).await;
    for i in 1..=3 {
        driver.add_domain(&format!("vm{i}"), MockDomain::new(format!("uuid-{i}")));
    }
    h.service.reconcile_host("host-a").await.unwrap();
    assert_eq!(h.store.vms_for_host("host-a").await.unwrap().len(), 3);

    driver.remove_domain("vm2");
    assert!(h.service.reconcile_host("host-a").await.unwrap());

    let rows = h.store.vms_for_host("host-a").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.domain_uuid != "uuid-2"));
}

#[tokio::test]
async fn remove_host_leaves_no_rows_behind() {
    let h = harness().await;
    let driver = h.connect_host("host-a", URI_A).await;
    driver.add_domain(
        "vm1",
        MockDomain::new("uuid-1")
            .with_disk("/img/vm1.qcow2", "vda")
            .with_interface("52:54:00:aa:bb:01", "br0", "vnet0")
            .with_graphics(GraphicsKind::Vnc, 5901, "0.0.0.0"),
    );
    h.service.reconcile_host("host-a").await.unwrap();

    h.service.remove_host("host-a").await.unwrap();

    assert!(h.service.list_hosts().await.unwrap().is_empty());
    assert!(h.store.vms_for_host("host-a").await.unwrap().is_empty());
    assert!(!h.pool.contains("host-a").await);
    assert!(!driver.is_connected());
}

#[tokio::test]
async fn hardware_sync_yields_one_row_per_device() {
    let h = harness().await;
    let driver = h.connect_host("host-a", URI_A).await;
    driver.add_domain(
        "vm1",
        MockDomain::new("uuid-1")
            .with_disk("/img/vm1.qcow2", "vda")
            .with_interface("52:54:00:aa:bb:01", "br0", "vnet0")
            .with_graphics(GraphicsKind::Spice, 5930, "127.0.0.1"),
    );

    let hardware = h.service.vm_hardware("host-a", "vm1").await.unwrap();
    assert_eq!(hardware.disks.len(), 1);
    assert_eq!(hardware.disks[0].path, "/img/vm1.qcow2");
    assert_eq!(hardware.interfaces.len(), 1);
    assert_eq!(hardware.interfaces[0].mac_address, "52:54:00:aa:bb:01");
    assert_eq!(hardware.graphics, vec!["spice".to_string()]);

    // Force another full sync; the MAC-keyed port must not duplicate.
    driver.set_state("vm1", VmState::Paused);
    let hardware = h.service.vm_hardware("host-a", "vm1").await.unwrap();
    assert_eq!(hardware.disks.len(), 1);
    assert_eq!(hardware.interfaces.len(), 1);
    assert_eq!(hardware.graphics.len(), 1);
}

#[tokio::test]
async fn hardware_only_change_is_resynced() {
    let h = harness().await;
    let driver = h.connect_host("host-a", URI_A).await;
    driver.add_domain(
        "vm1",
        MockDomain::new("uuid-1")
            .with_disk("/img/vm1.qcow2", "vda")
            .with_interface("52:54:00:aa:bb:01", "br0", "vnet0"),
    );

    let hardware = h.service.vm_hardware("host-a", "vm1").await.unwrap();
    assert_eq!(hardware.disks.len(), 1);
    assert_eq!(hardware.interfaces.len(), 1);

    // Hot-attach a disk and a NIC: name, state, vcpu and memory are all
    // unchanged, only the device set differs.
    driver.add_domain(
        "vm1",
        MockDomain::new("uuid-1")
            .with_disk("/img/vm1.qcow2", "vda")
            .with_disk("/img/vm1-data.qcow2", "vdb")
            .with_interface("52:54:00:aa:bb:01", "br0", "vnet0")
            .with_interface("52:54:00:aa:bb:02", "br1", "vnet1"),
    );

    let hardware = h.service.vm_hardware("host-a", "vm1").await.unwrap();
    assert_eq!(hardware.disks.len(), 2);
    assert!(hardware
        .disks
        .iter()
        .any(|d| d.path == "/img/vm1-data.qcow2"));
    assert_eq!(hardware.interfaces.len(), 2);
    assert!(hardware
        .interfaces
        .iter()
        .any(|p| p.mac_address == "52:54:00:aa:bb:02" && p.bridge_name == "br1"));

    // The cache now mirrors the live hardware: another pass mutates nothing.
    assert!(!h.service.reconcile_host("host-a").await.unwrap());
}

#[tokio::test]
async fn vm_hardware_for_missing_vm_is_not_found() {
    let h = harness().await;
    h.connect_host("host-a", URI_A).await;

    let err = h.service.vm_hardware("host-a", "ghost").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn forceoff_updates_cache_publishes_and_reaps_poller() {
    let h = harness().await;
    let driver = h.connect_host("host-a", URI_A).await;
    driver.add_domain("vm1", MockDomain::new("uuid-1"));
    h.service.reconcile_host("host-a").await.unwrap();

    h.subscriptions.subscribe(1, "host-a", "vm1");
    let (_id, mut rx) = h.bus.register();

    h.service.lifecycle("host-a", "vm1", "forceoff").await.unwrap();

    let row = h
        .store
        .vm_by_name("host-a", "vm1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.state, "STOPPED");

    recv_event_kind(&mut rx, "vms-changed").await;

    // The poller observes the stopped state, emits a final sample and exits.
    // An in-flight running sample may still arrive first.
    loop {
        let value = recv_event_kind(&mut rx, "vm-stats-updated").await;
        if value["payload"]["stats"]["state"] == "STOPPED" {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.subscriptions.is_active("host-a", "vm1"));
}

#[tokio::test]
async fn unknown_lifecycle_verb_is_rejected() {
    let h = harness().await;
    let driver = h.connect_host("host-a", URI_A).await;
    driver.add_domain("vm1", MockDomain::new("uuid-1"));

    let err = h
        .service
        .lifecycle("host-a", "vm1", "explode")
        .await
        .unwrap_err();
    assert!(err.is_invalid());
}

#[tokio::test]
async fn vm_stats_piggybacks_on_active_poller() {
    // Long interval: only the immediate first tick fires during the test,
    // so the poller cannot observe the disconnect below.
    let h = harness_with_interval(Duration::from_secs(30)).await;
    let driver = h.connect_host("host-a", URI_A).await;
    driver.add_domain("vm1", MockDomain::new("uuid-1"));

    h.subscriptions.subscribe(1, "host-a", "vm1");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Even with the connection gone, the last known sample is served.
    driver.disconnect().await.unwrap();
    let sample = h.service.vm_stats("host-a", "vm1").await.unwrap();
    assert_eq!(sample.state, VmState::Active);

    h.subscriptions.unsubscribe(1, "host-a", "vm1");
}

#[tokio::test]
async fn vm_stats_falls_back_to_one_shot_driver_call() {
    let h = harness().await;
    let driver = h.connect_host("host-a", URI_A).await;
    driver.add_domain(
        "vm1",
        MockDomain::new("uuid-1").with_state(VmState::Stopped),
    );

    let sample = h.service.vm_stats("host-a", "vm1").await.unwrap();
    assert_eq!(sample.state, VmState::Stopped);
    assert_eq!(sample.cpu_time_ns, 0);
}

#[tokio::test]
async fn operations_on_unknown_host_fail_cleanly() {
    let h = harness().await;

    assert!(h.service.host_info("ghost").await.is_err());
    assert!(h.service.vm_stats("ghost", "vm1").await.is_err());
    assert!(h.service.reconcile_host("ghost").await.is_err());
}
