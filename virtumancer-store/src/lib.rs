//! Persistent relational cache for the Virtumancer control plane.
//!
//! A single SQLite database file mirrors the hypervisor inventory: hosts,
//! their virtual machines and the normalized hardware graph (volumes,
//! networks, MAC-keyed ports, graphics devices). The schema is created
//! idempotently at startup. All reconciliation mutations run inside one
//! transaction obtained through [`Store::begin`]; plain reads go through
//! the pool directly.

pub mod models;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::info;

pub use models::*;

/// Errors from the persistent cache.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS hosts (
        id  TEXT PRIMARY KEY,
        uri TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS virtual_machines (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        host_id       TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
        name          TEXT NOT NULL,
        internal_uuid TEXT NOT NULL UNIQUE,
        domain_uuid   TEXT NOT NULL,
        description   TEXT NOT NULL DEFAULT '',
        state         TEXT NOT NULL,
        vcpu_count    INTEGER NOT NULL,
        memory_bytes  INTEGER NOT NULL,
        UNIQUE (host_id, domain_uuid),
        UNIQUE (host_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS volumes (
        id     INTEGER PRIMARY KEY AUTOINCREMENT,
        path   TEXT NOT NULL UNIQUE,
        format TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS volume_attachments (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        vm_id       INTEGER NOT NULL REFERENCES virtual_machines(id) ON DELETE CASCADE,
        volume_id   INTEGER NOT NULL REFERENCES volumes(id),
        device_name TEXT NOT NULL,
        bus_type    TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS networks (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid        TEXT NOT NULL UNIQUE,
        host_id     TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
        bridge_name TEXT NOT NULL,
        UNIQUE (host_id, bridge_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ports (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        vm_id       INTEGER REFERENCES virtual_machines(id) ON DELETE SET NULL,
        mac_address TEXT NOT NULL UNIQUE,
        device_name TEXT NOT NULL DEFAULT '',
        model_name  TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS port_bindings (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        port_id    INTEGER NOT NULL REFERENCES ports(id) ON DELETE CASCADE,
        network_id INTEGER NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
        UNIQUE (port_id, network_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS graphics_devices (
        id   INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS graphics_device_attachments (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        vm_id              INTEGER NOT NULL REFERENCES virtual_machines(id) ON DELETE CASCADE,
        graphics_device_id INTEGER NOT NULL REFERENCES graphics_devices(id)
    )
    "#,
];

/// Handle to the cache database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database file and run migrations.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(StoreError::Query)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_lazy_with(options);
        let store = Self { pool };
        store.migrate().await?;

        info!(path = %path, "Cache database initialized");
        Ok(store)
    }

    /// In-memory database for tests. Limited to one connection so every
    /// query sees the same memory store.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Query)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Begin a reconciliation transaction.
    pub async fn begin(&self) -> Result<StoreTx> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    // -------------------------------------------------------------------
    // Hosts
    // -------------------------------------------------------------------

    pub async fn list_hosts(&self) -> Result<Vec<HostRow>> {
        Ok(
            sqlx::query_as::<_, HostRow>("SELECT id, uri FROM hosts ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn get_host(&self, id: &str) -> Result<Option<HostRow>> {
        Ok(
            sqlx::query_as::<_, HostRow>("SELECT id, uri FROM hosts WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn insert_host(&self, id: &str, uri: &str) -> Result<HostRow> {
        sqlx::query("INSERT INTO hosts (id, uri) VALUES (?, ?)")
            .bind(id)
            .bind(uri)
            .execute(&self.pool)
            .await?;
        Ok(HostRow {
            id: id.to_string(),
            uri: uri.to_string(),
        })
    }

    /// Delete a host. VM rows, networks and their dependents cascade.
    pub async fn delete_host(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM hosts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Virtual machines (reads)
    // -------------------------------------------------------------------

    pub async fn vms_for_host(&self, host_id: &str) -> Result<Vec<VmRow>> {
        Ok(sqlx::query_as::<_, VmRow>(
            "SELECT * FROM virtual_machines WHERE host_id = ? ORDER BY name",
        )
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn vm_by_name(&self, host_id: &str, name: &str) -> Result<Option<VmRow>> {
        Ok(sqlx::query_as::<_, VmRow>(
            "SELECT * FROM virtual_machines WHERE host_id = ? AND name = ?",
        )
        .bind(host_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?)
    }

    // -------------------------------------------------------------------
    // Hardware (reads)
    // -------------------------------------------------------------------

    pub async fn hardware_for_vm(&self, vm_id: i64) -> Result<HardwareView> {
        let disks = sqlx::query_as::<_, DiskAttachmentView>(
            r#"
            SELECT va.device_name, va.bus_type, v.path, v.format
            FROM volume_attachments va
            JOIN volumes v ON v.id = va.volume_id
            WHERE va.vm_id = ?
            ORDER BY va.device_name
            "#,
        )
        .bind(vm_id)
        .fetch_all(&self.pool)
        .await?;

        let interfaces = sqlx::query_as::<_, PortView>(
            r#"
            SELECT p.mac_address, p.device_name, p.model_name, n.bridge_name
            FROM ports p
            JOIN port_bindings pb ON pb.port_id = p.id
            JOIN networks n ON n.id = pb.network_id
            WHERE p.vm_id = ?
            ORDER BY p.mac_address
            "#,
        )
        .bind(vm_id)
        .fetch_all(&self.pool)
        .await?;

        let graphics = sqlx::query_scalar::<_, String>(
            r#"
            SELECT gd.kind
            FROM graphics_device_attachments ga
            JOIN graphics_devices gd ON gd.id = ga.graphics_device_id
            WHERE ga.vm_id = ?
            ORDER BY gd.kind
            "#,
        )
        .bind(vm_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(HardwareView {
            disks,
            interfaces,
            graphics,
        })
    }
}

/// One open reconciliation transaction.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Virtual machines
    // -------------------------------------------------------------------

    pub async fn vm_by_domain_uuid(
        &mut self,
        host_id: &str,
        domain_uuid: &str,
    ) -> Result<Option<VmRow>> {
        Ok(sqlx::query_as::<_, VmRow>(
            "SELECT * FROM virtual_machines WHERE host_id = ? AND domain_uuid = ?",
        )
        .bind(host_id)
        .bind(domain_uuid)
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    /// Whether any other host caches a row with the same domain UUID.
    pub async fn domain_uuid_on_other_host(
        &mut self,
        host_id: &str,
        domain_uuid: &str,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM virtual_machines WHERE domain_uuid = ? AND host_id != ?",
        )
        .bind(domain_uuid)
        .bind(host_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count > 0)
    }

    pub async fn insert_vm(&mut self, vm: &NewVm<'_>) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO virtual_machines
                (host_id, name, internal_uuid, domain_uuid, description, state,
                 vcpu_count, memory_bytes)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(vm.host_id)
        .bind(vm.name)
        .bind(vm.internal_uuid)
        .bind(vm.domain_uuid)
        .bind(vm.description)
        .bind(vm.state)
        .bind(vm.vcpu_count)
        .bind(vm.memory_bytes)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    pub async fn update_vm(&mut self, id: i64, patch: &VmPatch<'_>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE virtual_machines
            SET name = ?, description = ?, state = ?, vcpu_count = ?, memory_bytes = ?
            WHERE id = ?
            "#,
        )
        .bind(patch.name)
        .bind(patch.description)
        .bind(patch.state)
        .bind(patch.vcpu_count)
        .bind(patch.memory_bytes)
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Delete a cached row by name. Returns whether a row existed.
    pub async fn delete_vm_by_name(&mut self, host_id: &str, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM virtual_machines WHERE host_id = ? AND name = ?")
            .bind(host_id)
            .bind(name)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_vm(&mut self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM virtual_machines WHERE id = ?")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn vms_for_host(&mut self, host_id: &str) -> Result<Vec<VmRow>> {
        Ok(
            sqlx::query_as::<_, VmRow>("SELECT * FROM virtual_machines WHERE host_id = ?")
                .bind(host_id)
                .fetch_all(&mut *self.tx)
                .await?,
        )
    }

    // -------------------------------------------------------------------
    // Hardware
    // -------------------------------------------------------------------

    /// Read the cached hardware for a VM inside this transaction, in the
    /// same shape the pool-side read model uses.
    pub async fn hardware_for_vm(&mut self, vm_id: i64) -> Result<HardwareView> {
        let disks = sqlx::query_as::<_, DiskAttachmentView>(
            r#"
            SELECT va.device_name, va.bus_type, v.path, v.format
            FROM volume_attachments va
            JOIN volumes v ON v.id = va.volume_id
            WHERE va.vm_id = ?
            ORDER BY va.device_name
            "#,
        )
        .bind(vm_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let interfaces = sqlx::query_as::<_, PortView>(
            r#"
            SELECT p.mac_address, p.device_name, p.model_name, n.bridge_name
            FROM ports p
            JOIN port_bindings pb ON pb.port_id = p.id
            JOIN networks n ON n.id = pb.network_id
            WHERE p.vm_id = ?
            ORDER BY p.mac_address
            "#,
        )
        .bind(vm_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let graphics = sqlx::query_scalar::<_, String>(
            r#"
            SELECT gd.kind
            FROM graphics_device_attachments ga
            JOIN graphics_devices gd ON gd.id = ga.graphics_device_id
            WHERE ga.vm_id = ?
            ORDER BY gd.kind
            "#,
        )
        .bind(vm_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(HardwareView {
            disks,
            interfaces,
            graphics,
        })
    }

    /// Drop all attachments for a VM. Port rows stay (MAC-keyed, they may
    /// recur on any host); only the bindings pointing at them go.
    pub async fn clear_vm_hardware(&mut self, vm_id: i64) -> Result<()> {
        sqlx::query(
            "DELETE FROM port_bindings WHERE port_id IN (SELECT id FROM ports WHERE vm_id = ?)",
        )
        .bind(vm_id)
        .execute(&mut *self.tx)
        .await?;
        sqlx::query("DELETE FROM volume_attachments WHERE vm_id = ?")
            .bind(vm_id)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM graphics_device_attachments WHERE vm_id = ?")
            .bind(vm_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn upsert_volume(&mut self, path: &str, format: &str) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO volumes (path, format) VALUES (?, ?)
            ON CONFLICT(path) DO UPDATE SET format = excluded.format
            RETURNING id
            "#,
        )
        .bind(path)
        .bind(format)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    pub async fn insert_volume_attachment(
        &mut self,
        vm_id: i64,
        volume_id: i64,
        device_name: &str,
        bus_type: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO volume_attachments (vm_id, volume_id, device_name, bus_type) VALUES (?, ?, ?, ?)",
        )
        .bind(vm_id)
        .bind(volume_id)
        .bind(device_name)
        .bind(bus_type)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_network(
        &mut self,
        uuid: &str,
        host_id: &str,
        bridge_name: &str,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO networks (uuid, host_id, bridge_name) VALUES (?, ?, ?)
            ON CONFLICT(host_id, bridge_name) DO UPDATE SET uuid = excluded.uuid
            RETURNING id
            "#,
        )
        .bind(uuid)
        .bind(host_id)
        .bind(bridge_name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    /// Upsert a port by MAC, re-linking it to the given VM.
    pub async fn upsert_port(
        &mut self,
        mac_address: &str,
        vm_id: i64,
        device_name: &str,
        model_name: &str,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO ports (mac_address, vm_id, device_name, model_name)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(mac_address) DO UPDATE SET
                vm_id = excluded.vm_id,
                device_name = excluded.device_name,
                model_name = excluded.model_name
            RETURNING id
            "#,
        )
        .bind(mac_address)
        .bind(vm_id)
        .bind(device_name)
        .bind(model_name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    pub async fn ensure_port_binding(&mut self, port_id: i64, network_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO port_bindings (port_id, network_id) VALUES (?, ?)")
            .bind(port_id)
            .bind(network_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn upsert_graphics_device(&mut self, kind: &str) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO graphics_devices (kind) VALUES (?)
            ON CONFLICT(kind) DO UPDATE SET kind = excluded.kind
            RETURNING id
            "#,
        )
        .bind(kind)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    pub async fn insert_graphics_attachment(
        &mut self,
        vm_id: i64,
        graphics_device_id: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO graphics_device_attachments (vm_id, graphics_device_id) VALUES (?, ?)",
        )
        .bind(vm_id)
        .bind(graphics_device_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}
