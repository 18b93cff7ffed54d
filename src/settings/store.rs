//! Site SAML settings backed by a redb embedded database.
//!
//! Settings are cached in memory after the first read. Every mutation is
//! persisted, cached and announced on a broadcast channel so dependent
//! caches (the client registry) can drop stale entries.

use anyhow::{anyhow, Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::saml::TenantSamlConfig;
use crate::site::TenantId;

/// redb table for settings (key: site key, value: MessagePack bytes).
const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("saml_tenant_settings");

/// Capacity of the change-notification channel.
const EVENT_CAPACITY: usize = 64;

/// Notification that the settings of some sites changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsChanged {
    pub tenants: Vec<TenantId>,
}

/// Persistent per-site settings with an in-memory snapshot.
pub struct SettingsStore {
    /// redb database handle.
    db: Database,

    /// Snapshot of settings read so far.
    cache: RwLock<HashMap<TenantId, Arc<TenantSamlConfig>>>,

    events: broadcast::Sender<SettingsChanged>,
}

impl SettingsStore {
    /// Open or create a settings store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(path)
            .with_context(|| format!("Failed to open settings database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
        }
        write_txn.commit()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            db,
            cache: RwLock::new(HashMap::new()),
            events,
        };

        debug!(path = ?path, sites = store.tenants()?.len(), "Opened settings store");
        Ok(store)
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChanged> {
        self.events.subscribe()
    }

    /// Settings of a site, from the snapshot or the database.
    pub fn get(&self, tenant: &TenantId) -> Result<Option<Arc<TenantSamlConfig>>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(config) = cache.get(tenant) {
                return Ok(Some(Arc::clone(config)));
            }
        }

        let config = self.read(tenant)?.map(Arc::new);
        if let Some(ref config) = config {
            if let Ok(mut cache) = self.cache.write() {
                cache.insert(tenant.clone(), Arc::clone(config));
            }
        }
        Ok(config)
    }

    /// Store settings for a site that has none yet.
    pub fn create(&self, config: TenantSamlConfig) -> Result<()> {
        if self.read(&config.site)?.is_some() {
            anyhow::bail!("SAML settings already exist for site {}", config.site);
        }
        self.save(config)
    }

    /// Create or replace the settings of a site.
    pub fn save(&self, config: TenantSamlConfig) -> Result<()> {
        config.validate().map_err(|e| anyhow!(e))?;
        let tenant = config.site.clone();

        self.persist(&config)?;
        self.cache
            .write()
            .map_err(|_| anyhow!("Settings cache lock poisoned"))?
            .insert(tenant.clone(), Arc::new(config));

        info!(site = %tenant, "SAML settings saved");
        self.notify(vec![tenant]);
        Ok(())
    }

    /// Remove the settings of a site.
    pub fn delete(&self, tenant: &TenantId) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            let result = table.remove(tenant.as_str())?;
            result.is_some()
        };
        write_txn.commit()?;

        if let Ok(mut cache) = self.cache.write() {
            cache.remove(tenant);
        }

        if removed {
            info!(site = %tenant, "SAML settings deleted");
            self.notify(vec![tenant.clone()]);
        }
        Ok(removed)
    }

    /// Re-read a site's settings from the database into the snapshot.
    pub fn reload(&self, tenant: &TenantId) -> Result<Option<Arc<TenantSamlConfig>>> {
        let config = self.read(tenant)?.map(Arc::new);

        let mut cache = self
            .cache
            .write()
            .map_err(|_| anyhow!("Settings cache lock poisoned"))?;
        match config {
            Some(ref config) => {
                cache.insert(tenant.clone(), Arc::clone(config));
            }
            None => {
                cache.remove(tenant);
            }
        }

        debug!(site = %tenant, present = config.is_some(), "Reloaded SAML settings");
        Ok(config)
    }

    /// Keys of all sites with stored settings.
    pub fn tenants(&self) -> Result<Vec<TenantId>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;

        let mut tenants = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            tenants.push(TenantId::new(key.value()));
        }
        Ok(tenants)
    }

    /// Announce that the settings of `tenants` changed.
    pub fn notify(&self, tenants: Vec<TenantId>) {
        // No subscriber is not an error.
        let _ = self.events.send(SettingsChanged { tenants });
    }

    fn read(&self, tenant: &TenantId) -> Result<Option<TenantSamlConfig>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;

        match table.get(tenant.as_str())? {
            Some(value) => {
                let config: TenantSamlConfig = rmp_serde::from_slice(value.value())
                    .with_context(|| format!("Failed to deserialize settings for site {}", tenant))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    fn persist(&self, config: &TenantSamlConfig) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(config).context("Failed to serialize settings")?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            table.insert(config.site.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Store raw bytes for a site, bypassing serialization.
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, tenant: &TenantId, bytes: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            table.insert(tenant.as_str(), bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
