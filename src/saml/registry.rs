//! Per-site cache of protocol clients.
//!
//! Clients are built lazily on first use and cached until the site's
//! settings change. Builds for different sites never block each other.
//! Concurrent first requests for the same site may each build a client;
//! the first one inserted is kept and shared.
//!
//! Each site carries a generation counter bumped by [`ClientRegistry::invalidate`].
//! A build that started before an invalidation is handed to its caller but
//! never cached, so a stale client cannot outlive a settings change.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::client::{ProtocolClient, ProtocolClientFactory};
use super::config::TenantSamlConfig;
use crate::error::ClientError;
use crate::flow::SamlRequest;
use crate::settings::SettingsStore;
use crate::site::TenantId;

pub struct ClientRegistry {
    clients: DashMap<TenantId, Arc<dyn ProtocolClient>>,
    generations: DashMap<TenantId, u64>,
    settings: Arc<SettingsStore>,
    factory: Arc<dyn ProtocolClientFactory>,
    /// Directory receiving `<site>.sp-metadata.xml`, if any.
    metadata_dir: Option<PathBuf>,
}

impl ClientRegistry {
    pub fn new(
        settings: Arc<SettingsStore>,
        factory: Arc<dyn ProtocolClientFactory>,
        metadata_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            generations: DashMap::new(),
            settings,
            factory,
            metadata_dir,
        }
    }

    /// Return the cached client for `tenant`, building it if needed.
    ///
    /// `request` is only used to derive the callback URL when the site has
    /// no `server_location`.
    pub fn get_or_create(
        &self,
        tenant: &TenantId,
        request: &SamlRequest,
    ) -> Result<Arc<dyn ProtocolClient>, ClientError> {
        if let Some(client) = self.clients.get(tenant).map(|c| Arc::clone(c.value())) {
            return Ok(client);
        }

        let generation = self.generation(tenant);
        let config = self
            .settings
            .get(tenant)?
            .ok_or_else(|| ClientError::Configuration(format!("no SAML settings for site {}", tenant)))?;

        let callback_url = callback_url(&config, request);
        self.remove_metadata_file(tenant);

        let client = self.factory.build(&config, &callback_url)?;

        let entry = self.clients.entry(tenant.clone());
        if self.generation(tenant) != generation {
            debug!(site = %tenant, "Settings changed during client build, not caching");
            return Ok(client);
        }
        let (cached, inserted) = match entry {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(vacant) => (Arc::clone(vacant.insert(client).value()), true),
        };

        // Only the client that won the insert publishes its metadata.
        if inserted {
            self.write_metadata_file(tenant, cached.as_ref());
            info!(site = %tenant, callback_url = %callback_url, "SAML client cached");
        }
        Ok(cached)
    }

    /// Drop the cached client of `tenant`. Returns whether one was cached.
    pub fn invalidate(&self, tenant: &TenantId) -> bool {
        *self.generations.entry(tenant.clone()).or_insert(0) += 1;
        let removed = self.clients.remove(tenant).is_some();
        if removed {
            debug!(site = %tenant, "SAML client invalidated");
        }
        removed
    }

    /// Drop every cached client.
    pub fn reset(&self) {
        let tenants: Vec<TenantId> = self.clients.iter().map(|e| e.key().clone()).collect();
        for tenant in &tenants {
            self.invalidate(tenant);
        }
        info!(clients = tenants.len(), "SAML client registry reset");
    }

    pub fn contains(&self, tenant: &TenantId) -> bool {
        self.clients.contains_key(tenant)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Build a throwaway client to check settings before they are stored.
    pub fn validate_settings(&self, config: &TenantSamlConfig) -> Result<(), ClientError> {
        self.factory.build(config, "/").map(|_| ())
    }

    fn generation(&self, tenant: &TenantId) -> u64 {
        self.generations.get(tenant).map(|g| *g.value()).unwrap_or(0)
    }

    fn metadata_path(&self, tenant: &TenantId) -> Option<PathBuf> {
        self.metadata_dir
            .as_deref()
            .map(|dir| dir.join(metadata_file_name(tenant)))
    }

    fn remove_metadata_file(&self, tenant: &TenantId) {
        let Some(path) = self.metadata_path(tenant) else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = ?path, "Removed previous SP metadata"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?path, error = %e, "Failed to remove SP metadata"),
        }
    }

    fn write_metadata_file(&self, tenant: &TenantId, client: &dyn ProtocolClient) {
        let Some(path) = self.metadata_path(tenant) else {
            return;
        };
        let result = client
            .sp_metadata()
            .map_err(anyhow::Error::from)
            .and_then(|xml| write_file(&path, &xml));
        if let Err(e) = result {
            warn!(path = ?path, error = %e, "Failed to write SP metadata");
        }
    }
}

/// Callback URL: `server_location` when set, else derived from the request.
fn callback_url(config: &TenantSamlConfig, request: &SamlRequest) -> String {
    config.fixed_callback_url().unwrap_or_else(|| {
        format!(
            "{}{}{}",
            request.public_origin(),
            request.context_path(),
            config.callback_path
        )
    })
}

fn metadata_file_name(tenant: &TenantId) -> String {
    let safe: String = tenant
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    format!("{}.sp-metadata.xml", safe)
}

fn write_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}
