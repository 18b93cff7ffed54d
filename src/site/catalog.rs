//! Catalog of the sites (tenants) hosted behind the agent.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use super::locale::Locale;

/// Opaque tenant identifier (the site key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn default_language() -> String {
    "en".to_string()
}

/// A hosted site as pushed by the proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Site {
    /// Site key, used as tenant id everywhere else.
    pub key: TenantId,

    /// Host name the site is served under, if it has a dedicated one.
    #[serde(default)]
    pub server_name: Option<String>,

    /// Language used when negotiation finds nothing better.
    #[serde(default = "default_language")]
    pub default_language: String,

    /// Languages the site is published in. Empty means only the default.
    #[serde(default)]
    pub languages: Vec<String>,
}

impl Site {
    pub fn new(key: &str) -> Self {
        Self {
            key: TenantId::new(key),
            server_name: None,
            default_language: default_language(),
            languages: Vec::new(),
        }
    }

    pub fn with_server_name(mut self, server_name: &str) -> Self {
        self.server_name = Some(server_name.to_string());
        self
    }

    pub fn with_languages(mut self, default: &str, languages: &[&str]) -> Self {
        self.default_language = default.to_string();
        self.languages = languages.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Default locale of the site, falling back to English on a malformed code.
    pub fn default_locale(&self) -> Locale {
        Locale::parse(&self.default_language).unwrap_or_else(|| Locale::new("en"))
    }

    /// Whether the site is published in `locale`.
    pub fn supports(&self, locale: &Locale) -> bool {
        if *locale == self.default_locale() {
            return true;
        }
        self.languages
            .iter()
            .filter_map(|code| Locale::parse(code))
            .any(|supported| supported == *locale)
    }
}

/// Thread-safe catalog of hosted sites, replaced wholesale on reconfiguration.
#[derive(Debug, Default)]
pub struct SiteCatalog {
    sites: RwLock<HashMap<TenantId, Site>>,
}

impl SiteCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sites(sites: Vec<Site>) -> Self {
        let catalog = Self::new();
        // A fresh lock cannot be poisoned.
        let _ = catalog.replace(sites);
        catalog
    }

    /// Replace the whole catalog.
    pub fn replace(&self, sites: Vec<Site>) -> Result<()> {
        let mut guard = self
            .sites
            .write()
            .map_err(|_| anyhow!("Site catalog lock poisoned"))?;
        *guard = sites.into_iter().map(|s| (s.key.clone(), s)).collect();
        Ok(())
    }

    pub fn get(&self, key: &TenantId) -> Option<Site> {
        self.sites.read().ok()?.get(key).cloned()
    }

    pub fn contains(&self, key: &TenantId) -> bool {
        self.sites
            .read()
            .map(|sites| sites.contains_key(key))
            .unwrap_or(false)
    }

    /// All site keys, sorted.
    pub fn keys(&self) -> Vec<TenantId> {
        let mut keys: Vec<TenantId> = self
            .sites
            .read()
            .map(|sites| sites.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.sites.read().map(|sites| sites.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the site bound to a host name (case-insensitive).
    pub fn find_by_server_name(&self, server_name: &str) -> Option<TenantId> {
        let sites = self.sites.read().ok()?;
        sites
            .values()
            .find(|site| {
                site.server_name
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(server_name))
            })
            .map(|site| site.key.clone())
    }
}
