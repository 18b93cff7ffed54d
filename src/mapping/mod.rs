//! Attribute mapping run after a successful SAML login.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::error::MappingError;
use crate::saml::{SamlIdentity, TenantSamlConfig};

/// Attribute exposing the subject NameID to mappers.
pub const LOGIN_ATTRIBUTE: &str = "login";

/// Name of the mapper every site gets unless it configures its own list.
pub const DEFAULT_MAPPER: &str = "default";

/// Flattened attributes: single values as strings, multiple values as arrays.
pub type AttributeMap = HashMap<String, Value>;

/// Flatten the identity's attributes and add the NameID as `login`.
pub fn flatten_attributes(identity: &SamlIdentity) -> AttributeMap {
    let mut map: AttributeMap = identity
        .attributes
        .iter()
        .map(|(name, values)| {
            let value = match values.as_slice() {
                [single] => Value::String(single.clone()),
                many => Value::Array(many.iter().cloned().map(Value::String).collect()),
            };
            (name.clone(), value)
        })
        .collect();

    map.entry(LOGIN_ATTRIBUTE.to_string())
        .or_insert_with(|| Value::String(identity.name_id.clone()));
    map
}

/// One configured mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MapperConfig {
    pub name: String,

    /// Attributes that must be present.
    #[serde(default)]
    pub required_attributes: Vec<String>,

    /// Attribute → value that refuses the login when matched.
    #[serde(default)]
    pub reject_when: HashMap<String, String>,
}

impl MapperConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required_attributes: Vec::new(),
            reject_when: HashMap::new(),
        }
    }
}

/// Runs mappers and post-login processors for a site.
pub trait MapperService: Send + Sync {
    /// Run one mapper over the attributes of the session `session_id`.
    fn execute_mapper(
        &self,
        session_id: &str,
        mapper: &MapperConfig,
        attributes: &AttributeMap,
    ) -> Result<(), MappingError>;

    /// Hook run once every mapper accepted the login.
    fn execute_connector_result_processors(&self, config: &TenantSamlConfig, attributes: &AttributeMap);
}

/// Named mapper configurations. The `default` mapper always exists.
#[derive(Debug)]
pub struct MapperCatalog {
    mappers: RwLock<HashMap<String, MapperConfig>>,
}

impl Default for MapperCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MapperCatalog {
    pub fn new() -> Self {
        Self {
            mappers: RwLock::new(Self::with_default(Vec::new())),
        }
    }

    /// Replace all mappers; `default` is re-added unless overridden.
    pub fn replace(&self, mappers: Vec<MapperConfig>) -> anyhow::Result<()> {
        let mut guard = self
            .mappers
            .write()
            .map_err(|_| anyhow::anyhow!("Mapper catalog lock poisoned"))?;
        *guard = Self::with_default(mappers);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<MapperConfig> {
        self.mappers.read().ok()?.get(name).cloned()
    }

    fn with_default(mappers: Vec<MapperConfig>) -> HashMap<String, MapperConfig> {
        let mut map: HashMap<String, MapperConfig> =
            mappers.into_iter().map(|m| (m.name.clone(), m)).collect();
        map.entry(DEFAULT_MAPPER.to_string())
            .or_insert_with(|| MapperConfig::new(DEFAULT_MAPPER));
        map
    }
}

/// Mapper service enforcing required and rejected attribute values.
#[derive(Debug, Default)]
pub struct AttributeMapperService;

impl AttributeMapperService {
    pub fn new() -> Self {
        Self
    }
}

impl MapperService for AttributeMapperService {
    fn execute_mapper(
        &self,
        session_id: &str,
        mapper: &MapperConfig,
        attributes: &AttributeMap,
    ) -> Result<(), MappingError> {
        for required in &mapper.required_attributes {
            if !attributes.contains_key(required) {
                return Err(MappingError::new(
                    &mapper.name,
                    format!("missing attribute {}", required),
                ));
            }
        }

        for (attribute, rejected) in &mapper.reject_when {
            let matched = match attributes.get(attribute) {
                Some(Value::String(v)) => v == rejected,
                Some(Value::Array(values)) => values.iter().any(|v| v.as_str() == Some(rejected.as_str())),
                _ => false,
            };
            if matched {
                return Err(MappingError::new(
                    &mapper.name,
                    format!("attribute {} has a rejected value", attribute),
                ));
            }
        }

        debug!(session = %session_id, mapper = %mapper.name, "Mapper accepted identity");
        Ok(())
    }

    fn execute_connector_result_processors(&self, config: &TenantSamlConfig, attributes: &AttributeMap) {
        let login = attributes
            .get(LOGIN_ATTRIBUTE)
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!(
            site = %config.site,
            login = %login,
            attributes = attributes.len(),
            "SAML login completed"
        );
    }
}
