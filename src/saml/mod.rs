//! SAML 2.0 Service Provider support.
//!
//! Provides:
//! - Per-site SP settings and generated SP key material
//! - The protocol-client seam and its samael implementation
//! - A per-site client registry with invalidation

mod client;
mod config;
mod keys;
mod provider;
pub(crate) mod registry;

pub use client::{
    Credentials, ProtocolClient, ProtocolClientFactory, RedirectionAction, SamlIdentity,
};
pub use config::{SamlBinding, TenantSamlConfig, TenantSamlConfigJson};
pub use keys::ensure_key_material;
pub use provider::{SamaelClient, SamaelClientFactory};
pub use registry::ClientRegistry;

#[cfg(test)]
pub(crate) use provider::tests as provider_tests;
