//! Error kinds that callers need to branch on.
//!
//! Plumbing errors (storage, I/O) travel as `anyhow::Error`; the enums below
//! mark the places where the flow turns an error into a specific HTTP status.

use thiserror::Error;

/// Failure while building a tenant's SAML protocol client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The IdP metadata document could not be parsed.
    #[error("Error parsing IdP metadata - invalid XML: {0}")]
    InvalidMetadata(String),

    /// Settings are missing, disabled or inconsistent.
    #[error("SAML configuration error: {0}")]
    Configuration(String),

    /// Anything else raised while initializing the client.
    #[error(transparent)]
    Initialization(#[from] anyhow::Error),
}

/// Failure reported by the protocol client while handling IdP messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The IdP response was rejected (status, signature, validity window, replay...).
    #[error("SAML response rejected: {0}")]
    Rejected(String),

    /// The message could not be produced or decoded.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// An attribute mapper refused the authenticated identity.
#[derive(Debug, Error)]
#[error("mapper '{mapper}' rejected the identity: {reason}")]
pub struct MappingError {
    pub mapper: String,
    pub reason: String,
}

impl MappingError {
    pub fn new(mapper: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            mapper: mapper.into(),
            reason: reason.into(),
        }
    }
}
