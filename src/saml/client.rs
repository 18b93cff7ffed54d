//! Protocol client abstraction used by the flow.
//!
//! A client is built once per site from its settings and cached by the
//! [`ClientRegistry`](super::ClientRegistry). The flow only talks to this
//! trait, which keeps the SAML library behind one seam.

use std::collections::HashMap;
use std::sync::Arc;

use super::config::TenantSamlConfig;
use crate::error::{ClientError, ProtocolError};
use crate::flow::SamlRequest;

/// How to send the browser to the IdP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectionAction {
    /// Write this HTML as the response body (auto-submitting POST form).
    InlineBody(String),
    /// Redirect with 303.
    SeeOther(String),
    /// Redirect with 302.
    Found(String),
}

/// Raw SAML response extracted from the callback request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Base64 `SAMLResponse` value (HTTP-POST binding).
    pub saml_response: String,
    pub relay_state: Option<String>,
}

/// The authenticated identity extracted from a validated assertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamlIdentity {
    /// Subject NameID.
    pub name_id: String,
    pub name_id_format: Option<String>,
    pub assertion_id: String,
    pub idp_entity_id: String,
    pub session_index: Option<String>,
    /// Assertion attributes as name → values.
    pub attributes: HashMap<String, Vec<String>>,
}

/// SAML operations for one site.
pub trait ProtocolClient: Send + Sync {
    /// URL the IdP sends responses to.
    fn callback_url(&self) -> &str;

    /// Redirection towards the IdP, or `None` when the IdP offers no usable
    /// SSO endpoint.
    fn redirection_action(&self, request: &SamlRequest) -> Result<Option<RedirectionAction>, ProtocolError>;

    /// Extract the SAML response from a callback request, if present.
    fn credentials(&self, request: &SamlRequest) -> Option<Credentials>;

    /// Validate a SAML response and return the identity it asserts.
    fn validate(&self, credentials: &Credentials) -> Result<SamlIdentity, ProtocolError>;

    /// SP metadata document.
    fn sp_metadata(&self) -> Result<String, ProtocolError>;
}

/// Builds protocol clients from site settings.
pub trait ProtocolClientFactory: Send + Sync {
    fn build(&self, config: &TenantSamlConfig, callback_url: &str) -> Result<Arc<dyn ProtocolClient>, ClientError>;
}
