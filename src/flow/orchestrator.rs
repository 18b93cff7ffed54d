//! The three SAML endpoints: connect, callback and metadata.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::context::ContextPropagator;
use super::request::{FlowResponse, SamlRequest};
use crate::error::{ClientError, MappingError, ProtocolError};
use crate::mapping::{flatten_attributes, AttributeMap, MapperCatalog, MapperService};
use crate::saml::{ClientRegistry, RedirectionAction, TenantSamlConfig};
use crate::settings::SettingsStore;
use crate::site::{SiteKeyResolver, TenantId};

/// Which endpoint a request path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Connect,
    Callback,
    Metadata,
}

impl Leg {
    /// Match a request path by suffix; the query string is ignored.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        if path.ends_with("connect.saml") {
            Some(Self::Connect)
        } else if path.ends_with("callback.saml") {
            Some(Self::Callback)
        } else if path.ends_with("metadata.saml") {
            Some(Self::Metadata)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Callback => "callback",
            Self::Metadata => "metadata",
        }
    }
}

/// Drives the SP-initiated login for every hosted site.
pub struct FlowOrchestrator {
    resolver: SiteKeyResolver,
    registry: Arc<ClientRegistry>,
    propagator: ContextPropagator,
    settings: Arc<SettingsStore>,
    mappers: Arc<MapperCatalog>,
    mapper_service: Arc<dyn MapperService>,
}

impl FlowOrchestrator {
    pub fn new(
        resolver: SiteKeyResolver,
        registry: Arc<ClientRegistry>,
        propagator: ContextPropagator,
        settings: Arc<SettingsStore>,
        mappers: Arc<MapperCatalog>,
        mapper_service: Arc<dyn MapperService>,
    ) -> Self {
        Self {
            resolver,
            registry,
            propagator,
            settings,
            mappers,
            mapper_service,
        }
    }

    /// Handle a request for `leg`. `None` lets the request through untouched.
    pub fn handle(&self, leg: Leg, request: &SamlRequest) -> Option<FlowResponse> {
        match leg {
            Leg::Connect => self.connect(request),
            Leg::Callback => Some(self.callback(request)),
            Leg::Metadata => Some(self.metadata(request)),
        }
    }

    /// Start a login: store the context and send the browser to the IdP.
    ///
    /// Returns `None` when the IdP offers no way to start a login.
    pub fn connect(&self, request: &SamlRequest) -> Option<FlowResponse> {
        let Some(tenant) = self.resolver.resolve(request) else {
            warn!(server_name = %request.server_name(), "SAML connect for unknown site");
            return Some(FlowResponse::error(400, "Unknown site"));
        };

        let cookies = self.propagator.store(request, &tenant);

        let client = match self.registry.get_or_create(&tenant, request) {
            Ok(client) => client,
            Err(e) => return Some(client_error_response(&tenant, &e, 500)),
        };

        let action = match client.redirection_action(request) {
            Ok(action) => action,
            Err(e) => {
                error!(site = %tenant, error = %e, "Failed to build SAML AuthnRequest");
                return Some(FlowResponse::error(500, "Unable to start SAML login"));
            }
        };

        let response = match action {
            Some(RedirectionAction::InlineBody(body)) => FlowResponse::html(&body),
            Some(RedirectionAction::SeeOther(location)) => FlowResponse::redirect(303, &location),
            Some(RedirectionAction::Found(location)) => FlowResponse::redirect(302, &location),
            None => {
                warn!(site = %tenant, "No redirection available towards the IdP");
                return None;
            }
        };

        debug!(site = %tenant, status = response.status, "Sending user to IdP");
        Some(response.with_cookies(cookies))
    }

    /// Complete a login from the IdP response.
    pub fn callback(&self, request: &SamlRequest) -> FlowResponse {
        let Some(tenant) = self.resolver.resolve(request) else {
            warn!(server_name = %request.server_name(), "SAML callback for unknown site");
            return FlowResponse::error(400, "Unknown site");
        };

        let client = match self.registry.get_or_create(&tenant, request) {
            Ok(client) => client,
            Err(e) => return client_error_response(&tenant, &e, 500),
        };

        let Some(credentials) = client.credentials(request) else {
            warn!(site = %tenant, "SAML callback without a SAML response");
            return FlowResponse::error(400, "Unable to handle SSO callback");
        };

        let identity = match client.validate(&credentials) {
            Ok(identity) => identity,
            Err(ProtocolError::Rejected(reason)) => {
                warn!(site = %tenant, reason = %reason, "SAML response rejected");
                return FlowResponse::error(500, "Error while trying to login");
            }
            Err(ProtocolError::Internal(e)) => {
                error!(site = %tenant, error = %e, "Failed to process SAML response");
                return FlowResponse::error(500, "Error while trying to login");
            }
        };

        let config = match self.settings.get(&tenant) {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!(site = %tenant, "SAML settings disappeared during callback");
                return FlowResponse::error(500, "Error while trying to login");
            }
            Err(e) => {
                error!(site = %tenant, error = %e, "Failed to read SAML settings");
                return FlowResponse::error(500, "Error while trying to login");
            }
        };

        let (session_id, session_cookie) = self.propagator.open_session(request);
        let attributes = flatten_attributes(&identity);
        if let Err(e) = self.run_mappers(&session_id, &config, &attributes) {
            warn!(site = %tenant, mapper = %e.mapper, reason = %e.reason, "Login refused by mapper");
            return FlowResponse::error(400, "Login refused");
        }

        let location = self.propagator.resolve_redirect(request, &tenant);
        info!(
            site = %tenant,
            user_id = %identity.name_id,
            session_id = %session_id,
            correlation_id = %request.correlation_id(),
            location = %location,
            "SAML login succeeded"
        );
        FlowResponse::redirect(302, &location).with_cookies(vec![session_cookie])
    }

    /// Serve the SP metadata of the site.
    pub fn metadata(&self, request: &SamlRequest) -> FlowResponse {
        let Some(tenant) = self.resolver.resolve(request) else {
            warn!(server_name = %request.server_name(), "SAML metadata for unknown site");
            return FlowResponse::error(400, "Unknown site");
        };

        let client = match self.registry.get_or_create(&tenant, request) {
            Ok(client) => client,
            Err(e) => return client_error_response(&tenant, &e, 400),
        };

        match client.sp_metadata() {
            Ok(xml) => FlowResponse::xml(&xml),
            Err(e) => {
                warn!(site = %tenant, error = %e, "Failed to render SP metadata");
                FlowResponse::error(400, "Unable to render metadata")
            }
        }
    }

    /// Run the site's mappers in order, then the result processors.
    fn run_mappers(
        &self,
        session_id: &str,
        config: &TenantSamlConfig,
        attributes: &AttributeMap,
    ) -> Result<(), MappingError> {
        for name in &config.mappers {
            let mapper = self
                .mappers
                .get(name)
                .ok_or_else(|| MappingError::new(name.as_str(), "unknown mapper"))?;
            self.mapper_service.execute_mapper(session_id, &mapper, attributes)?;
        }
        self.mapper_service
            .execute_connector_result_processors(config, attributes);
        Ok(())
    }
}

fn client_error_response(tenant: &TenantId, error: &ClientError, status: u16) -> FlowResponse {
    match error {
        ClientError::InvalidMetadata(detail) => {
            error!(site = %tenant, detail = %detail, "Error parsing idp Metadata - Invalid XML file");
            FlowResponse::error(status, "Invalid IdP metadata")
        }
        ClientError::Configuration(detail) => {
            error!(site = %tenant, detail = %detail, "SAML configuration error");
            FlowResponse::error(status, "SAML is not configured for this site")
        }
        ClientError::Initialization(e) => {
            error!(site = %tenant, error = %e, "Failed to initialize SAML client");
            FlowResponse::error(status, "SAML client unavailable")
        }
    }
}
