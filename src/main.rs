//! Zentinel SAML Sites Agent
//!
//! This agent adds per-site SAML 2.0 single sign-on to the Zentinel proxy.
//! Each hosted site has its own IdP settings; the agent answers the
//! `connect.saml`, `callback.saml` and `metadata.saml` endpoints and lets
//! every other request through.

mod error;
mod flow;
mod mapping;
mod saml;
mod settings;
mod site;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use zentinel_agent_protocol::{
    AgentHandler, AgentResponse, AgentServer, AuditMetadata, ConfigureEvent, HeaderOp,
    RequestBodyChunkEvent, RequestHeadersEvent, ResponseHeadersEvent,
};

use flow::{ContextPropagator, FlowOrchestrator, FlowResponse, Leg, RedirectGuard, SamlRequest};
use mapping::{AttributeMapperService, MapperCatalog, MapperConfig};
use saml::{
    ensure_key_material, ClientRegistry, ProtocolClientFactory, SamaelClientFactory,
    TenantSamlConfig, TenantSamlConfigJson,
};
use settings::{spawn_settings_listener, SettingsChangeListener, SettingsStore};
use site::{Site, SiteCatalog, SiteKeyResolver};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "zentinel-saml-sites-agent")]
#[command(about = "Per-site SAML single sign-on agent for Zentinel reverse proxy")]
struct Args {
    /// Path to Unix socket
    #[arg(long, default_value = "/tmp/zentinel-saml-sites.sock", env = "AGENT_SOCKET")]
    socket: PathBuf,

    /// Path of the settings database (redb)
    #[arg(
        long,
        default_value = "/var/lib/zentinel-saml/settings.redb",
        env = "SAML_SETTINGS_STORE"
    )]
    settings_store: PathBuf,

    /// Directory receiving generated SP metadata files
    #[arg(long, env = "SAML_METADATA_DIR")]
    metadata_dir: Option<PathBuf>,

    /// Application context path the sites are served under
    #[arg(long, default_value = "", env = "SAML_CONTEXT_PATH")]
    context_path: String,

    /// Hosts allowed as absolute post-login redirect targets (comma-separated)
    #[arg(long, env = "SAML_AUTHORIZED_REDIRECT_HOSTS")]
    authorized_redirect_hosts: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, env = "SAML_VERBOSE")]
    verbose: bool,
}

/// JSON configuration pushed through `on_configure()`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct AgentConfigJson {
    /// Replaces the site catalog when present.
    sites: Option<Vec<Site>>,

    /// Per-site SAML settings, merged into the stored ones.
    #[serde(default)]
    tenants: Vec<TenantSamlConfigJson>,

    /// Replaces the mapper catalog when present.
    mappers: Option<Vec<MapperConfig>>,

    authorized_redirect_hosts: Option<Vec<String>>,

    context_path: Option<String>,
}

/// Callback request waiting for its form body.
struct PendingCallback {
    request: SamlRequest,
    body: Vec<u8>,
}

/// The agent handler.
struct SamlSitesAgent {
    orchestrator: FlowOrchestrator,
    sites: Arc<SiteCatalog>,
    guard: Arc<RedirectGuard>,
    mappers: Arc<MapperCatalog>,
    settings: Arc<SettingsStore>,
    registry: Arc<ClientRegistry>,
    context_path: RwLock<String>,
    /// Callback requests keyed by correlation ID.
    pending: RwLock<HashMap<String, PendingCallback>>,
}

impl SamlSitesAgent {
    fn new(
        settings: Arc<SettingsStore>,
        factory: Arc<dyn ProtocolClientFactory>,
        metadata_dir: Option<PathBuf>,
        context_path: &str,
        authorized_hosts: Vec<String>,
    ) -> Self {
        let sites = Arc::new(SiteCatalog::new());
        let guard = Arc::new(RedirectGuard::new(authorized_hosts));
        let mappers = Arc::new(MapperCatalog::new());
        let registry = Arc::new(ClientRegistry::new(Arc::clone(&settings), factory, metadata_dir));

        let orchestrator = FlowOrchestrator::new(
            SiteKeyResolver::new(Arc::clone(&sites)),
            Arc::clone(&registry),
            ContextPropagator::new(Arc::clone(&guard), Arc::clone(&sites), Arc::clone(&settings)),
            Arc::clone(&settings),
            Arc::clone(&mappers),
            Arc::new(AttributeMapperService::new()),
        );

        Self {
            orchestrator,
            sites,
            guard,
            mappers,
            settings,
            registry,
            context_path: RwLock::new(context_path.to_string()),
            pending: RwLock::new(HashMap::new()),
        }
    }

    fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Apply configuration received from the proxy.
    ///
    /// Site settings are validated by building a throwaway client before
    /// they are stored. Unchanged settings are not rewritten, so their
    /// cached clients survive.
    fn reconfigure(&self, json_config: AgentConfigJson) -> Result<()> {
        if let Some(sites) = json_config.sites {
            let count = sites.len();
            self.sites.replace(sites)?;
            info!(sites = count, "Site catalog updated");
        }

        if let Some(hosts) = json_config.authorized_redirect_hosts {
            self.guard.set_authorized_hosts(hosts)?;
        }

        if let Some(mappers) = json_config.mappers {
            self.mappers.replace(mappers)?;
        }

        if let Some(context_path) = json_config.context_path {
            *self
                .context_path
                .write()
                .map_err(|_| anyhow!("Context path lock poisoned"))? = context_path;
        }

        for tenant_json in &json_config.tenants {
            let tenant = tenant_json.tenant();
            let existing = self.settings.get(&tenant)?;
            let mut config = existing
                .as_deref()
                .cloned()
                .unwrap_or_else(|| TenantSamlConfig::new(tenant.clone()));
            tenant_json.apply_to(&mut config);
            if config.enabled {
                ensure_key_material(&mut config)
                    .with_context(|| format!("Failed to generate SP keys for site {}", tenant))?;
            }

            config
                .validate()
                .map_err(|e| anyhow!("Invalid SAML settings for site {}: {}", tenant, e))?;
            if config.enabled {
                self.registry
                    .validate_settings(&config)
                    .map_err(|e| anyhow!("Invalid SAML settings for site {}: {}", tenant, e))?;
            }

            if existing.as_deref() != Some(&config) {
                self.settings
                    .save(config)
                    .with_context(|| format!("Failed to save SAML settings for site {}", tenant))?;
            } else {
                debug!(site = %tenant, "SAML settings unchanged");
            }
        }

        Ok(())
    }

    /// Build the flow's view of a request from proxy headers.
    fn request_from_headers(
        &self,
        headers: &HashMap<String, Vec<String>>,
        correlation_id: &str,
    ) -> Result<SamlRequest> {
        let first = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| headers.get(*name).and_then(|v| v.first()))
                .map(|s| s.as_str())
        };

        let path = first(&["path", ":path"]).unwrap_or("/");
        let method = first(&["method", ":method"]).unwrap_or("GET");
        let host = first(&["host", ":authority"]).ok_or_else(|| anyhow!("Request has no host"))?;
        let scheme = first(&[":scheme", "x-forwarded-proto"]).unwrap_or("http");

        let context_path = self
            .context_path
            .read()
            .map(|c| c.clone())
            .map_err(|_| anyhow!("Context path lock poisoned"))?;

        Ok(SamlRequest::from_parts(method, scheme, host, path)?
            .with_context_path(&context_path)
            .with_headers(headers)
            .with_correlation_id(correlation_id))
    }
}

/// Turn a flow response into a terminal agent response.
fn to_agent_response(leg: Leg, response: FlowResponse) -> AgentResponse {
    let mut agent_response = AgentResponse::block(response.status, response.body);

    for (name, value) in response.headers {
        agent_response = agent_response.add_response_header(HeaderOp::Set { name, value });
    }
    for cookie in response.cookies {
        agent_response = agent_response.add_response_header(HeaderOp::Add {
            name: "Set-Cookie".to_string(),
            value: cookie.to_header_value(),
        });
    }

    agent_response.with_audit(AuditMetadata {
        tags: vec!["auth".to_string(), "saml".to_string(), leg.as_str().to_string()],
        ..Default::default()
    })
}

#[async_trait::async_trait]
impl AgentHandler for SamlSitesAgent {
    async fn on_configure(&self, event: ConfigureEvent) -> AgentResponse {
        let json_config: AgentConfigJson = match serde_json::from_value(event.config) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("Failed to parse SAML sites config: {}, keeping current settings", e);
                return AgentResponse::default_allow();
            }
        };

        if let Err(e) = self.reconfigure(json_config) {
            warn!("Failed to reconfigure SAML sites agent: {}", e);
            return AgentResponse::block(500, Some(format!("Configuration error: {}", e)));
        }

        info!("SAML sites agent configured via on_configure");
        AgentResponse::default_allow()
    }

    async fn on_request_headers(&self, event: RequestHeadersEvent) -> AgentResponse {
        let request_path = event
            .headers
            .get("path")
            .or_else(|| event.headers.get(":path"))
            .and_then(|v| v.first())
            .map(|s| s.as_str())
            .unwrap_or("/");

        let Some(leg) = Leg::from_path(request_path) else {
            return AgentResponse::default_allow();
        };

        let request = match self.request_from_headers(&event.headers, &event.metadata.correlation_id) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed SAML request");
                return AgentResponse::block(400, Some("Bad request".to_string()));
            }
        };

        // The IdP posts its response as a form; wait for the body.
        if leg == Leg::Callback && request.is_post() {
            debug!("SAML callback hit, waiting for body");
            if let Ok(mut pending) = self.pending.write() {
                pending.insert(
                    event.metadata.correlation_id.clone(),
                    PendingCallback {
                        request,
                        body: Vec::new(),
                    },
                );
            }
            return AgentResponse::needs_more_data();
        }

        match self.orchestrator.handle(leg, &request) {
            Some(response) => to_agent_response(leg, response),
            None => AgentResponse::default_allow(),
        }
    }

    async fn on_request_body_chunk(&self, event: RequestBodyChunkEvent) -> AgentResponse {
        let finished = {
            let mut pending = match self.pending.write() {
                Ok(p) => p,
                Err(_) => {
                    return AgentResponse::block(500, Some("Internal error".to_string()));
                }
            };

            let Some(callback) = pending.get_mut(&event.correlation_id) else {
                return AgentResponse::default_allow();
            };
            callback.body.extend_from_slice(event.data.as_bytes());

            if !event.is_last {
                return AgentResponse::needs_more_data();
            }
            pending.remove(&event.correlation_id)
        };

        let Some(PendingCallback { request, body }) = finished else {
            return AgentResponse::default_allow();
        };

        let body = match String::from_utf8(body) {
            Ok(s) => s,
            Err(_) => {
                return AgentResponse::block(400, Some("Invalid request body".to_string()));
            }
        };

        let request = match request.with_form_body(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed SAML callback body");
                return AgentResponse::block(400, Some("Invalid request body".to_string()));
            }
        };

        to_agent_response(Leg::Callback, self.orchestrator.callback(&request))
    }

    async fn on_response_headers(&self, _event: ResponseHeadersEvent) -> AgentResponse {
        AgentResponse::default_allow()
    }
}

/// Parse comma-separated host names.
fn parse_hosts(hosts: Option<&str>) -> Vec<String> {
    hosts
        .map(|list| {
            list.split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "{}={},zentinel_agent_protocol=info",
            env!("CARGO_CRATE_NAME"),
            log_level
        ))
        .json()
        .init();

    info!("Starting Zentinel SAML Sites Agent");

    let settings = Arc::new(
        SettingsStore::open(&args.settings_store).context("Failed to open SAML settings store")?,
    );
    let events = settings.subscribe();

    let authorized_hosts = parse_hosts(args.authorized_redirect_hosts.as_deref());
    info!(
        settings_store = ?args.settings_store,
        metadata_dir = ?args.metadata_dir,
        context_path = %args.context_path,
        authorized_redirect_hosts = authorized_hosts.len(),
        "Configuration loaded"
    );

    let agent = SamlSitesAgent::new(
        Arc::clone(&settings),
        Arc::new(SamaelClientFactory),
        args.metadata_dir.clone(),
        &args.context_path,
        authorized_hosts,
    );

    info!("Starting settings change listener");
    let _listener_handle =
        spawn_settings_listener(SettingsChangeListener::new(settings, agent.registry()), events);

    // Start agent server
    info!(socket = ?args.socket, "Starting agent server");
    let server = AgentServer::new("zentinel-saml-sites-agent", args.socket, Box::new(agent));
    server.run().await.map_err(|e| anyhow!("{}", e))?;

    Ok(())
}
