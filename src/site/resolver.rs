//! Maps an incoming request to the tenant it belongs to.

use std::sync::Arc;
use tracing::debug;

use super::catalog::{SiteCatalog, TenantId};
use crate::flow::SamlRequest;

/// Request parameter carrying an explicit site key.
pub const SITE_PARAM: &str = "site";

/// Resolves the tenant for a request.
///
/// Precedence: explicit `site` parameter, then the only hosted site, then the
/// site bound to the request's server name.
pub struct SiteKeyResolver {
    catalog: Arc<SiteCatalog>,
}

impl SiteKeyResolver {
    pub fn new(catalog: Arc<SiteCatalog>) -> Self {
        Self { catalog }
    }

    pub fn resolve(&self, request: &SamlRequest) -> Option<TenantId> {
        if let Some(key) = request.param(SITE_PARAM).filter(|k| !k.is_empty()) {
            return Some(TenantId::new(key));
        }

        let keys = self.catalog.keys();
        if let [only] = keys.as_slice() {
            return Some(only.clone());
        }

        let resolved = self.catalog.find_by_server_name(request.server_name());
        if resolved.is_none() {
            debug!(
                server_name = %request.server_name(),
                sites = keys.len(),
                "No site matches request"
            );
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::Site;

    fn request(url: &str) -> SamlRequest {
        SamlRequest::from_url("GET", url).unwrap()
    }

    #[test]
    fn test_explicit_param_wins() {
        let catalog = Arc::new(SiteCatalog::with_sites(vec![
            Site::new("a").with_server_name("a.example.com"),
            Site::new("b"),
        ]));
        let resolver = SiteKeyResolver::new(catalog);

        let resolved = resolver.resolve(&request("https://a.example.com/connect.saml?site=b"));
        assert_eq!(resolved, Some(TenantId::from("b")));
    }

    #[test]
    fn test_single_site_regardless_of_host() {
        let catalog = Arc::new(SiteCatalog::with_sites(vec![Site::new("only")]));
        let resolver = SiteKeyResolver::new(catalog);

        let resolved = resolver.resolve(&request("https://unrelated.example.org/connect.saml"));
        assert_eq!(resolved, Some(TenantId::from("only")));
    }

    #[test]
    fn test_server_name_lookup() {
        let catalog = Arc::new(SiteCatalog::with_sites(vec![
            Site::new("a").with_server_name("a.example.com"),
            Site::new("b").with_server_name("b.example.com"),
        ]));
        let resolver = SiteKeyResolver::new(catalog);

        assert_eq!(
            resolver.resolve(&request("https://b.example.com/connect.saml")),
            Some(TenantId::from("b"))
        );
        assert_eq!(resolver.resolve(&request("https://c.example.com/connect.saml")), None);
        // An empty parameter does not count as explicit.
        assert_eq!(
            resolver.resolve(&request("https://a.example.com/connect.saml?site=")),
            Some(TenantId::from("a"))
        );
    }

    #[test]
    fn test_empty_catalog() {
        let resolver = SiteKeyResolver::new(Arc::new(SiteCatalog::new()));
        assert_eq!(resolver.resolve(&request("https://a.example.com/connect.saml")), None);
    }
}
