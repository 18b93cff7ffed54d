//! Carries the pre-login context across the IdP round trip in cookies.

use std::sync::Arc;
use tracing::{debug, warn};

use super::redirect::RedirectGuard;
use super::request::{SamlRequest, SetCookie};
use crate::settings::SettingsStore;
use crate::site::{encode_preference, LocaleNegotiator, SiteCatalog, TenantId, SITE_PARAM};

/// Request parameter naming the post-login target.
pub const REDIRECT_PARAM: &str = "redirect";

/// Cookie holding the authorized post-login target.
pub const REDIRECT_COOKIE: &str = "redirect";

/// Cookie holding the base64 `Accept-Language` seen at connect time.
pub const PREFERRED_LANGUAGE_COOKIE: &str = "preferredLanguage";

/// Cookie carrying the id of the session opened by a successful login.
pub const SESSION_COOKIE: &str = "samlSession";

/// Context captured before leaving for the IdP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticationContext {
    /// Authorized post-login target.
    pub redirect: Option<String>,
    /// Encoded `Accept-Language`.
    pub preferred_language: Option<String>,
    /// Site-scoped value echoed from the `site` parameter.
    pub site_value: Option<String>,
}

impl AuthenticationContext {
    /// Read the context back from the cookies of `request`.
    pub fn from_cookies(request: &SamlRequest, tenant: &TenantId) -> Self {
        Self {
            redirect: request.cookie(REDIRECT_COOKIE).filter(|v| !v.is_empty()),
            preferred_language: request.cookie(PREFERRED_LANGUAGE_COOKIE).filter(|v| !v.is_empty()),
            site_value: request.cookie(tenant.as_str()),
        }
    }

    /// Cookies persisting this context, scoped to `path`.
    pub fn to_cookies(&self, tenant: &TenantId, path: &str, secure: bool) -> Vec<SetCookie> {
        let mut cookies = Vec::new();
        if let Some(ref language) = self.preferred_language {
            cookies.push(SetCookie::new(PREFERRED_LANGUAGE_COOKIE, language, path, secure));
        }
        if let Some(ref redirect) = self.redirect {
            cookies.push(SetCookie::new(REDIRECT_COOKIE, redirect, path, secure));
        }
        if let Some(ref value) = self.site_value {
            if is_cookie_name(tenant.as_str()) {
                cookies.push(SetCookie::new(tenant.as_str(), value, path, secure));
            }
        }
        cookies
    }
}

/// Stores and restores the authentication context of a login.
pub struct ContextPropagator {
    guard: Arc<RedirectGuard>,
    catalog: Arc<SiteCatalog>,
    settings: Arc<SettingsStore>,
    negotiator: LocaleNegotiator,
}

impl ContextPropagator {
    pub fn new(guard: Arc<RedirectGuard>, catalog: Arc<SiteCatalog>, settings: Arc<SettingsStore>) -> Self {
        Self {
            guard,
            catalog,
            settings,
            negotiator: LocaleNegotiator::new(),
        }
    }

    /// Capture the context of a connect request as cookies to set.
    ///
    /// The redirect target is only kept when the guard authorizes it.
    pub fn store(&self, request: &SamlRequest, tenant: &TenantId) -> Vec<SetCookie> {
        let preferred_language = request.header("accept-language").map(encode_preference);

        let redirect = request.param(REDIRECT_PARAM).and_then(|candidate| {
            if self.guard.is_authorized(&request.request_url(), Some(candidate), false) {
                Some(candidate.to_string())
            } else {
                warn!(site = %tenant, "Unauthorized redirect parameter ignored");
                None
            }
        });

        let site_value = request
            .param(SITE_PARAM)
            .map(|v| v.chars().filter(|c| *c != '\n' && *c != '\r').collect());

        let context = AuthenticationContext {
            redirect,
            preferred_language,
            site_value,
        };
        context.to_cookies(tenant, &cookie_path(request), request.is_secure())
    }

    /// Where to send the user after a successful login.
    ///
    /// Uses the redirect stored at connect time if present, otherwise the
    /// site's post-login path under the negotiated locale. The stored value
    /// was authorized against the connect host, which may differ from the
    /// callback host. The site key is always appended as the `site` query
    /// parameter.
    pub fn resolve_redirect(&self, request: &SamlRequest, tenant: &TenantId) -> String {
        let context = AuthenticationContext::from_cookies(request, tenant);

        let mut redirect = match context.redirect.clone() {
            Some(stored) => stored,
            None => self.default_redirect(request, tenant, &context),
        };
        if redirect.is_empty() {
            redirect = "/".to_string();
        }

        let separator = if redirect.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}={}",
            redirect,
            separator,
            SITE_PARAM,
            urlencoding::encode(tenant.as_str())
        )
    }

    /// Open the browser session of a completed login.
    ///
    /// A fresh id is issued on every login, never taken from the request.
    pub fn open_session(&self, request: &SamlRequest) -> (String, SetCookie) {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let cookie = SetCookie::new(SESSION_COOKIE, &session_id, &cookie_path(request), request.is_secure());
        (session_id, cookie)
    }

    fn default_redirect(&self, request: &SamlRequest, tenant: &TenantId, context: &AuthenticationContext) -> String {
        let post_login_path = match self.settings.get(tenant) {
            Ok(Some(config)) => config.post_login_path.clone(),
            Ok(None) => "/".to_string(),
            Err(e) => {
                debug!(site = %tenant, error = %e, "Settings unavailable, using / as post-login path");
                "/".to_string()
            }
        };

        match self.catalog.get(tenant) {
            Some(site) => {
                let locale = self.negotiator.negotiate(
                    &site,
                    context.preferred_language.as_deref(),
                    &request.locales(),
                );
                format!("{}/{}{}", request.context_path(), locale, post_login_path)
            }
            None => format!("{}{}", request.context_path(), post_login_path),
        }
    }
}

fn cookie_path(request: &SamlRequest) -> String {
    match request.context_path() {
        "" => "/".to_string(),
        path => path.to_string(),
    }
}

/// RFC 6265 token characters.
fn is_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_graphic()
                && !matches!(
                    b,
                    b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"' | b'/' | b'['
                        | b']' | b'?' | b'=' | b'{' | b'}'
                )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::TenantSamlConfig;
    use crate::site::Site;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        propagator: ContextPropagator,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let settings = Arc::new(SettingsStore::open(&dir.path().join("settings.redb")).unwrap());
        let mut config = TenantSamlConfig::new(TenantId::from("a"));
        config.post_login_path = "/home".to_string();
        settings.save(config).unwrap();

        let catalog = Arc::new(SiteCatalog::with_sites(vec![
            Site::new("a").with_languages("en", &["fr"]),
            Site::new("b"),
        ]));
        let guard = Arc::new(RedirectGuard::new(vec!["trusted.example.com".to_string()]));
        Fixture {
            _dir: dir,
            propagator: ContextPropagator::new(guard, catalog, settings),
        }
    }

    fn connect(query: &str) -> SamlRequest {
        SamlRequest::from_url("GET", &format!("https://mysite.com/connect.saml?{}", query)).unwrap()
    }

    /// Replay the cookies set on one response as the next request's Cookie header.
    fn callback_with(cookies: &[SetCookie]) -> SamlRequest {
        let header = cookies
            .iter()
            .map(|c| format!("{}={}", c.name, urlencoding::encode(&c.value)))
            .collect::<Vec<_>>()
            .join("; ");
        SamlRequest::from_url("POST", "https://mysite.com/callback.saml")
            .unwrap()
            .with_header("Cookie", &header)
    }

    #[test]
    fn test_redirect_round_trip() {
        let f = fixture();
        let tenant = TenantId::from("a");
        let cookies = f.propagator.store(&connect("site=a&redirect=%2Ffoo%3Fx%3D1"), &tenant);

        let redirect = cookies.iter().find(|c| c.name == REDIRECT_COOKIE).unwrap();
        assert_eq!(redirect.value, "/foo?x=1");
        assert_eq!(redirect.path, "/");
        assert!(redirect.secure);

        let resolved = f.propagator.resolve_redirect(&callback_with(&cookies), &tenant);
        assert_eq!(resolved, "/foo?x=1&site=a");
    }

    #[test]
    fn test_unauthorized_redirect_not_stored() {
        let f = fixture();
        let tenant = TenantId::from("a");
        let cookies = f.propagator.store(&connect("redirect=https%3A%2F%2Fevil.com"), &tenant);
        assert!(cookies.iter().all(|c| c.name != REDIRECT_COOKIE));

        // Falls back to the locale-aware post-login path.
        let resolved = f.propagator.resolve_redirect(&callback_with(&cookies), &tenant);
        assert_eq!(resolved, "/en/home?site=a");
    }

    #[test]
    fn test_preferred_language_and_site_cookies() {
        let f = fixture();
        let tenant = TenantId::from("a");
        let request = connect("site=a").with_header("Accept-Language", "fr-CH, fr;q=0.9");
        let cookies = f.propagator.store(&request, &tenant);

        let site = cookies.iter().find(|c| c.name == "a").unwrap();
        assert_eq!(site.value, "a");
        assert!(cookies.iter().any(|c| c.name == PREFERRED_LANGUAGE_COOKIE));

        // The callback carries no Accept-Language; the cookie decides.
        let resolved = f.propagator.resolve_redirect(&callback_with(&cookies), &tenant);
        assert_eq!(resolved, "/fr/home?site=a");
    }

    #[test]
    fn test_default_redirect_without_settings() {
        let f = fixture();
        let tenant = TenantId::from("b");
        let resolved = f.propagator.resolve_redirect(&callback_with(&[]), &tenant);
        assert_eq!(resolved, "/en/?site=b");

        // Unknown site: no locale segment.
        let resolved = f.propagator.resolve_redirect(&callback_with(&[]), &TenantId::from("zz"));
        assert_eq!(resolved, "/?site=zz");
    }

    #[test]
    fn test_cookie_path_follows_context_path() {
        let f = fixture();
        let request = SamlRequest::from_url("GET", "http://mysite.com/cms/connect.saml?redirect=%2Fcms%2Fpage")
            .unwrap()
            .with_context_path("/cms");
        let cookies = f.propagator.store(&request, &TenantId::from("a"));
        let redirect = cookies.iter().find(|c| c.name == REDIRECT_COOKIE).unwrap();
        assert_eq!(redirect.path, "/cms");
        assert!(!redirect.secure);
    }

    #[test]
    fn test_redirect_survives_callback_on_another_host() {
        let f = fixture();
        let tenant = TenantId::from("a");
        let request = SamlRequest::from_url(
            "GET",
            "https://www.site.com/connect.saml?redirect=https%3A%2F%2Fwww.site.com%2Fpage",
        )
        .unwrap();
        let cookies = f.propagator.store(&request, &tenant);

        let header = cookies
            .iter()
            .map(|c| format!("{}={}", c.name, urlencoding::encode(&c.value)))
            .collect::<Vec<_>>()
            .join("; ");
        let callback = SamlRequest::from_url("POST", "https://sso.site.com/callback.saml")
            .unwrap()
            .with_header("Cookie", &header);

        let resolved = f.propagator.resolve_redirect(&callback, &tenant);
        assert_eq!(resolved, "https://www.site.com/page?site=a");
    }

    #[test]
    fn test_session_ids_are_fresh() {
        let f = fixture();
        let request = callback_with(&[SetCookie::new(SESSION_COOKIE, "attacker-chosen", "/", true)]);
        let (first, cookie) = f.propagator.open_session(&request);
        let (second, _) = f.propagator.open_session(&request);

        assert_eq!(cookie.name, SESSION_COOKIE);
        assert_eq!(cookie.value, first);
        assert!(cookie.to_header_value().contains("HttpOnly"));
        assert_ne!(first, "attacker-chosen");
        assert_ne!(first, second);
    }

    #[test]
    fn test_cookie_name_check() {
        assert!(is_cookie_name("site-a_1"));
        assert!(!is_cookie_name("bad name"));
        assert!(!is_cookie_name("a=b"));
        assert!(!is_cookie_name(""));
    }
}
