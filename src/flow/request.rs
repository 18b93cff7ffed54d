//! Protocol-neutral view of an incoming request and of the response the flow
//! produces for it.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use url::Url;

use crate::site::{parse_accept_language, Locale};

/// An HTTP request as seen by the SAML flow.
///
/// Parameters merge the query string and, once buffered, the urlencoded form
/// body. Header names are stored lowercase.
#[derive(Debug, Clone)]
pub struct SamlRequest {
    method: String,
    scheme: String,
    server_name: String,
    server_port: u16,
    context_path: String,
    path: String,
    params: Vec<(String, String)>,
    headers: HashMap<String, Vec<String>>,
    correlation_id: String,
}

impl SamlRequest {
    /// Build a request from an absolute URL.
    pub fn from_url(method: &str, url: &str) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("Invalid request URL: {}", url))?;
        let server_name = parsed
            .host_str()
            .ok_or_else(|| anyhow!("Request URL has no host: {}", url))?
            .to_string();
        let server_port = parsed
            .port_or_known_default()
            .ok_or_else(|| anyhow!("Request URL has no port: {}", url))?;

        Ok(Self {
            method: method.to_uppercase(),
            scheme: parsed.scheme().to_string(),
            server_name,
            server_port,
            context_path: String::new(),
            path: parsed.path().to_string(),
            params: parsed.query_pairs().into_owned().collect(),
            headers: HashMap::new(),
            correlation_id: String::new(),
        })
    }

    /// Build a request from the pieces a proxy hands over.
    pub fn from_parts(method: &str, scheme: &str, host: &str, path_and_query: &str) -> Result<Self> {
        let path_and_query = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };
        Self::from_url(method, &format!("{}://{}{}", scheme, host, path_and_query))
    }

    /// Set the application context path (`""` or `/app`).
    pub fn with_context_path(mut self, context_path: &str) -> Self {
        self.context_path = normalize_context_path(context_path);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn with_headers(mut self, headers: &HashMap<String, Vec<String>>) -> Self {
        for (name, values) in headers {
            self.headers
                .entry(name.to_ascii_lowercase())
                .or_default()
                .extend(values.iter().cloned());
        }
        self
    }

    /// Merge an `application/x-www-form-urlencoded` body into the parameters.
    pub fn with_form_body(mut self, body: &str) -> Result<Self> {
        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_str(body).context("Failed to parse form body")?;
        self.params.extend(pairs);
        Ok(self)
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = correlation_id.to_string();
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_post(&self) -> bool {
        self.method == "POST"
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("https")
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// First value of a query or form parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First value of a header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    /// Value of a request cookie, percent-decoded.
    pub fn cookie(&self, name: &str) -> Option<String> {
        let prefix = format!("{}=", name);
        self.headers
            .get("cookie")?
            .iter()
            .flat_map(|header| header.split(';'))
            .find_map(|part| part.trim().strip_prefix(prefix.as_str()).map(str::to_string))
            .map(|raw| {
                urlencoding::decode(&raw)
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or(raw)
            })
    }

    /// Locales from `Accept-Language`, most preferred first.
    pub fn locales(&self) -> Vec<Locale> {
        self.header("accept-language")
            .map(parse_accept_language)
            .unwrap_or_default()
    }

    /// Scheme, host and port; the port is omitted when it is the scheme default.
    pub fn origin(&self) -> String {
        origin(&self.scheme, &self.server_name, self.server_port)
    }

    /// Origin as seen by the browser, honoring `X-Forwarded-Server`.
    pub fn public_origin(&self) -> String {
        match self.header("x-forwarded-server").filter(|h| !h.is_empty()) {
            Some(forwarded) => origin(&self.scheme, forwarded, self.server_port),
            None => self.origin(),
        }
    }

    /// The request URL without its query string.
    pub fn request_url(&self) -> String {
        format!("{}{}", self.origin(), self.path)
    }
}

fn origin(scheme: &str, host: &str, port: u16) -> String {
    let default_port = match scheme {
        "https" => 443,
        "http" => 80,
        _ => 0,
    };
    if port == default_port {
        format!("{}://{}", scheme, host)
    } else {
        format!("{}://{}:{}", scheme, host, port)
    }
}

pub(crate) fn normalize_context_path(context_path: &str) -> String {
    let trimmed = context_path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// A cookie to set on the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub secure: bool,
}

impl SetCookie {
    pub fn new(name: &str, value: &str, path: &str, secure: bool) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            path: path.to_string(),
            secure,
        }
    }

    /// Render the `Set-Cookie` header value.
    pub fn to_header_value(&self) -> String {
        let mut cookie = format!("{}={}", self.name, urlencoding::encode(&self.value));

        cookie.push_str(&format!("; Path={}", self.path));
        cookie.push_str("; HttpOnly");

        // The cross-site IdP POST must still carry the cookie.
        if self.secure {
            cookie.push_str("; Secure; SameSite=None");
        }

        cookie
    }
}

/// The response the flow wants sent back to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<SetCookie>,
    pub body: Option<String>,
}

impl FlowResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: None,
        }
    }

    /// Plain error response. The message must not carry internal detail.
    pub fn error(status: u16, message: &str) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(message)
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self::new(status).with_header("Location", location)
    }

    pub fn html(body: &str) -> Self {
        Self::new(200)
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_header("Cache-Control", "no-cache, no-store")
            .with_body(body)
    }

    pub fn xml(body: &str) -> Self {
        Self::new(200)
            .with_header("Content-Type", "application/xml; charset=utf-8")
            .with_body(body)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    /// Prepend cookies collected before the response itself was known.
    pub fn with_cookies(mut self, cookies: Vec<SetCookie>) -> Self {
        let mut all = cookies;
        all.append(&mut self.cookies);
        self.cookies = all;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&SetCookie> {
        self.cookies.iter().find(|c| c.name == name)
    }
}
