//! samael-backed SAML Service Provider client.
//!
//! Handles SP-initiated SSO for one site: AuthnRequest creation for both
//! bindings, response validation and SP metadata rendering.

use anyhow::{anyhow, bail, Context};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey};
use samael::metadata::EntityDescriptor;
use samael::service_provider::{ServiceProvider, ServiceProviderBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use x509_parser::pem::parse_x509_pem;

use super::client::{
    Credentials, ProtocolClient, ProtocolClientFactory, RedirectionAction, SamlIdentity,
};
use super::config::{SamlBinding, TenantSamlConfig};
use crate::error::{ClientError, ProtocolError};
use crate::flow::SamlRequest;

const SIG_ALG_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

/// SAML client for one site, built from its settings.
pub struct SamaelClient {
    config: TenantSamlConfig,
    callback_url: String,
    idp_entity_id: String,
    /// IdP SSO endpoint for the configured binding.
    sso_location: Option<String>,
    /// Verifies response signatures against the IdP signing certificates.
    service_provider: ServiceProvider,
    signing_key: Option<EncodingKey>,
    /// Base64 DER of the SP certificate.
    certificate: Option<String>,
    /// Assertion ID → time after which it can be forgotten.
    used_assertions: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SamaelClient {
    /// Build a client, validating metadata and key material up front.
    pub fn new(config: &TenantSamlConfig, callback_url: &str) -> Result<Self, ClientError> {
        config.validate().map_err(ClientError::Configuration)?;
        if !config.enabled {
            return Err(ClientError::Configuration(format!(
                "SAML is not enabled for site {}",
                config.site
            )));
        }

        let metadata_xml = config.idp_metadata_xml.as_deref().unwrap_or_default();
        let metadata: EntityDescriptor = metadata_xml
            .parse()
            .map_err(|e| ClientError::InvalidMetadata(format!("{}", e)))?;

        let idp_entity_id = metadata
            .entity_id
            .clone()
            .ok_or_else(|| ClientError::InvalidMetadata("missing entityID".to_string()))?;

        let descriptors = metadata
            .idp_sso_descriptors
            .as_ref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| ClientError::InvalidMetadata("no IDPSSODescriptor".to_string()))?;

        let sso_location = descriptors
            .iter()
            .flat_map(|d| d.single_sign_on_services.iter())
            .find(|endpoint| endpoint.binding == config.binding.as_urn())
            .map(|endpoint| endpoint.location.clone());

        if sso_location.is_none() {
            warn!(
                site = %config.site,
                binding = %config.binding,
                "IdP metadata has no SingleSignOnService for the configured binding"
            );
        }

        // Responses are unsolicited from samael's point of view: no AuthnRequest
        // id is kept between the connect and callback legs.
        let service_provider = ServiceProviderBuilder::default()
            .entity_id(config.sp_entity_id.clone())
            .acs_url(callback_url.to_string())
            .idp_metadata(metadata)
            .allow_idp_initiated(true)
            .max_clock_skew(Duration::seconds(config.clock_skew_secs))
            .build()
            .map_err(|e| anyhow!("Failed to build SAML service provider: {}", e))?;

        match service_provider.idp_signing_certs() {
            Ok(Some(certs)) if !certs.is_empty() => {}
            Ok(_) => {
                return Err(ClientError::InvalidMetadata(
                    "no IdP signing certificate".to_string(),
                ))
            }
            Err(e) => {
                return Err(ClientError::InvalidMetadata(format!(
                    "invalid IdP signing certificate: {}",
                    e
                )))
            }
        }

        let certificate = config
            .certificate_pem
            .as_deref()
            .map(parse_certificate)
            .transpose()
            .map_err(|e| ClientError::Configuration(format!("invalid SP certificate: {}", e)))?;

        let signing_key = if config.sign_authn_request {
            let pem = config
                .private_key_pem
                .as_deref()
                .ok_or_else(|| ClientError::Configuration("missing keystore".to_string()))?;
            if pem.contains("ENCRYPTED") {
                return Err(ClientError::Configuration(
                    "encrypted private keys are not supported".to_string(),
                ));
            }
            let key = EncodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| ClientError::Configuration(format!("invalid private key: {}", e)))?;
            Some(key)
        } else {
            None
        };

        info!(
            site = %config.site,
            idp = %idp_entity_id,
            callback_url = %callback_url,
            "SAML client initialized"
        );

        Ok(Self {
            config: config.clone(),
            callback_url: callback_url.to_string(),
            idp_entity_id,
            sso_location,
            service_provider,
            signing_key,
            certificate,
            used_assertions: Mutex::new(HashMap::new()),
        })
    }

    pub fn idp_entity_id(&self) -> &str {
        &self.idp_entity_id
    }

    fn authn_request_xml(&self, destination: &str) -> String {
        let request_id = format!("_id{}", uuid::Uuid::new_v4());
        let issue_instant = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let name_id_policy = self
            .config
            .name_id_format
            .as_deref()
            .map(|format| {
                format!(
                    r#"<samlp:NameIDPolicy Format="{}" AllowCreate="true"/>"#,
                    xml_escape(format)
                )
            })
            .unwrap_or_default();

        format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0" IssueInstant="{}" Destination="{}" AssertionConsumerServiceURL="{}" ProtocolBinding="{}" ForceAuthn="{}" IsPassive="{}"><saml:Issuer>{}</saml:Issuer>{}</samlp:AuthnRequest>"#,
            request_id,
            issue_instant,
            xml_escape(destination),
            xml_escape(&self.callback_url),
            SamlBinding::HttpPost.as_urn(),
            self.config.force_auth,
            self.config.passive,
            xml_escape(&self.config.sp_entity_id),
            name_id_policy
        )
    }

    /// HTTP-Redirect binding URL, signed when a signing key is configured.
    fn redirect_url(&self, location: &str, xml: &str) -> anyhow::Result<String> {
        let encoded = deflate_and_encode(xml)?;
        let mut query = format!("SAMLRequest={}", urlencoding::encode(&encoded));

        if let Some(ref key) = self.signing_key {
            query.push_str(&format!("&SigAlg={}", urlencoding::encode(SIG_ALG_RSA_SHA256)));
            let signature = jsonwebtoken::crypto::sign(query.as_bytes(), key, Algorithm::RS256)
                .context("Failed to sign AuthnRequest")?;
            // jsonwebtoken yields base64url; the binding wants standard base64.
            let raw = URL_SAFE_NO_PAD
                .decode(signature)
                .context("Failed to decode AuthnRequest signature")?;
            query.push_str(&format!("&Signature={}", urlencoding::encode(&BASE64.encode(raw))));
        }

        let separator = if location.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}{}", location, separator, query))
    }

    fn auto_post_form(location: &str, xml: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>SAML login</title></head>
<body onload="document.forms[0].submit()">
<noscript><p>JavaScript is disabled. Click Continue to sign in.</p></noscript>
<form method="post" action="{}">
<input type="hidden" name="SAMLRequest" value="{}"/>
<noscript><input type="submit" value="Continue"/></noscript>
</form>
</body>
</html>"#,
            xml_escape(location),
            BASE64.encode(xml)
        )
    }

    /// Record an assertion ID, failing if it was seen before.
    fn check_replay(&self, assertion_id: &str, forget_after: DateTime<Utc>) -> Result<(), ProtocolError> {
        let mut used = self
            .used_assertions
            .lock()
            .map_err(|_| anyhow!("Replay cache lock poisoned"))?;

        let now = Utc::now();
        used.retain(|_, expiry| *expiry > now);

        if used.contains_key(assertion_id) {
            return Err(ProtocolError::Rejected("assertion replay detected".to_string()));
        }
        used.insert(assertion_id.to_string(), forget_after);
        Ok(())
    }
}

impl ProtocolClient for SamaelClient {
    fn callback_url(&self) -> &str {
        &self.callback_url
    }

    fn redirection_action(&self, request: &SamlRequest) -> Result<Option<RedirectionAction>, ProtocolError> {
        let Some(ref location) = self.sso_location else {
            return Ok(None);
        };
        let xml = self.authn_request_xml(location);

        let action = match self.config.binding {
            SamlBinding::HttpPost => RedirectionAction::InlineBody(Self::auto_post_form(location, &xml)),
            SamlBinding::HttpRedirect => {
                let url = self.redirect_url(location, &xml)?;
                if request.is_post() {
                    RedirectionAction::SeeOther(url)
                } else {
                    RedirectionAction::Found(url)
                }
            }
        };

        debug!(site = %self.config.site, binding = %self.config.binding, "Created SAML AuthnRequest");
        Ok(Some(action))
    }

    fn credentials(&self, request: &SamlRequest) -> Option<Credentials> {
        let saml_response = request.param("SAMLResponse").filter(|v| !v.is_empty())?;
        Some(Credentials {
            saml_response: saml_response.to_string(),
            relay_state: request.param("RelayState").map(str::to_string),
        })
    }

    fn validate(&self, credentials: &Credentials) -> Result<SamlIdentity, ProtocolError> {
        let compact: String = credentials
            .saml_response
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let response_xml = BASE64
            .decode(compact)
            .context("Failed to decode SAML response")?;
        let response_str =
            String::from_utf8(response_xml).context("SAML response is not valid UTF-8")?;

        let response: samael::schema::Response = response_str
            .parse()
            .map_err(|e| anyhow!("Failed to parse SAML response: {}", e))?;

        let assertion_signed = response
            .assertion
            .as_ref()
            .is_some_and(|a| a.signature.is_some());
        if response.signature.is_none() && !assertion_signed {
            return Err(ProtocolError::Rejected("response is not signed".to_string()));
        }
        if self.config.require_signed_assertions && !assertion_signed {
            return Err(ProtocolError::Rejected("assertion is not signed".to_string()));
        }

        // Signatures, destination, issuer, status, conditions and audience.
        let assertion = self
            .service_provider
            .parse_xml_response(&response_str, None)
            .map_err(|e| ProtocolError::Rejected(e.to_string()))?;

        let now = Utc::now();
        let skew = Duration::seconds(self.config.clock_skew_secs);
        let max_age = Duration::seconds(self.config.max_authentication_lifetime_secs as i64);

        let authn_statement = assertion.authn_statements.as_ref().and_then(|s| s.first());
        if let Some(instant) = authn_statement.and_then(|s| s.authn_instant) {
            if now - instant > max_age + skew {
                return Err(ProtocolError::Rejected("authentication is too old".to_string()));
            }
        }

        let name_id = assertion
            .subject
            .as_ref()
            .and_then(|s| s.name_id.as_ref())
            .ok_or_else(|| ProtocolError::Rejected("assertion missing NameID".to_string()))?;

        let forget_after = assertion
            .conditions
            .as_ref()
            .and_then(|c| c.not_on_or_after)
            .map(|t| t + skew)
            .unwrap_or(now + max_age);
        self.check_replay(&assertion.id, forget_after)?;

        let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(ref attr_statements) = assertion.attribute_statements {
            for attr in attr_statements.iter().flat_map(|s| s.attributes.iter()) {
                if let Some(ref name) = attr.name {
                    let values: Vec<String> =
                        attr.values.iter().filter_map(|v| v.value.clone()).collect();
                    if !values.is_empty() {
                        attributes.entry(name.clone()).or_default().extend(values);
                    }
                }
            }
        }

        info!(
            site = %self.config.site,
            user_id = %name_id.value,
            idp = %self.idp_entity_id,
            attributes = attributes.len(),
            "SAML assertion validated"
        );

        Ok(SamlIdentity {
            name_id: name_id.value.clone(),
            name_id_format: name_id.format.clone(),
            assertion_id: assertion.id.clone(),
            idp_entity_id: self.idp_entity_id.clone(),
            session_index: authn_statement.and_then(|s| s.session_index.clone()),
            attributes,
        })
    }

    fn sp_metadata(&self) -> Result<String, ProtocolError> {
        let key_descriptor = self
            .certificate
            .as_deref()
            .map(|cert| {
                format!(
                    r#"
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo>
        <ds:KeyName>{}</ds:KeyName>
        <ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>"#,
                    xml_escape(&self.config.keystore_alias),
                    cert
                )
            })
            .unwrap_or_default();

        let name_id_format = self
            .config
            .name_id_format
            .as_deref()
            .map(|f| format!("\n    <md:NameIDFormat>{}</md:NameIDFormat>", xml_escape(f)))
            .unwrap_or_default();

        Ok(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" xmlns:ds="http://www.w3.org/2000/09/xmldsig#" entityID="{}">
  <md:SPSSODescriptor AuthnRequestsSigned="{}" WantAssertionsSigned="{}" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">{}{}
    <md:AssertionConsumerService Binding="{}" Location="{}" index="0" isDefault="true"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>
"#,
            xml_escape(&self.config.sp_entity_id),
            self.signing_key.is_some(),
            self.config.require_signed_assertions,
            key_descriptor,
            name_id_format,
            SamlBinding::HttpPost.as_urn(),
            xml_escape(&self.callback_url)
        ))
    }
}

/// Factory producing [`SamaelClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamaelClientFactory;

impl ProtocolClientFactory for SamaelClientFactory {
    fn build(&self, config: &TenantSamlConfig, callback_url: &str) -> Result<Arc<dyn ProtocolClient>, ClientError> {
        Ok(Arc::new(SamaelClient::new(config, callback_url)?))
    }
}

/// Decode a PEM certificate, check it parses, and return its base64 DER body.
pub(super) fn parse_certificate(pem: &str) -> anyhow::Result<String> {
    // Stored PEMs may come indented from JSON settings.
    let normalized: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .flat_map(|line| [line, "\n"])
        .collect();

    let (_, block) =
        parse_x509_pem(normalized.as_bytes()).map_err(|e| anyhow!("Invalid PEM: {:?}", e))?;
    if block.label != "CERTIFICATE" {
        bail!("Invalid PEM: expected CERTIFICATE, found {}", block.label);
    }

    let cert = block
        .parse_x509()
        .map_err(|e| anyhow!("Failed to parse X.509 certificate: {:?}", e))?;

    let not_after = cert.validity().not_after.timestamp();
    if not_after < Utc::now().timestamp() {
        warn!(subject = %cert.subject(), "SP certificate has expired");
    }

    Ok(BASE64.encode(&block.contents))
}

/// Deflate and base64 encode for SAML redirect binding.
fn deflate_and_encode(xml: &str) -> anyhow::Result<String> {
    use std::io::Write;

    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(xml.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::site::TenantId;
    use jsonwebtoken::DecodingKey;
    use samael::idp::{IdentityProvider, KeyType, Rsa};
    use std::io::Read;

    pub(crate) const IDP_METADATA: &str = include_str!("../../testdata/idp-metadata.xml");
    const IDP_KEY: &[u8] = include_bytes!("../../testdata/idp-key.der");
    const IDP_CERT: &[u8] = include_bytes!("../../testdata/idp-cert.der");
    const SP_CERT: &str = include_str!("../../testdata/sp-cert.pem");
    const SP_KEY: &str = include_str!("../../testdata/sp-key.pem");
    const SP_PUBLIC_KEY: &str = include_str!("../../testdata/sp-public.pem");
    const CALLBACK: &str = "https://a.example.com/callback.saml";

    pub(crate) fn test_config(site: &str) -> TenantSamlConfig {
        let mut config = TenantSamlConfig::new(TenantId::from(site));
        config.enabled = true;
        config.sp_entity_id = format!("https://{}.example.com/sp", site);
        config.idp_metadata_xml = Some(IDP_METADATA.to_string());
        config
    }

    const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

    struct Assertion {
        id: String,
        status: &'static str,
        audience: String,
        not_before: DateTime<Utc>,
        not_on_or_after: DateTime<Utc>,
        authn_instant: DateTime<Utc>,
    }

    impl Assertion {
        fn valid(id: &str) -> Self {
            let now = Utc::now();
            Self {
                id: id.to_string(),
                status: STATUS_SUCCESS,
                audience: "https://a.example.com/sp".to_string(),
                not_before: now - Duration::minutes(1),
                not_on_or_after: now + Duration::minutes(5),
                authn_instant: now - Duration::seconds(10),
            }
        }

        fn response_id(&self) -> String {
            format!("_resp{}", self.id)
        }

        fn xml(&self) -> String {
            let ts = |t: DateTime<Utc>| t.format("%Y-%m-%dT%H:%M:%SZ").to_string();
            format!(
                r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{response_id}" Version="2.0" IssueInstant="{now}" Destination="{callback}">
  <saml:Issuer>https://idp.example.com/saml</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>
  <saml:Assertion ID="{id}" Version="2.0" IssueInstant="{now}">
    <saml:Issuer>https://idp.example.com/saml</saml:Issuer>
    <saml:Subject>
      <saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">jdoe@example.com</saml:NameID>
    </saml:Subject>
    <saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{not_on_or_after}">
      <saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction>
    </saml:Conditions>
    <saml:AuthnStatement AuthnInstant="{authn_instant}" SessionIndex="_session1">
      <saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext>
    </saml:AuthnStatement>
    <saml:AttributeStatement>
      <saml:Attribute Name="email"><saml:AttributeValue>jdoe@example.com</saml:AttributeValue></saml:Attribute>
      <saml:Attribute Name="groups"><saml:AttributeValue>staff</saml:AttributeValue><saml:AttributeValue>editors</saml:AttributeValue></saml:Attribute>
    </saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#,
                response_id = self.response_id(),
                id = self.id,
                now = ts(Utc::now()),
                callback = CALLBACK,
                status = self.status,
                not_before = ts(self.not_before),
                not_on_or_after = ts(self.not_on_or_after),
                audience = self.audience,
                authn_instant = ts(self.authn_instant),
            )
        }

        /// Response and assertion both signed by the IdP key.
        fn encode(&self) -> Credentials {
            let xml = sign(&self.xml(), &self.id, IDP_KEY);
            encoded(&sign(&xml, &self.response_id(), IDP_KEY))
        }
    }

    fn signature_template(reference: &str) -> String {
        format!(
            r##"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:SignedInfo><ds:CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/><ds:SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"/><ds:Reference URI="#{}"><ds:Transforms><ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/><ds:Transform Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/></ds:Transforms><ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/><ds:DigestValue></ds:DigestValue></ds:Reference></ds:SignedInfo><ds:SignatureValue></ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>"##,
            reference,
            BASE64.encode(IDP_CERT)
        )
    }

    /// Insert an empty signature for `element_id` right after its Issuer.
    fn with_template(xml: &str, element_id: &str) -> String {
        let element = xml.find(&format!(r#"ID="{}""#, element_id)).unwrap();
        let issuer_end = "</saml:Issuer>";
        let at = element + xml[element..].find(issuer_end).unwrap() + issuer_end.len();
        format!("{}{}{}", &xml[..at], signature_template(element_id), &xml[at..])
    }

    /// Enveloped signature over the element with `element_id`.
    fn sign(xml: &str, element_id: &str, key: &[u8]) -> String {
        samael::crypto::sign_xml(with_template(xml, element_id), key).unwrap()
    }

    fn encoded(xml: &str) -> Credentials {
        Credentials {
            saml_response: BASE64.encode(xml),
            relay_state: None,
        }
    }

    fn client(config: &TenantSamlConfig) -> SamaelClient {
        SamaelClient::new(config, CALLBACK).unwrap()
    }

    fn rejected(result: Result<SamlIdentity, ProtocolError>) -> String {
        match result {
            Err(ProtocolError::Rejected(reason)) => reason,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_client_from_metadata() {
        let client = client(&test_config("a"));
        assert_eq!(client.idp_entity_id(), "https://idp.example.com/saml");
        assert_eq!(client.callback_url(), CALLBACK);
        assert_eq!(client.sso_location.as_deref(), Some("https://idp.example.com/sso/post"));
    }

    #[test]
    fn test_invalid_metadata_reported_distinctly() {
        let mut config = test_config("a");
        config.idp_metadata_xml = Some("<not-xml".to_string());
        assert!(matches!(
            SamaelClient::new(&config, CALLBACK),
            Err(ClientError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_configuration_errors() {
        let mut config = test_config("a");
        config.enabled = false;
        assert!(matches!(
            SamaelClient::new(&config, CALLBACK),
            Err(ClientError::Configuration(_))
        ));

        let mut config = test_config("a");
        config.certificate_pem = Some("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----".to_string());
        assert!(matches!(
            SamaelClient::new(&config, CALLBACK),
            Err(ClientError::Configuration(_))
        ));

        let mut config = test_config("a");
        config.binding = SamlBinding::HttpRedirect;
        config.sign_authn_request = true;
        assert!(matches!(
            SamaelClient::new(&config, CALLBACK),
            Err(ClientError::Configuration(_))
        ));
    }

    #[test]
    fn test_post_binding_inline_form() {
        let mut config = test_config("a");
        config.force_auth = true;
        let client = client(&config);
        let request = SamlRequest::from_url("GET", "https://a.example.com/connect.saml").unwrap();

        let Some(RedirectionAction::InlineBody(html)) = client.redirection_action(&request).unwrap() else {
            panic!("expected an inline form");
        };
        assert!(html.contains(r#"action="https://idp.example.com/sso/post""#));

        let marker = r#"name="SAMLRequest" value=""#;
        let start = html.find(marker).unwrap() + marker.len();
        let end = start + html[start..].find('"').unwrap();
        let xml = String::from_utf8(BASE64.decode(&html[start..end]).unwrap()).unwrap();
        assert!(xml.contains(r#"ForceAuthn="true""#));
        assert!(xml.contains(r#"IsPassive="false""#));
        assert!(xml.contains(&format!(r#"AssertionConsumerServiceURL="{}""#, CALLBACK)));
        assert!(xml.contains("<saml:Issuer>https://a.example.com/sp</saml:Issuer>"));
    }

    #[test]
    fn test_redirect_binding_status_follows_method() {
        let mut config = test_config("a");
        config.binding = SamlBinding::HttpRedirect;
        let client = client(&config);

        let get = SamlRequest::from_url("GET", "https://a.example.com/connect.saml").unwrap();
        match client.redirection_action(&get).unwrap() {
            Some(RedirectionAction::Found(url)) => {
                assert!(url.starts_with("https://idp.example.com/sso/redirect?SAMLRequest="));
                assert!(!url.contains("Signature="));
            }
            other => panic!("expected Found, got {:?}", other),
        }

        let post = SamlRequest::from_url("POST", "https://a.example.com/connect.saml").unwrap();
        assert!(matches!(
            client.redirection_action(&post).unwrap(),
            Some(RedirectionAction::SeeOther(_))
        ));
    }

    #[test]
    fn test_signed_redirect_verifies() {
        let mut config = test_config("a");
        config.binding = SamlBinding::HttpRedirect;
        config.sign_authn_request = true;
        config.private_key_pem = Some(SP_KEY.to_string());
        let client = client(&config);

        let request = SamlRequest::from_url("GET", "https://a.example.com/connect.saml").unwrap();
        let Some(RedirectionAction::Found(url)) = client.redirection_action(&request).unwrap() else {
            panic!("expected Found");
        };

        let query = url.split_once('?').unwrap().1;
        let (signed_part, signature) = query.split_once("&Signature=").unwrap();
        assert!(signed_part.contains("&SigAlg="));

        let raw = BASE64
            .decode(urlencoding::decode(signature).unwrap().as_bytes())
            .unwrap();
        let key = DecodingKey::from_rsa_pem(SP_PUBLIC_KEY.as_bytes()).unwrap();
        let verified = jsonwebtoken::crypto::verify(
            &URL_SAFE_NO_PAD.encode(raw),
            signed_part.as_bytes(),
            &key,
            Algorithm::RS256,
        )
        .unwrap();
        assert!(verified);

        // The request itself must inflate back to the AuthnRequest.
        let encoded = signed_part
            .strip_prefix("SAMLRequest=")
            .and_then(|s| s.split('&').next())
            .unwrap();
        let deflated = BASE64
            .decode(urlencoding::decode(encoded).unwrap().as_bytes())
            .unwrap();
        let mut xml = String::new();
        flate2::read::DeflateDecoder::new(deflated.as_slice())
            .read_to_string(&mut xml)
            .unwrap();
        assert!(xml.starts_with("<samlp:AuthnRequest"));
    }

    #[test]
    fn test_missing_sso_endpoint_yields_no_action() {
        let mut config = test_config("a");
        config.idp_metadata_xml = Some(IDP_METADATA.replace(
            r#"<md:SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://idp.example.com/sso/post"/>"#,
            "",
        ));
        let client = client(&config);
        let request = SamlRequest::from_url("GET", "https://a.example.com/connect.saml").unwrap();
        assert_eq!(client.redirection_action(&request).unwrap(), None);
    }

    #[test]
    fn test_sp_metadata() {
        let mut config = test_config("a");
        config.certificate_pem = Some(SP_CERT.to_string());
        let client = client(&config);

        let metadata = client.sp_metadata().unwrap();
        assert!(metadata.contains(r#"entityID="https://a.example.com/sp""#));
        assert!(metadata.contains(&format!(r#"Location="{}""#, CALLBACK)));
        assert!(metadata.contains("<ds:KeyName>saml2clientconfiguration</ds:KeyName>"));
        assert!(metadata.contains(r#"AuthnRequestsSigned="false""#));
        assert!(metadata.contains("<ds:X509Certificate>MII"));
    }

    #[test]
    fn test_credentials_extraction() {
        let client = client(&test_config("a"));
        let request = SamlRequest::from_url("POST", "https://a.example.com/callback.saml")
            .unwrap()
            .with_form_body("SAMLResponse=abc&RelayState=xyz")
            .unwrap();
        let credentials = client.credentials(&request).unwrap();
        assert_eq!(credentials.saml_response, "abc");
        assert_eq!(credentials.relay_state.as_deref(), Some("xyz"));

        let empty = SamlRequest::from_url("POST", "https://a.example.com/callback.saml").unwrap();
        assert!(client.credentials(&empty).is_none());
    }

    #[test]
    fn test_validate_success() {
        let client = client(&test_config("a"));
        let identity = client.validate(&Assertion::valid("_a1").encode()).unwrap();

        assert_eq!(identity.name_id, "jdoe@example.com");
        assert_eq!(identity.assertion_id, "_a1");
        assert_eq!(identity.session_index.as_deref(), Some("_session1"));
        assert_eq!(identity.attributes["groups"], vec!["staff", "editors"]);
        assert_eq!(identity.attributes["email"], vec!["jdoe@example.com"]);
    }

    #[test]
    fn test_validate_rejections() {
        let client = client(&test_config("a"));

        let mut failed = Assertion::valid("_a2");
        failed.status = "urn:oasis:names:tc:SAML:2.0:status:Responder";
        assert!(rejected(client.validate(&failed.encode())).contains("Responder"));

        let mut expired = Assertion::valid("_a3");
        expired.not_on_or_after = Utc::now() - Duration::hours(1);
        assert!(rejected(client.validate(&expired.encode())).contains("expired"));

        let mut foreign = Assertion::valid("_a4");
        foreign.audience = "https://b.example.com/sp".to_string();
        assert!(rejected(client.validate(&foreign.encode())).contains("AudienceRequirement"));

        let mut stale = Assertion::valid("_a5");
        stale.authn_instant = Utc::now() - Duration::days(2);
        assert_eq!(rejected(client.validate(&stale.encode())), "authentication is too old");
    }

    #[test]
    fn test_validate_replay() {
        let client = client(&test_config("a"));
        let credentials = Assertion::valid("_a6").encode();
        assert!(client.validate(&credentials).is_ok());
        assert_eq!(rejected(client.validate(&credentials)), "assertion replay detected");
    }

    #[test]
    fn test_unsigned_response_rejected() {
        let client = client(&test_config("a"));
        let unsigned = encoded(&Assertion::valid("_a7").xml());
        assert_eq!(rejected(client.validate(&unsigned)), "response is not signed");
    }

    #[test]
    fn test_tampered_response_rejected() {
        let client = client(&test_config("a"));
        let assertion = Assertion::valid("_a8");
        let signed = sign(&assertion.xml(), &assertion.id, IDP_KEY);
        let signed = sign(&signed, &assertion.response_id(), IDP_KEY);

        let tampered = signed.replace(
            ">jdoe@example.com</saml:NameID>",
            ">admin@example.com</saml:NameID>",
        );
        assert_ne!(tampered, signed);
        assert!(rejected(client.validate(&encoded(&tampered))).contains("must be signed"));

        // A signature element with made-up values.
        let mut config = test_config("a");
        config.require_signed_assertions = true;
        let strict = SamaelClient::new(&config, CALLBACK).unwrap();
        let forged = Assertion::valid("_a13");
        let garbage = with_template(&forged.xml(), &forged.id)
            .replace("<ds:DigestValue></ds:DigestValue>", "<ds:DigestValue>AAAA</ds:DigestValue>")
            .replace("<ds:SignatureValue></ds:SignatureValue>", "<ds:SignatureValue>AAAA</ds:SignatureValue>");
        assert!(rejected(strict.validate(&encoded(&garbage))).contains("must be signed"));
    }

    #[test]
    fn test_signature_from_unknown_key_rejected() {
        let client = client(&test_config("a"));
        let other_key = IdentityProvider::generate_new(KeyType::Rsa(Rsa::Rsa2048))
            .unwrap()
            .export_private_key_der()
            .unwrap();

        let assertion = Assertion::valid("_a9");
        let signed = sign(&assertion.xml(), &assertion.response_id(), &other_key);
        assert!(rejected(client.validate(&encoded(&signed))).contains("must be signed"));
    }

    #[test]
    fn test_assertion_signature_alone_is_enough() {
        let client = client(&test_config("a"));
        let assertion = Assertion::valid("_a10");
        let signed = sign(&assertion.xml(), &assertion.id, IDP_KEY);
        let identity = client.validate(&encoded(&signed)).unwrap();
        assert_eq!(identity.name_id, "jdoe@example.com");
    }

    #[test]
    fn test_validate_requires_signed_assertion_when_configured() {
        let mut config = test_config("a");
        config.require_signed_assertions = true;
        let client = client(&config);

        let assertion = Assertion::valid("_a11");
        let response_only = sign(&assertion.xml(), &assertion.response_id(), IDP_KEY);
        assert_eq!(
            rejected(client.validate(&encoded(&response_only))),
            "assertion is not signed"
        );

        assert!(client.validate(&Assertion::valid("_a12").encode()).is_ok());
    }

    #[test]
    fn test_metadata_without_signing_certificate() {
        let start = IDP_METADATA.find("<md:KeyDescriptor").unwrap();
        let end_tag = "</md:KeyDescriptor>";
        let end = IDP_METADATA.find(end_tag).unwrap() + end_tag.len();
        let mut config = test_config("a");
        config.idp_metadata_xml = Some(format!("{}{}", &IDP_METADATA[..start], &IDP_METADATA[end..]));

        assert!(matches!(
            SamaelClient::new(&config, CALLBACK),
            Err(ClientError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_parse_certificate() {
        let indented: String = SP_CERT.lines().map(|l| format!("    {}\n", l)).collect();
        let body = parse_certificate(&indented).unwrap();
        assert!(body.starts_with("MII"));

        let reversed = "-----END CERTIFICATE-----\nMIIB\n-----BEGIN CERTIFICATE-----\n";
        assert!(parse_certificate(reversed).is_err());
        assert!(parse_certificate(SP_KEY).is_err());
        assert!(parse_certificate("no markers at all").is_err());

        let mut config = test_config("a");
        config.certificate_pem = Some(reversed.to_string());
        assert!(matches!(
            SamaelClient::new(&config, CALLBACK),
            Err(ClientError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_garbage() {
        let client = client(&test_config("a"));
        let credentials = Credentials {
            saml_response: "!!not base64!!".to_string(),
            relay_state: None,
        };
        assert!(matches!(client.validate(&credentials), Err(ProtocolError::Internal(_))));
    }
}
