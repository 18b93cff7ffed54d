//! Locale values and preferred-language negotiation.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::fmt;
use tracing::debug;

use super::catalog::Site;

/// Language with an optional region, displayed as `fr` or `fr_FR`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locale {
    language: String,
    region: Option<String>,
}

impl Locale {
    pub fn new(language: &str) -> Self {
        Self {
            language: language.to_ascii_lowercase(),
            region: None,
        }
    }

    /// Parse a language tag such as `fr`, `fr-FR` or `fr_FR`.
    ///
    /// Only the language and region subtags are understood; anything longer,
    /// wildcards and malformed tags yield `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        let mut parts = tag.trim().split(['-', '_']);
        let language = parts.next()?;
        if !(2..=8).contains(&language.len()) || !language.chars().all(|c| c.is_ascii_alphabetic())
        {
            return None;
        }

        let region = match parts.next() {
            None => None,
            Some(r)
                if (r.len() == 2 && r.chars().all(|c| c.is_ascii_alphabetic()))
                    || (r.len() == 3 && r.chars().all(|c| c.is_ascii_digit())) =>
            {
                Some(r.to_ascii_uppercase())
            }
            Some(_) => return None,
        };

        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            language: language.to_ascii_lowercase(),
            region,
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{}_{}", self.language, region),
            None => f.write_str(&self.language),
        }
    }
}

/// Parse an `Accept-Language` header into locales ordered by preference.
///
/// Entries keep header order among equal quality values. Unparseable entries
/// and `q=0` are dropped.
pub fn parse_accept_language(header: &str) -> Vec<Locale> {
    let mut weighted: Vec<(f32, Locale)> = header
        .split(',')
        .filter_map(|entry| {
            let mut pieces = entry.split(';');
            let locale = Locale::parse(pieces.next()?)?;
            let quality = pieces
                .find_map(|p| p.trim().strip_prefix("q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            (quality > 0.0).then_some((quality, locale))
        })
        .collect();

    // Stable sort keeps header order for ties.
    weighted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    weighted.into_iter().map(|(_, locale)| locale).collect()
}

/// Picks the locale a user lands on after authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocaleNegotiator;

impl LocaleNegotiator {
    pub fn new() -> Self {
        Self
    }

    /// Negotiate the locale for `site`.
    ///
    /// `encoded_preference` is the base64 `Accept-Language` value captured at
    /// connect time. Its entries are tried in order, exact locale first and
    /// then the bare language. Request locales come next, matched exactly,
    /// then the site default. Never fails.
    pub fn negotiate(
        &self,
        site: &Site,
        encoded_preference: Option<&str>,
        request_locales: &[Locale],
    ) -> Locale {
        if let Some(preference) = encoded_preference.and_then(decode_preference) {
            for entry in preference.split(',') {
                let tag = entry.split(';').next().unwrap_or_default();
                if let Some(locale) = Self::match_tag(site, tag) {
                    debug!(site = %site.key, locale = %locale, "Locale negotiated from preferred language");
                    return locale;
                }
            }
        }

        if let Some(locale) = request_locales.iter().find(|l| site.supports(l)) {
            return locale.clone();
        }

        site.default_locale()
    }

    fn match_tag(site: &Site, tag: &str) -> Option<Locale> {
        if let Some(exact) = Locale::parse(tag) {
            if site.supports(&exact) {
                return Some(exact);
            }
        }
        let language = tag.trim().split(['-', '_']).next()?;
        let language = Locale::parse(language)?;
        site.supports(&language).then_some(language)
    }
}

/// Encode a raw `Accept-Language` header for cookie storage.
pub fn encode_preference(accept_language: &str) -> String {
    let cleaned: String = accept_language
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect();
    STANDARD.encode(cleaned)
}

fn decode_preference(encoded: &str) -> Option<String> {
    match STANDARD.decode(encoded.trim()) {
        Ok(bytes) => String::from_utf8(bytes).ok(),
        Err(e) => {
            debug!(error = %e, "Ignoring malformed preferred-language cookie");
            None
        }
    }
}
