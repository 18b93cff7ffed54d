//! Sites (tenants), request-to-site resolution and locale negotiation.

mod catalog;
mod locale;
mod resolver;

pub use catalog::{Site, SiteCatalog, TenantId};
pub use locale::{encode_preference, parse_accept_language, Locale, LocaleNegotiator};
pub use resolver::{SiteKeyResolver, SITE_PARAM};
