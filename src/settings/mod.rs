//! Persistent per-site SAML settings and change propagation.

mod listener;
mod store;

pub use listener::{spawn_settings_listener, SettingsChangeListener};
pub use store::{SettingsChanged, SettingsStore};
