//! Background task keeping cached clients in step with settings changes.

use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use super::store::{SettingsChanged, SettingsStore};
use crate::saml::ClientRegistry;

/// Reloads settings and invalidates clients of the sites named in a change.
pub struct SettingsChangeListener {
    store: Arc<SettingsStore>,
    registry: Arc<ClientRegistry>,
}

impl SettingsChangeListener {
    pub fn new(store: Arc<SettingsStore>, registry: Arc<ClientRegistry>) -> Self {
        Self { store, registry }
    }

    /// Apply one change notification. Returns the number of cached clients dropped.
    ///
    /// A failing reload is logged and does not stop the remaining sites; the
    /// client is invalidated regardless.
    pub fn handle(&self, event: &SettingsChanged) -> usize {
        let mut invalidated = 0;
        for tenant in &event.tenants {
            if let Err(e) = self.store.reload(tenant) {
                warn!(site = %tenant, error = %e, "Failed to reload SAML settings");
            }
            if self.registry.invalidate(tenant) {
                invalidated += 1;
            }
        }

        debug!(
            sites = event.tenants.len(),
            invalidated = invalidated,
            "Processed SAML settings change"
        );
        invalidated
    }
}

/// Spawn a task applying settings changes until the channel closes.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_settings_listener(
    listener: SettingsChangeListener,
    mut events: broadcast::Receiver<SettingsChanged>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    listener.handle(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Which sites changed is lost; start over from scratch.
                    warn!(skipped = skipped, "Settings listener lagged, resetting client registry");
                    listener.registry.reset();
                }
                Err(RecvError::Closed) => {
                    info!("Settings channel closed, stopping listener");
                    break;
                }
            }
        }
    })
}
