//! Loading and updating queue configuration in the store.

use jobq_core::{ConfigKey, QueueConfig, QueueResult};
use tracing::{info, warn};

use crate::jobs::JobStore;

/// Read the config table into a [`QueueConfig`].
///
/// Never fails: an unreadable table yields the defaults.
pub async fn load_config(store: &dyn JobStore) -> QueueConfig {
    match store.config_entries().await {
        Ok(entries) => QueueConfig::from_entries(entries),
        Err(err) => {
            warn!(error = %err, "failed to read config table; using defaults");
            QueueConfig::default()
        }
    }
}

/// Validate and persist one config value. Takes effect at the next pool start.
pub async fn update_config(store: &dyn JobStore, key: &str, value: &str) -> QueueResult<()> {
    let key: ConfigKey = key.parse()?;
    let value = key.parse_value(value)?.to_string();
    store.set_config(key, &value).await?;
    info!(key = %key, value = %value, "config updated");
    Ok(())
}
