//! Engine configuration injected at construction time.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::Keyspace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} must not contain '.' (got {value:?})")]
    Separator { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Master switch; a disabled engine reports itself inert and refuses writes.
    #[serde(default = "EngineConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "EngineConfig::default_namespace")]
    pub namespace: String,
    pub user_id: String,
}

impl EngineConfig {
    const fn default_enabled() -> bool {
        true
    }

    fn default_namespace() -> String {
        "daily_mission".to_string()
    }

    #[must_use]
    pub fn for_user(user_id: &str) -> Self {
        Self {
            enabled: Self::default_enabled(),
            namespace: Self::default_namespace(),
            user_id: user_id.to_string(),
        }
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check that keys built from this config are well formed.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for empty or dotted namespace/user ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("namespace", &self.namespace), ("user_id", &self.user_id)] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty { field });
            }
            if value.contains('.') {
                return Err(ConfigError::Separator {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn keyspace(&self) -> Keyspace {
        Keyspace::for_user(&self.namespace, &self.user_id)
    }
}
