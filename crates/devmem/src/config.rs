//! Process-wide configuration.
//!
//! The configuration is resolved once, either from the environment on first
//! use or from an explicit [`MemoryConfig::install`] call made before any
//! handle is created. It never changes afterwards.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};

/// Environment variable enabling the native-call reachability fence.
pub const REACHABILITY_NATIVE_ENV: &str = "DEVMEM_REACHABILITY_NATIVE";

static GLOBAL: OnceLock<MemoryConfig> = OnceLock::new();

/// Process-wide settings for the handle protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Route reachability fences through an opaque native call when the
    /// intrinsic fence is unavailable.
    pub reachability_native_call: bool,
}

impl MemoryConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the native-call fence.
    #[must_use]
    pub fn with_reachability_native_call(mut self, enabled: bool) -> Self {
        self.reachability_native_call = enabled;
        self
    }

    /// Read the configuration from the environment.
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let reachability_native_call = std::env::var(REACHABILITY_NATIVE_ENV)
            .ok()
            .and_then(|value| parse_flag(&value))
            .unwrap_or(false);

        Self {
            reachability_native_call,
        }
    }

    /// Get the process configuration, reading the environment on first use.
    pub fn global() -> &'static MemoryConfig {
        GLOBAL.get_or_init(|| {
            let config = Self::from_env();
            tracing::debug!("Resolved process configuration from environment: {:?}", config);
            config
        })
    }

    /// Fix the process configuration.
    ///
    /// Must be called before the first handle is created. Installing the
    /// configuration that is already in effect is a no-op.
    pub fn install(self) -> MemoryResult<()> {
        let installed = GLOBAL.get_or_init(|| self);
        if *installed == self {
            Ok(())
        } else {
            Err(MemoryError::InvalidConfig(format!(
                "process configuration already fixed as {:?}",
                installed
            )))
        }
    }
}

/// Parse a boolean switch value.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
