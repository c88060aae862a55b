//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Escrow engine settings, the `[escrow]` section of the server config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    /// Processor for escrows that do not name one
    pub default_processor: Option<String>,
    /// Upper bound on a single processor call
    pub processor_timeout_ms: u64,
    pub default_expiry_days: u32,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            default_processor: None,
            processor_timeout_ms: 30_000,
            default_expiry_days: 30,
        }
    }
}

impl EscrowConfig {
    pub fn processor_timeout(&self) -> Duration {
        Duration::from_millis(self.processor_timeout_ms)
    }

    pub fn with_processor_timeout(mut self, timeout: Duration) -> Self {
        self.processor_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
