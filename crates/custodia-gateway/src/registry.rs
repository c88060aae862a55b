//! Processor registry - resolves escrow-capable gateways by name

use std::collections::BTreeMap;
use std::sync::Arc;

use custodia_types::{EscrowError, Result};
use tracing::info;

use crate::EscrowGateway;

/// The set of processors the engine may route escrows to
///
/// Only gateways that report escrow capability are accepted, so anything
/// resolved from here can hold funds.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    gateways: BTreeMap<String, Arc<dyn EscrowGateway>>,
    default: Option<String>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gateway under its own name
    pub fn register(&mut self, gateway: Arc<dyn EscrowGateway>) -> Result<()> {
        let name = gateway.name().to_string();

        if !gateway.supports_escrow() {
            return Err(EscrowError::validation(format!(
                "processor '{}' does not support escrow",
                name
            )));
        }
        if self.gateways.contains_key(&name) {
            return Err(EscrowError::validation(format!(
                "processor '{}' is already registered",
                name
            )));
        }

        info!(processor = %name, "Registered escrow processor");
        self.gateways.insert(name, gateway);
        Ok(())
    }

    /// Builder-style registration
    pub fn with(mut self, gateway: Arc<dyn EscrowGateway>) -> Result<Self> {
        self.register(gateway)?;
        Ok(self)
    }

    /// Processor used when a caller does not name one
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.gateways.contains_key(name) {
            return Err(EscrowError::validation(format!(
                "default processor '{}' is not registered",
                name
            )));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    /// Resolve a gateway for a new escrow
    ///
    /// Without a name this falls back to the configured default, or to the
    /// only registered processor.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn EscrowGateway>> {
        let name = match name {
            Some(name) => name.to_string(),
            None => match (&self.default, self.gateways.len()) {
                (Some(default), _) => default.clone(),
                (None, 1) => self.gateways.keys().next().cloned().unwrap_or_default(),
                (None, 0) => {
                    return Err(EscrowError::validation("no escrow processor is registered"))
                }
                (None, _) => {
                    return Err(EscrowError::validation(
                        "several processors are registered, a processor name is required",
                    ))
                }
            },
        };

        self.get(&name)
    }

    /// Gateway an existing escrow was created with
    pub fn get(&self, name: &str) -> Result<Arc<dyn EscrowGateway>> {
        self.gateways.get(name).cloned().ok_or_else(|| {
            EscrowError::validation(format!("unknown escrow processor '{}'", name))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.gateways.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}
