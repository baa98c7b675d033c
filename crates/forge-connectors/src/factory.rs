//! Typed connector factory.
//!
//! Builders are registered per `type` tag by the embedding application.
//! Unknown tags and failed builds become disabled instances at
//! config-load time, never runtime errors.

use std::collections::HashMap;
use std::sync::Arc;

use forge_core::ConnectorConfig;

use crate::types::{Connector, PlatformError};

pub type ConnectorBuilder =
    Box<dyn Fn(&str, &ConnectorConfig) -> Result<Arc<dyn Connector>, PlatformError> + Send + Sync>;

/// Result of constructing one connector instance from config.
pub enum BuildOutcome {
    Ready(Arc<dyn Connector>),
    Disabled { reason: String },
}

#[derive(Default)]
pub struct ConnectorFactory {
    builders: HashMap<String, ConnectorBuilder>,
}

impl ConnectorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a builder for a `type` tag, replacing any previous one.
    pub fn register<F>(&mut self, type_tag: &str, builder: F)
    where
        F: Fn(&str, &ConnectorConfig) -> Result<Arc<dyn Connector>, PlatformError>
            + Send
            + Sync
            + 'static,
    {
        self.builders.insert(type_tag.to_string(), Box::new(builder));
    }

    pub fn known_types(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }

    pub fn build(&self, connector_id: &str, config: &ConnectorConfig) -> BuildOutcome {
        if !config.enabled {
            return BuildOutcome::Disabled {
                reason: "disabled in config".to_string(),
            };
        }
        let Some(builder) = self.builders.get(&config.kind) else {
            return BuildOutcome::Disabled {
                reason: format!("unknown connector type {:?}", config.kind),
            };
        };
        match builder(connector_id, config) {
            Ok(connector) => BuildOutcome::Ready(connector),
            Err(err) => BuildOutcome::Disabled {
                reason: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;

    fn config(kind: &str, enabled: bool) -> ConnectorConfig {
        ConnectorConfig {
            kind: kind.to_string(),
            enabled,
            ..ConnectorConfig::default()
        }
    }

    #[test]
    fn unknown_type_becomes_disabled() {
        let factory = ConnectorFactory::new();
        match factory.build("tg", &config("telegram", true)) {
            BuildOutcome::Disabled { reason } => assert!(reason.contains("telegram")),
            BuildOutcome::Ready(_) => panic!("expected disabled"),
        }
    }

    #[test]
    fn disabled_config_short_circuits() {
        let mut factory = ConnectorFactory::new();
        factory.register("mock", |id, _cfg| Ok(MockConnector::shared(id)));
        match factory.build("m1", &config("mock", false)) {
            BuildOutcome::Disabled { reason } => assert!(reason.contains("disabled")),
            BuildOutcome::Ready(_) => panic!("expected disabled"),
        }
    }

    #[test]
    fn registered_builder_produces_connector() {
        let mut factory = ConnectorFactory::new();
        factory.register("mock", |id, _cfg| Ok(MockConnector::shared(id)));
        match factory.build("m1", &config("mock", true)) {
            BuildOutcome::Ready(connector) => assert_eq!(connector.id(), "m1"),
            BuildOutcome::Disabled { reason } => panic!("unexpected: {reason}"),
        }
    }

    #[test]
    fn builder_error_becomes_disabled() {
        let mut factory = ConnectorFactory::new();
        factory.register("mock", |_id, _cfg| {
            Err(PlatformError::Unavailable("sdk not installed".to_string()))
        });
        match factory.build("m1", &config("mock", true)) {
            BuildOutcome::Disabled { reason } => assert!(reason.contains("sdk not installed")),
            BuildOutcome::Ready(_) => panic!("expected disabled"),
        }
    }
}
