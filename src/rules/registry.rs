//! Registry of rule configurations keyed by entity-type tag
//!
//! Built once at startup. Lookup is explicit: an entity type is audited
//! exactly when a configuration for its tag is registered.

use std::collections::HashMap;

use crate::error::{AuditError, AuditResult};

use super::configuration::RuleConfiguration;

/// Maps entity-type tags to their rule configuration
#[derive(Debug, Clone)]
pub struct RuleRegistry<P> {
    configurations: HashMap<String, RuleConfiguration<P>>,
}

impl<P> Default for RuleRegistry<P> {
    fn default() -> Self {
        Self {
            configurations: HashMap::new(),
        }
    }
}

impl<P> RuleRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a configuration; each entity type may be registered once
    pub fn register(&mut self, configuration: RuleConfiguration<P>) -> AuditResult<()> {
        let entity_type = configuration.entity_type().to_string();
        if self.configurations.contains_key(&entity_type) {
            return Err(AuditError::Config(format!(
                "Rule configuration for '{}' is already registered",
                entity_type
            )));
        }
        self.configurations.insert(entity_type, configuration);
        Ok(())
    }

    /// Chainable form of [`register`](Self::register)
    pub fn with(mut self, configuration: RuleConfiguration<P>) -> AuditResult<Self> {
        self.register(configuration)?;
        Ok(self)
    }

    /// Resolve the configuration for `entity_type`.
    ///
    /// A missing configuration is a setup defect and fails.
    pub fn resolve(&self, entity_type: &str) -> AuditResult<&RuleConfiguration<P>> {
        self.configurations
            .get(entity_type)
            .ok_or_else(|| AuditError::missing_rules(entity_type))
    }

    /// Whether `entity_type` participates in auditing
    pub fn contains(&self, entity_type: &str) -> bool {
        self.configurations.contains_key(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.configurations.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(entity_type: &str) -> RuleConfiguration<u8> {
        RuleConfiguration::builder(entity_type, 1).build().unwrap()
    }

    #[test]
    fn test_resolve_registered() {
        let registry = RuleRegistry::new().with(config("Invoice")).unwrap();
        assert!(registry.contains("Invoice"));
        assert_eq!(*registry.resolve("Invoice").unwrap().permission(), 1);
    }

    #[test]
    fn test_resolve_missing_fails() {
        let registry = RuleRegistry::<u8>::new();
        let err = registry.resolve("Invoice").unwrap_err();
        assert!(matches!(err, AuditError::MissingRules { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = RuleRegistry::new();
        registry.register(config("Invoice")).unwrap();
        assert!(registry.register(config("Invoice")).is_err());
        assert_eq!(registry.len(), 1);
    }
}
