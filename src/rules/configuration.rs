//! Rule configuration for one audited entity type
//!
//! A configuration carries the permission tag required to read the entity
//! type's audit records plus the property rules, built fluently:
//!
//! ```rust,ignore
//! let invoice = RuleConfiguration::builder("billing::Invoice", Permission::Finance)
//!     .ignore("Note")
//!     .rename("CustomerRef", "Customer")
//!     .build()?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{AuditError, AuditResult};
use crate::models::FieldValue;

use super::property::{FieldDecryptor, NameValue, PropertyRule};

/// Rules and permission tag for one entity type
#[derive(Debug, Clone)]
pub struct RuleConfiguration<P> {
    entity_type: String,
    display_name: Option<String>,
    permission: P,
    rules: HashMap<String, Vec<PropertyRule>>,
}

impl<P> RuleConfiguration<P> {
    /// Start building the configuration for `entity_type`
    pub fn builder(entity_type: impl Into<String>, permission: P) -> RuleConfigurationBuilder<P> {
        RuleConfigurationBuilder {
            config: RuleConfiguration {
                entity_type: entity_type.into(),
                display_name: None,
                permission,
                rules: HashMap::new(),
            },
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Permission tag required to read records of this entity type
    pub fn permission(&self) -> &P {
        &self.permission
    }

    /// Display name, falling back to the bare type name
    pub fn entity_name(&self) -> &str {
        match &self.display_name {
            Some(name) => name,
            None => bare_type_name(&self.entity_type),
        }
    }

    pub fn rules_for(&self, property: &str) -> &[PropertyRule] {
        self.rules.get(property).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Record `raw` for `property` into `accumulator`.
    ///
    /// Rules registered for the property run in registration order, each
    /// refining the output of the previous one. An ignore rule ends the
    /// chain and nothing is written. Without rules the raw value is
    /// recorded under the property's own name.
    pub fn execute_rules(
        &self,
        property: &str,
        raw: FieldValue,
        accumulator: &mut BTreeMap<String, FieldValue>,
    ) -> AuditResult<()> {
        let mut current = NameValue::new(property, raw);

        for rule in self.rules_for(property) {
            match rule.apply(&self.entity_type, property, current)? {
                Some(next) => current = next,
                None => return Ok(()),
            }
        }

        accumulator.insert(current.name, current.value);
        Ok(())
    }
}

/// Fluent builder for [`RuleConfiguration`]
pub struct RuleConfigurationBuilder<P> {
    config: RuleConfiguration<P>,
}

impl<P> RuleConfigurationBuilder<P> {
    /// Override the entity name carried by records
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.config.display_name = Some(name.into());
        self
    }

    /// Never record `property`
    pub fn ignore(self, property: impl Into<String>) -> Self {
        self.rule(property, PropertyRule::Ignore)
    }

    /// Record `property` under `name`
    pub fn rename(self, property: impl Into<String>, name: impl Into<String>) -> Self {
        self.rule(property, PropertyRule::Rename(name.into()))
    }

    /// Record a value computed from the raw value of `property`
    pub fn transform<F>(self, property: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&FieldValue) -> FieldValue + Send + Sync + 'static,
    {
        self.rule(property, PropertyRule::Transform(Arc::new(transform)))
    }

    /// Decrypt the byte sequence stored in `property`
    pub fn decrypt(
        self,
        property: impl Into<String>,
        decryptor: Arc<dyn FieldDecryptor>,
        includes_hash: bool,
    ) -> Self {
        self.rule(
            property,
            PropertyRule::Decrypt {
                decryptor,
                includes_hash,
            },
        )
    }

    /// Attach an arbitrary rule to `property`
    pub fn rule(mut self, property: impl Into<String>, rule: PropertyRule) -> Self {
        self.config
            .rules
            .entry(property.into())
            .or_default()
            .push(rule);
        self
    }

    pub fn build(self) -> AuditResult<RuleConfiguration<P>> {
        if self.config.entity_type.trim().is_empty() {
            return Err(AuditError::Config(
                "Entity type tag cannot be empty".into(),
            ));
        }

        for (property, rules) in &self.config.rules {
            for rule in rules {
                if let PropertyRule::Rename(name) = rule {
                    if name.trim().is_empty() {
                        return Err(AuditError::Config(format!(
                            "Rename rule for {}.{} has an empty name",
                            self.config.entity_type, property
                        )));
                    }
                }
            }
        }

        Ok(self.config)
    }
}

/// Last `::` segment of a type tag
fn bare_type_name(entity_type: &str) -> &str {
    entity_type.rsplit("::").next().unwrap_or(entity_type)
}
