//! Rule engine
//!
//! Decides, per entity type and property, which values are recorded, under
//! which names, in which form, and which permission tag guards them.

mod configuration;
mod property;
mod registry;

pub use configuration::{RuleConfiguration, RuleConfigurationBuilder};
pub use property::{FieldDecryptor, NameValue, PropertyRule, ValueTransform};
pub use registry::RuleRegistry;
