//! Per-property rules
//!
//! A rule refines the `(name, value)` pair recorded for one property:
//! drop it, rename it, recompute its value, or decrypt an opaque byte
//! sequence into readable text.

use std::fmt;
use std::sync::Arc;

use crate::error::{AuditError, AuditResult};
use crate::models::FieldValue;

/// Decrypts byte sequences stored in encrypted columns
pub trait FieldDecryptor: Send + Sync {
    /// Decrypt `cipher` into text.
    ///
    /// `includes_hash` is set when the stored blob carries a lookup hash
    /// ahead of the ciphertext.
    fn decrypt(&self, cipher: &[u8], includes_hash: bool) -> AuditResult<Option<String>>;
}

/// Function recomputing a recorded value from the raw one
pub type ValueTransform = Arc<dyn Fn(&FieldValue) -> FieldValue + Send + Sync>;

/// A property name together with the value to record under it
#[derive(Debug, Clone, PartialEq)]
pub struct NameValue {
    pub name: String,
    pub value: FieldValue,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A single rule attached to a property
#[derive(Clone)]
pub enum PropertyRule {
    /// Drop the property from the record
    Ignore,
    /// Record the property under a different name
    Rename(String),
    /// Record a value computed from the raw value
    Transform(ValueTransform),
    /// Decrypt a byte sequence into text
    Decrypt {
        decryptor: Arc<dyn FieldDecryptor>,
        includes_hash: bool,
    },
}

impl PropertyRule {
    /// Apply the rule to `current`.
    ///
    /// Returns `None` when the property must not be recorded.
    pub fn apply(
        &self,
        entity_type: &str,
        property: &str,
        current: NameValue,
    ) -> AuditResult<Option<NameValue>> {
        match self {
            PropertyRule::Ignore => Ok(None),
            PropertyRule::Rename(name) => Ok(Some(NameValue::new(name.clone(), current.value))),
            PropertyRule::Transform(transform) => {
                let value = transform(&current.value);
                Ok(Some(NameValue::new(current.name, value)))
            }
            PropertyRule::Decrypt {
                decryptor,
                includes_hash,
            } => {
                let value = match &current.value {
                    FieldValue::Null => FieldValue::Null,
                    FieldValue::Bytes(bytes) => decryptor.decrypt(bytes, *includes_hash)?.into(),
                    other => {
                        return Err(AuditError::TypeMismatch {
                            entity_type: entity_type.to_string(),
                            property: property.to_string(),
                            actual: other.type_name(),
                        })
                    }
                };
                Ok(Some(NameValue::new(current.name, value)))
            }
        }
    }
}

impl fmt::Debug for PropertyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyRule::Ignore => write!(f, "Ignore"),
            PropertyRule::Rename(name) => f.debug_tuple("Rename").field(name).finish(),
            PropertyRule::Transform(_) => write!(f, "Transform(..)"),
            PropertyRule::Decrypt { includes_hash, .. } => f
                .debug_struct("Decrypt")
                .field("includes_hash", includes_hash)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reverse;

    impl FieldDecryptor for Reverse {
        fn decrypt(&self, cipher: &[u8], _includes_hash: bool) -> AuditResult<Option<String>> {
            let mut bytes = cipher.to_vec();
            bytes.reverse();
            String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| AuditError::Decryption(e.to_string()))
        }
    }

    fn decrypt_rule() -> PropertyRule {
        PropertyRule::Decrypt {
            decryptor: Arc::new(Reverse),
            includes_hash: false,
        }
    }

    #[test]
    fn test_ignore_drops() {
        let result = PropertyRule::Ignore
            .apply("Invoice", "Note", NameValue::new("Note", FieldValue::Null))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_rename_keeps_value() {
        let result = PropertyRule::Rename("Comment".into())
            .apply("Invoice", "Note", NameValue::new("Note", "b".into()))
            .unwrap()
            .unwrap();
        assert_eq!(result, NameValue::new("Comment", "b".into()));
    }

    #[test]
    fn test_transform_recomputes_value() {
        let rule = PropertyRule::Transform(Arc::new(|v: &FieldValue| match v {
            FieldValue::Integer(n) => FieldValue::Integer(n * 2),
            other => other.clone(),
        }));
        let result = rule
            .apply("Invoice", "Total", NameValue::new("Total", 50.into()))
            .unwrap()
            .unwrap();
        assert_eq!(result.value, FieldValue::Integer(100));
    }

    #[test]
    fn test_decrypt_bytes() {
        let result = decrypt_rule()
            .apply("Patient", "Ssn", NameValue::new("Ssn", b"cba".to_vec().into()))
            .unwrap()
            .unwrap();
        assert_eq!(result.value, FieldValue::Text("abc".into()));
    }

    #[test]
    fn test_decrypt_null_records_null() {
        let result = decrypt_rule()
            .apply("Patient", "Ssn", NameValue::new("Ssn", FieldValue::Null))
            .unwrap()
            .unwrap();
        assert!(result.value.is_null());
    }

    #[test]
    fn test_decrypt_rejects_non_bytes() {
        let err = decrypt_rule()
            .apply("Patient", "Ssn", NameValue::new("Ssn", "plain".into()))
            .unwrap_err();
        match err {
            AuditError::TypeMismatch {
                entity_type,
                property,
                actual,
            } => {
                assert_eq!(entity_type, "Patient");
                assert_eq!(property, "Ssn");
                assert_eq!(actual, "text");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
