use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::error::{Error, Result};
use crate::core::types::{Document, FieldValue};

/// Tagged field type, inferred once per field and fixed thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    Object,
}

impl FieldType {
    pub fn infer(value: &FieldValue) -> FieldType {
        match value {
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::Date(_) => FieldType::Date,
            FieldValue::Object(_) => FieldType::Object,
        }
    }

    /// Whether a value of `incoming` type is acceptable for a field mapped
    /// as `self`. Integers widen to float; everything else must match.
    fn accepts(self, incoming: FieldType) -> bool {
        self == incoming || (self == FieldType::Float && incoming == FieldType::Integer)
    }
}

/// Per-index schema. `dynamic` mappings infer unseen fields on first
/// observation; explicit mappings reject unknown fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub fields: BTreeMap<String, FieldType>,
    pub dynamic: bool,
}

impl Default for Mapping {
    fn default() -> Self {
        Mapping {
            fields: BTreeMap::new(),
            dynamic: true,
        }
    }
}

impl Mapping {
    pub fn dynamic() -> Self {
        Mapping::default()
    }

    pub fn explicit() -> Self {
        Mapping {
            fields: BTreeMap::new(),
            dynamic: false,
        }
    }

    pub fn with_field(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.insert(name.to_string(), ty);
        self
    }

    /// Validate a document against the mapping, inferring types for fields
    /// never seen before. Returns true when inference added fields, so the
    /// caller knows to persist the updated mapping before the write
    /// proceeds. Inference happens once; a later value of a conflicting
    /// type is rejected, it never re-negotiates the field.
    pub fn observe(&mut self, doc: &Document) -> Result<bool> {
        let mut changed = false;
        for (name, value) in &doc.fields {
            let incoming = FieldType::infer(value);
            match self.fields.get(name) {
                Some(mapped) => {
                    if !mapped.accepts(incoming) {
                        return Err(Error::validation(format!(
                            "field {:?} is mapped as {:?}, got {:?} in document {}",
                            name, mapped, incoming, doc.id
                        )));
                    }
                }
                None => {
                    if !self.dynamic {
                        return Err(Error::validation(format!(
                            "unknown field {:?} in document {} (mapping is not dynamic)",
                            name, doc.id
                        )));
                    }
                    self.fields.insert(name.clone(), incoming);
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_mapping_infers_once() {
        let mut mapping = Mapping::dynamic();
        let doc = Document::new("1")
            .with_field("title", FieldValue::Text("dune".into()))
            .with_field("year", FieldValue::Integer(1965));

        assert!(mapping.observe(&doc).unwrap());
        assert_eq!(mapping.fields["title"], FieldType::Text);
        assert_eq!(mapping.fields["year"], FieldType::Integer);

        // Same shape again: no change to persist.
        assert!(!mapping.observe(&doc).unwrap());
    }

    #[test]
    fn conflicting_type_is_rejected() {
        let mut mapping = Mapping::dynamic();
        mapping
            .observe(&Document::new("1").with_field("year", FieldValue::Integer(1965)))
            .unwrap();

        let err = mapping
            .observe(&Document::new("2").with_field("year", FieldValue::Text("later".into())))
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Validation);
    }

    #[test]
    fn integers_widen_to_float() {
        let mut mapping = Mapping::dynamic().with_field("price", FieldType::Float);
        assert!(!mapping
            .observe(&Document::new("1").with_field("price", FieldValue::Integer(3)))
            .unwrap());
    }

    #[test]
    fn explicit_mapping_rejects_unknown_fields() {
        let mut mapping = Mapping::explicit().with_field("title", FieldType::Text);
        let err = mapping
            .observe(&Document::new("1").with_field("body", FieldValue::Text("x".into())))
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Validation);
    }
}
