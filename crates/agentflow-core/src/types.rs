//! Core value and classification types for the runtime.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a unique, time-ordered entity id.
pub fn generate_id() -> Uuid {
    Uuid::now_v7()
}

/// Declared (or inferred) type of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TypeHint {
    #[default]
    Any,
    Boolean,
    Long,
    Double,
    String,
    List,
    Map,
}

impl TypeHint {
    /// Infer a type hint from a JSON value.
    pub fn infer(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(_) => Self::Boolean,
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Self::Long,
            serde_json::Value::Number(_) => Self::Double,
            serde_json::Value::String(_) => Self::String,
            serde_json::Value::Array(_) => Self::List,
            serde_json::Value::Object(_) => Self::Map,
            serde_json::Value::Null => Self::Any,
        }
    }

    /// Check whether a JSON value is compatible with this hint.
    ///
    /// `Any` accepts everything; `null` is treated as absent and accepted
    /// by every hint. A `Long` hint accepts only integral numbers while
    /// `Double` accepts any number.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            Self::Any => true,
            Self::Boolean => value.is_boolean(),
            Self::Long => value.as_i64().is_some() || value.as_u64().is_some(),
            Self::Double => value.is_number(),
            Self::String => value.is_string(),
            Self::List => value.is_array(),
            Self::Map => value.is_object(),
        }
    }
}

impl std::fmt::Display for TypeHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Any => "Any",
            Self::Boolean => "Boolean",
            Self::Long => "Long",
            Self::Double => "Double",
            Self::String => "String",
            Self::List => "List",
            Self::Map => "Map",
        };
        write!(f, "{s}")
    }
}

/// A computed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub name: String,
    pub value: serde_json::Value,
    pub type_hint: TypeHint,
}

impl AttributeValue {
    /// Create an attribute, inferring the type hint from the value.
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        let type_hint = TypeHint::infer(&value);
        Self {
            name: name.into(),
            value,
            type_hint,
        }
    }

    /// Create an attribute with an explicit type hint.
    pub fn with_hint(name: impl Into<String>, value: serde_json::Value, hint: TypeHint) -> Self {
        let hint = if hint == TypeHint::Any {
            TypeHint::infer(&value)
        } else {
            hint
        };
        Self {
            name: name.into(),
            value,
            type_hint: hint,
        }
    }
}

/// Computed attributes for a facet instance: input params and return values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetAttributes {
    #[serde(default)]
    pub params: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub returns: BTreeMap<String, AttributeValue>,
}

impl FacetAttributes {
    pub fn get_param(&self, name: &str) -> Option<&serde_json::Value> {
        self.params.get(name).map(|a| &a.value)
    }

    pub fn get_return(&self, name: &str) -> Option<&serde_json::Value> {
        self.returns.get(name).map(|a| &a.value)
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: serde_json::Value) {
        let name = name.into();
        self.params
            .insert(name.clone(), AttributeValue::new(name, value));
    }

    pub fn set_param_hinted(
        &mut self,
        name: impl Into<String>,
        value: serde_json::Value,
        hint: TypeHint,
    ) {
        let name = name.into();
        self.params
            .insert(name.clone(), AttributeValue::with_hint(name, value, hint));
    }

    pub fn set_return(&mut self, name: impl Into<String>, value: serde_json::Value) {
        let name = name.into();
        self.returns
            .insert(name.clone(), AttributeValue::new(name, value));
    }

    /// Flatten the params into a plain JSON object.
    pub fn params_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.params
            .iter()
            .map(|(k, a)| (k.clone(), a.value.clone()))
            .collect()
    }

    /// Flatten the returns into a plain JSON object.
    pub fn returns_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.returns
            .iter()
            .map(|(k, a)| (k.clone(), a.value.clone()))
            .collect()
    }

    /// Merge another set of attributes into this one.
    ///
    /// Used for yield capture: params fill gaps, returns overwrite.
    pub fn merge(&mut self, other: &FacetAttributes) {
        for (name, attr) in &other.params {
            self.params
                .entry(name.clone())
                .or_insert_with(|| attr.clone());
        }
        for (name, attr) in &other.returns {
            self.returns.insert(name.clone(), attr.clone());
        }
    }
}

/// Classification of a step, determining which transition table drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    VariableAssignment,
    YieldAssignment,
    Workflow,
    SchemaInstantiation,
    AndThen,
    AndMap,
    AndMatch,
    Block,
}

impl ObjectType {
    /// Block types follow the block transition table.
    pub fn is_block(&self) -> bool {
        matches!(
            self,
            Self::AndThen | Self::AndMap | Self::AndMatch | Self::Block
        )
    }

    pub fn is_statement(&self) -> bool {
        matches!(self, Self::VariableAssignment | Self::YieldAssignment)
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Version metadata recorded on persisted artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub workflow_version: String,
    pub step_schema_version: String,
    pub runtime_version: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            workflow_version: "1.0".to_string(),
            step_schema_version: "1.0".to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_hint_inference() {
        assert_eq!(TypeHint::infer(&json!(true)), TypeHint::Boolean);
        assert_eq!(TypeHint::infer(&json!(42)), TypeHint::Long);
        assert_eq!(TypeHint::infer(&json!(1.5)), TypeHint::Double);
        assert_eq!(TypeHint::infer(&json!("hi")), TypeHint::String);
        assert_eq!(TypeHint::infer(&json!([1, 2])), TypeHint::List);
        assert_eq!(TypeHint::infer(&json!({"k": 1})), TypeHint::Map);
        assert_eq!(TypeHint::infer(&json!(null)), TypeHint::Any);
    }

    #[test]
    fn test_type_hint_accepts() {
        assert!(TypeHint::Long.accepts(&json!(42)));
        assert!(!TypeHint::Long.accepts(&json!(1.5)));
        assert!(TypeHint::Double.accepts(&json!(42)));
        assert!(TypeHint::Any.accepts(&json!("anything")));
        // null is treated as absent
        assert!(TypeHint::String.accepts(&json!(null)));
        assert!(!TypeHint::String.accepts(&json!(7)));
    }

    #[test]
    fn test_attribute_value_infers_hint() {
        let attr = AttributeValue::new("count", json!(3));
        assert_eq!(attr.type_hint, TypeHint::Long);

        let attr = AttributeValue::with_hint("count", json!(3), TypeHint::Long);
        assert_eq!(attr.type_hint, TypeHint::Long);
    }

    #[test]
    fn test_facet_attributes_merge() {
        let mut target = FacetAttributes::default();
        target.set_param("a", json!(1));

        let mut other = FacetAttributes::default();
        other.set_param("a", json!(99));
        other.set_param("b", json!(2));
        other.set_return("out", json!("done"));

        target.merge(&other);

        // Existing params win, new params fill in, returns overwrite
        assert_eq!(target.get_param("a"), Some(&json!(1)));
        assert_eq!(target.get_param("b"), Some(&json!(2)));
        assert_eq!(target.get_return("out"), Some(&json!("done")));
    }

    #[test]
    fn test_object_type_classification() {
        assert!(ObjectType::AndThen.is_block());
        assert!(ObjectType::AndMap.is_block());
        assert!(!ObjectType::VariableAssignment.is_block());
        assert!(ObjectType::VariableAssignment.is_statement());
        assert!(ObjectType::YieldAssignment.is_statement());
        assert!(!ObjectType::Workflow.is_statement());
    }

    #[test]
    fn test_params_map_flattening() {
        let mut attrs = FacetAttributes::default();
        attrs.set_param("value", json!(41));
        let map = attrs.params_map();
        assert_eq!(map.get("value"), Some(&json!(41)));
    }
}
