//! Tool specifications — what the model is told it can call.
//!
//! The handler side lives in the agent crate; this is only the schema that
//! the adapters project into each provider's tool JSON. All declared
//! parameters are required and additional properties are forbidden, so the
//! per-parameter spec carries no "required" flag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The JSON-schema primitive types a tool parameter may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsType {
    String,
    Number,
    Boolean,
    Array,
}

/// A single tool parameter.
///
/// Serialises directly to the property schema both providers accept:
/// `{type, description, nullable?, enum?, items?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParam {
    #[serde(rename = "type")]
    pub kind: JsType,

    #[serde(rename = "description")]
    pub desc: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,

    /// Allowed values, for string parameters that are enumerations.
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,

    /// Item schema, when `kind` is `Array`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ToolParam>>,
}

impl ToolParam {
    pub fn new(kind: JsType, desc: impl Into<String>) -> Self {
        Self {
            kind,
            desc: desc.into(),
            nullable: None,
            choices: Vec::new(),
            items: None,
        }
    }

    pub fn string(desc: impl Into<String>) -> Self {
        Self::new(JsType::String, desc)
    }

    pub fn number(desc: impl Into<String>) -> Self {
        Self::new(JsType::Number, desc)
    }

    pub fn boolean(desc: impl Into<String>) -> Self {
        Self::new(JsType::Boolean, desc)
    }

    pub fn array(desc: impl Into<String>, items: ToolParam) -> Self {
        let mut p = Self::new(JsType::Array, desc);
        p.items = Some(Box::new(items));
        p
    }

    pub fn with_choices<S: Into<String>>(mut self, choices: impl IntoIterator<Item = S>) -> Self {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = Some(true);
        self
    }
}

/// A tool as described to the model: name, human description, and the
/// parameter map. Parameters are kept in a `BTreeMap` so the projected
/// schema is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub desc: String,
    pub params: BTreeMap<String, ToolParam>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: desc.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, param: ToolParam) -> Self {
        self.params.insert(name.into(), param);
        self
    }
}
