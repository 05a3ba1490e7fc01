//! Tool input schemas.
//!
//! Tools declare their inputs as a mapping `name → field`, where each field
//! carries a primitive kind, a required flag, a default, and a description.
//! The engine validates and coerces the language model's chosen inputs
//! against the schema before the tool ever runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The kind of a single input field. `ListOf` nests one level of element
/// kind, which covers every built-in tool; deeper nesting is not supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "of")]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    ListOf(Box<FieldKind>),
}

impl FieldKind {
    pub fn list_of(inner: FieldKind) -> Self {
        FieldKind::ListOf(Box::new(inner))
    }

    /// Human-readable name used in prompts and error messages.
    pub fn describe(&self) -> String {
        match self {
            FieldKind::String => "string".into(),
            FieldKind::Integer => "integer".into(),
            FieldKind::Float => "float".into(),
            FieldKind::Boolean => "boolean".into(),
            FieldKind::ListOf(inner) => format!("list of {}", inner.describe()),
        }
    }

    /// Coerce `value` to this kind, accepting the loose shapes language
    /// models produce (numbers as strings, single values for lists).
    fn coerce(&self, value: Value) -> Result<Value> {
        match (self, value) {
            (FieldKind::String, Value::String(s)) => Ok(Value::String(s)),
            (FieldKind::String, v) => Ok(Value::String(stringify(&v))),
            (FieldKind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Ok(Value::Number(n))
            }
            (FieldKind::Integer, Value::Number(n)) => {
                // A float-valued number for an integer field: truncate.
                let f = n.as_f64().unwrap_or(0.0);
                Ok(Value::from(f as i64))
            }
            (FieldKind::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| coerce_err("integer", &s)),
            (FieldKind::Float, Value::Number(n)) => Ok(Value::Number(n)),
            (FieldKind::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                .ok_or_else(|| coerce_err("float", &s)),
            (FieldKind::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
            (FieldKind::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" => Ok(Value::Bool(true)),
                "false" | "no" => Ok(Value::Bool(false)),
                _ => Err(coerce_err("boolean", &s)),
            },
            (FieldKind::ListOf(inner), Value::Array(items)) => {
                let coerced: Result<Vec<Value>> =
                    items.into_iter().map(|v| inner.coerce(v)).collect();
                Ok(Value::Array(coerced?))
            }
            // A bare value where a list was expected: wrap it.
            (FieldKind::ListOf(inner), v) => Ok(Value::Array(vec![inner.coerce(v)?])),
            (kind, v) => Err(coerce_err(&kind.describe(), &stringify(&v))),
        }
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_err(expected: &str, got: &str) -> Error {
    Error::Config(format!("expected {expected}, got `{got}`"))
}

/// One declared input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    pub description: String,
}

impl InputField {
    pub fn new(kind: FieldKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            description: description.into(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// A tool's full input schema, ordered by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    pub fields: BTreeMap<String, InputField>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, field: InputField) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validate and coerce a raw input object against this schema.
    ///
    /// Unknown keys are dropped, missing optional fields take their default
    /// (or are omitted), and a missing required field is an error.
    pub fn resolve(&self, raw: &Value) -> Result<Value> {
        let raw = raw.as_object().cloned().unwrap_or_default();
        let mut out = serde_json::Map::new();

        for (name, field) in &self.fields {
            match raw.get(name) {
                Some(Value::Null) | None => {
                    if let Some(default) = &field.default {
                        out.insert(name.clone(), default.clone());
                    } else if field.required {
                        return Err(Error::Config(format!(
                            "missing required input `{name}`"
                        )));
                    }
                }
                Some(v) => {
                    let coerced = field.kind.coerce(v.clone()).map_err(|e| {
                        Error::Config(format!("input `{name}`: {e}"))
                    })?;
                    out.insert(name.clone(), coerced);
                }
            }
        }

        Ok(Value::Object(out))
    }

    /// Render the schema for a language-model prompt.
    pub fn describe(&self) -> String {
        if self.fields.is_empty() {
            return "(no inputs)".into();
        }
        self.fields
            .iter()
            .map(|(name, f)| {
                let req = if f.required { ", required" } else { "" };
                let default = f
                    .default
                    .as_ref()
                    .map(|d| format!(", default {d}"))
                    .unwrap_or_default();
                format!(
                    "- {name} ({}{req}{default}): {}",
                    f.kind.describe(),
                    f.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> InputSchema {
        InputSchema::new()
            .field(
                "search_term",
                InputField::new(FieldKind::String, "what to look for").required(),
            )
            .field(
                "limit",
                InputField::new(FieldKind::Integer, "max results").with_default(json!(10)),
            )
            .field(
                "collections",
                InputField::new(
                    FieldKind::list_of(FieldKind::String),
                    "collections to search",
                ),
            )
    }

    #[test]
    fn resolve_applies_defaults_and_coercion() {
        let out = schema()
            .resolve(&json!({ "search_term": "cats", "limit": "25" }))
            .unwrap();
        assert_eq!(out["search_term"], "cats");
        assert_eq!(out["limit"], 25);
        assert!(out.get("collections").is_none());
    }

    #[test]
    fn resolve_rejects_missing_required() {
        let err = schema().resolve(&json!({ "limit": 5 })).unwrap_err();
        assert!(err.to_string().contains("search_term"));
    }

    #[test]
    fn resolve_wraps_scalar_into_list() {
        let out = schema()
            .resolve(&json!({ "search_term": "x", "collections": "products" }))
            .unwrap();
        assert_eq!(out["collections"], json!(["products"]));
    }

    #[test]
    fn resolve_drops_unknown_keys() {
        let out = schema()
            .resolve(&json!({ "search_term": "x", "bogus": true }))
            .unwrap();
        assert!(out.get("bogus").is_none());
    }

    #[test]
    fn float_field_accepts_number_strings() {
        let schema = InputSchema::new()
            .field("alpha", InputField::new(FieldKind::Float, "weight").required());
        let out = schema.resolve(&json!({ "alpha": "0.5" })).unwrap();
        assert_eq!(out["alpha"], 0.5);
    }

    #[test]
    fn describe_lists_fields() {
        let text = schema().describe();
        assert!(text.contains("search_term (string, required)"));
        assert!(text.contains("list of string"));
    }
}
