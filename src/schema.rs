//! JSON Schemas for LLM responses.
//!
//! We derive schemas from our Rust types with [`schemars`], then tighten them
//! into the subset OpenAI accepts for strict structured output: no `$ref`s,
//! every property required, and no additional properties.

use jsonschema::Validator;
use schemars::{JsonSchema, r#gen::SchemaSettings};

use crate::prelude::*;

/// A response schema plus a compiled validator for it.
#[derive(Debug)]
pub struct ResponseSchema {
    /// The schema we send to the model.
    json_schema: Value,

    /// The compiled validator.
    validator: Validator,
}

impl ResponseSchema {
    /// Build a strict response schema for `T`.
    pub fn for_type<T: JsonSchema>() -> Result<Self> {
        let json_schema = strict_schema_for::<T>()?;
        debug!(%json_schema, "Response schema");
        let validator = jsonschema::validator_for(&json_schema)
            .map_err(|err| anyhow!("Invalid response schema: {err}"))?;
        Ok(Self {
            json_schema,
            validator,
        })
    }

    /// The schema, ready to send to a model.
    pub fn json_schema(&self) -> &Value {
        &self.json_schema
    }

    /// Check that a response matches our schema.
    pub fn validate(&self, response: &Value) -> Result<()> {
        self.validator
            .validate(response)
            .map_err(|err| anyhow!("Response does not match schema: {err}: {response}"))
    }
}

/// Generate a strict JSON Schema for `T`.
pub fn strict_schema_for<T: JsonSchema>() -> Result<Value> {
    let settings = SchemaSettings::draft07().with(|settings| {
        settings.inline_subschemas = true;
        settings.meta_schema = None;
    });
    let root = settings.into_generator().into_root_schema_for::<T>();
    let mut schema = serde_json::to_value(root).context("failed to serialize schema")?;
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("definitions");
    }
    make_strict(&mut schema);
    Ok(schema)
}

/// Require every property and forbid extra ones, recursively.
fn make_strict(schema: &mut Value) {
    match schema {
        Value::Object(obj) => {
            if let Some(Value::Object(properties)) = obj.get("properties") {
                let required = properties
                    .keys()
                    .cloned()
                    .map(Value::String)
                    .collect::<Vec<_>>();
                obj.insert("required".to_owned(), Value::Array(required));
                obj.insert("additionalProperties".to_owned(), Value::Bool(false));
            }
            for value in obj.values_mut() {
                make_strict(value);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(make_strict),
        _ => {}
    }
}

/// Get a schema's title, for APIs that want a name for it.
pub fn schema_title(schema: &Value) -> &str {
    schema
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("ResponseFormat")
}
