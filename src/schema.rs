//! JSON-schema cleaning for tool parameters.
//!
//! OpenAI-compatible providers and Gemini reject a long tail of JSON-schema
//! keywords that Anthropic clients happily send. Cleaning only ever removes
//! keywords, so applying it twice gives the same result as applying it once.

use serde_json::{Map, Value};

/// Keywords nobody downstream accepts.
const UNSUPPORTED_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "$comment",
    "allOf",
    "oneOf",
    "not",
    "const",
    "examples",
    "if",
    "then",
    "else",
    "dependentSchemas",
    "unevaluatedProperties",
];

/// Extra keywords removed for strict providers and Gemini.
const STRICT_UNSUPPORTED_KEYS: &[&str] = &[
    "additionalProperties",
    "patternProperties",
    "default",
    "format",
    "title",
    "pattern",
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "minItems",
    "maxItems",
    "uniqueItems",
];

/// Keywords whose object value maps user-chosen names to subschemas.
const NAMED_SCHEMA_MAPS: &[&str] = &["properties", "$defs", "definitions", "patternProperties"];

/// Keywords whose value is data, not schema.
const LITERAL_KEYS: &[&str] = &["enum", "required", "default"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaProfile {
    Standard,
    Strict,
}

impl SchemaProfile {
    fn is_unsupported(self, key: &str) -> bool {
        UNSUPPORTED_KEYS.contains(&key)
            || (self == SchemaProfile::Strict && STRICT_UNSUPPORTED_KEYS.contains(&key))
    }
}

pub fn clean_json_schema(schema: &Value, profile: SchemaProfile) -> Value {
    match schema {
        Value::Object(map) => Value::Object(clean_object(map, profile)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| clean_json_schema(item, profile))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn clean_object(map: &Map<String, Value>, profile: SchemaProfile) -> Map<String, Value> {
    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        if profile.is_unsupported(key) {
            continue;
        }
        let cleaned = if NAMED_SCHEMA_MAPS.contains(&key.as_str()) {
            match value {
                // Property names are kept verbatim, even ones like "const".
                Value::Object(named) => Value::Object(
                    named
                        .iter()
                        .map(|(name, sub)| (name.clone(), clean_json_schema(sub, profile)))
                        .collect(),
                ),
                other => other.clone(),
            }
        } else if LITERAL_KEYS.contains(&key.as_str()) {
            value.clone()
        } else {
            clean_json_schema(value, profile)
        };
        out.insert(key.clone(), cleaned);
    }
    out
}

/// Tool parameters as sent upstream; a missing schema becomes an empty object schema.
pub fn tool_parameters(schema: Option<&Value>, profile: SchemaProfile) -> Value {
    match schema {
        Some(schema) if schema.is_object() => clean_json_schema(schema, profile),
        _ => serde_json::json!({ "type": "object", "properties": {} }),
    }
}
