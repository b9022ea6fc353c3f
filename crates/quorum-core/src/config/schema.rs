//! JSON Schema validation for Quorum configuration documents.
//!
//! The schema catches structural mistakes (wrong types, unknown keys,
//! out-of-range numbers) before deserialization. Cross-field rules live in
//! [`QuorumConfig::validate`](super::QuorumConfig::validate).

use std::sync::OnceLock;

const CONFIG_SCHEMA_JSON: &str = include_str!("../../schema/config.schema.json");

static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

fn get_validator() -> Result<&'static jsonschema::Validator, String> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(CONFIG_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;

        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result.as_ref().map_err(|e| e.clone())
}

/// Validate a config document against the schema.
///
/// Returns every violation found, each suffixed with its JSON pointer.
pub fn validate_config_schema(document: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e])?;

    let errors: Vec<String> = validator
        .iter_errors(document)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
