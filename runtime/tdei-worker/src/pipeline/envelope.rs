use serde_json::Value;

/// Builds the JSON prefix written before a file's first feature.
///
/// Every non-empty metadata field is emitted in order, `$schema` is added
/// when the metadata lacks one, and the prefix ends by opening the
/// `features` array. Empty means null, `false`, zero, `""`, or an array
/// that joins to an empty string (`[]`, `[null, ""]`).
pub fn geojson_header(metadata: Option<&Value>, schema_url: &str) -> String {
    let mut parts = Vec::new();
    let mut has_schema = false;
    if let Some(Value::Object(fields)) = metadata {
        for (key, value) in fields {
            if is_empty(value) {
                continue;
            }
            has_schema |= key == "$schema";
            parts.push(format!("{}: {},", Value::from(key.as_str()), value));
        }
    }
    if !has_schema {
        parts.push(format!("\"$schema\": {},", Value::from(schema_url)));
    }
    parts.push("\"type\": \"FeatureCollection\", \"features\": [".to_string());
    format!("{{ {} ", parts.join(" "))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.iter().all(joins_to_nothing),
        _ => false,
    }
}

fn joins_to_nothing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.iter().all(joins_to_nothing),
        _ => false,
    }
}
