use serde_json::{Map, Value};

const KNOWN_TYPES: &[&str] = &[
    "TYPE_UNSPECIFIED",
    "STRING",
    "NUMBER",
    "INTEGER",
    "BOOLEAN",
    "ARRAY",
    "OBJECT",
    "NULL",
];

// Keywords Gemini's schema dialect rejects outright.
const UNSUPPORTED_FIELDS: &[&str] = &[
    "default",
    "minItems",
    "maxItems",
    "uniqueItems",
    "pattern",
    "minLength",
    "maxLength",
    "title",
    "examples",
    "$schema",
    "$id",
];

/// Rewrites a JSON-Schema-like tool parameter tree into the restricted
/// dialect Gemini accepts: uppercase type tags, `nullable` instead of null
/// unions, unsupported keywords stripped. Builds a new tree; the input is
/// never mutated. No input is ever rejected — anything unrecognized degrades
/// to `TYPE_UNSPECIFIED` or is dropped.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema.as_object() {
        Some(obj) => Value::Object(sanitize_object(obj)),
        None => Value::Object(Map::new()),
    }
}

fn sanitize_object(schema: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    let mut schema = schema.clone();

    // A scalar `type` next to `anyOf` is redundant; the union wins.
    if schema.contains_key("type") && schema.contains_key("anyOf") {
        schema.remove("type");
    }

    // Two-branch anyOf where one branch is the null type collapses to the
    // other branch plus nullable.
    if let Some(branches) = schema.get("anyOf").and_then(|v| v.as_array()) {
        if branches.len() == 2 {
            if is_null_type(&branches[0]) {
                out.insert("nullable".to_string(), Value::Bool(true));
                schema = branches[1].as_object().cloned().unwrap_or_default();
            } else if is_null_type(&branches[1]) {
                out.insert("nullable".to_string(), Value::Bool(true));
                schema = branches[0].as_object().cloned().unwrap_or_default();
            }
        }
    }

    if let Some(types) = schema.get("type").and_then(|v| v.as_array()) {
        flatten_type_array(types, &mut out);
    }

    for (field, value) in &schema {
        if value.is_null() {
            continue;
        }
        match field.as_str() {
            "type" => {
                // Arrays were flattened above; a literal "null" type carries
                // no information on its own.
                if let Some(name) = value.as_str() {
                    if name != "null" {
                        out.insert("type".to_string(), Value::String(to_gemini_type(name)));
                    }
                }
            }
            "items" => {
                out.insert("items".to_string(), sanitize_schema(value));
            }
            "anyOf" => {
                let mut branches = Vec::new();
                if let Some(list) = value.as_array() {
                    for item in list {
                        // An embedded null branch is a nullable flag, not a
                        // real alternative.
                        if is_null_type(item) {
                            out.insert("nullable".to_string(), Value::Bool(true));
                            continue;
                        }
                        branches.push(sanitize_schema(item));
                    }
                }
                out.insert("anyOf".to_string(), Value::Array(branches));
            }
            "properties" => {
                let mut props = Map::new();
                if let Some(map) = value.as_object() {
                    for (key, prop) in map {
                        props.insert(key.clone(), sanitize_schema(prop));
                    }
                }
                out.insert("properties".to_string(), Value::Object(props));
            }
            "additionalProperties" => {}
            name if UNSUPPORTED_FIELDS.contains(&name) => {}
            name => {
                out.insert(name.to_string(), value.clone());
            }
        }
    }

    out
}

/// `type: ["string", "null"]` style unions: split off `"null"` into a
/// nullable flag and convert the remainder.
fn flatten_type_array(types: &[Value], out: &mut Map<String, Value>) {
    let names: Vec<&str> = types.iter().filter_map(|v| v.as_str()).collect();
    if names.iter().any(|t| *t == "null") {
        out.insert("nullable".to_string(), Value::Bool(true));
    }
    let remaining: Vec<&str> = names.into_iter().filter(|t| *t != "null").collect();

    match remaining.as_slice() {
        [] => {}
        [single] => {
            out.insert("type".to_string(), Value::String(to_gemini_type(single)));
        }
        many => {
            let branches: Vec<Value> = many
                .iter()
                .map(|t| {
                    let mut branch = Map::new();
                    branch.insert("type".to_string(), Value::String(to_gemini_type(t)));
                    Value::Object(branch)
                })
                .collect();
            out.insert("anyOf".to_string(), Value::Array(branches));
        }
    }
}

fn to_gemini_type(name: &str) -> String {
    let upper = name.to_uppercase();
    if KNOWN_TYPES.contains(&upper.as_str()) {
        upper
    } else {
        "TYPE_UNSPECIFIED".to_string()
    }
}

fn is_null_type(value: &Value) -> bool {
    value.get("type").and_then(|v| v.as_str()) == Some("null")
}
