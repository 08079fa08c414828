use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn sensitive_key() -> &'static Regex {
    static SENSITIVE: OnceLock<Regex> = OnceLock::new();
    SENSITIVE.get_or_init(|| Regex::new(r"(?i)(password|token)").expect("valid pattern"))
}

/// Copy of `value` with secret-looking fields replaced by `<key>`, for logging
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if sensitive_key().is_match(k) {
                        Value::String(format!("<{}>", k))
                    } else {
                        sanitize(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_nested() {
        let value = json!({
            "user": { "email": "a@b.c", "password": "hunter2" },
            "accessToken": "abc",
            "items": [{ "pushToken": 1, "id": "x" }]
        });

        assert_eq!(
            sanitize(&value),
            json!({
                "user": { "email": "a@b.c", "password": "<password>" },
                "accessToken": "<accessToken>",
                "items": [{ "pushToken": "<pushToken>", "id": "x" }]
            })
        );
    }
}
