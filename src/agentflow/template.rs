//! `{key}` placeholder resolution against session state.
//!
//! Two resolution modes, both performed at execution time against the
//! current state snapshot:
//!
//! - A string that is *exactly* one placeholder (`"{rates}"`) resolves to
//!   the underlying state value with its type preserved, so a tool can
//!   receive the original mapping or number rather than its string form.
//! - Placeholders embedded in larger strings (`"GET {url} now"`) are
//!   stringified in place.
//!
//! A placeholder whose key is absent from state is passed through
//! literally. That keeps partially-composed workflows runnable: the
//! producer that should have written the key is the agent at fault, and
//! the consumer surfaces the unresolved `{key}` where it is easy to spot.
//!
//! Keys may use dotted paths (`parsed.base`) to reach into mapping values;
//! an exact key match always wins over path traversal.

use serde_json::Value;
use std::collections::HashMap;

/// Resolve one state key, trying the exact key first and then a dotted
/// path into nested mappings.
pub fn lookup<'a>(state: &'a HashMap<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(v) = state.get(key) {
        return Some(v);
    }
    let mut parts = key.split('.');
    let head = parts.next()?;
    let mut current = state.get(head)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

/// Resolve placeholders inside an arbitrary JSON value.
///
/// Strings go through [`resolve_string`]; arrays and mappings are resolved
/// recursively; all other values pass through unchanged.
pub fn resolve_value(value: &Value, state: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => resolve_string(s, state),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, state)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, state)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve placeholders in one string, preserving the value type when the
/// whole string is a single placeholder.
pub fn resolve_string(input: &str, state: &HashMap<String, Value>) -> Value {
    if let Some(key) = exact_placeholder(input) {
        return match lookup(state, key) {
            Some(v) => v.clone(),
            None => Value::String(input.to_string()),
        };
    }
    Value::String(resolve_text(input, state))
}

/// Resolve placeholders in free text, stringifying each substituted value.
/// Used for model instructions, where the output is always text.
pub fn resolve_text(input: &str, state: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                if is_key_like(key) {
                    match lookup(state, key) {
                        Some(v) => out.push_str(&stringify(v)),
                        // Unknown key: keep the literal placeholder.
                        None => {
                            out.push('{');
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                } else {
                    out.push('{');
                    out.push_str(key);
                    out.push('}');
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// If the whole string is `{key}` for a key-like identifier, return the key.
fn exact_placeholder(input: &str) -> Option<&str> {
    let inner = input.strip_prefix('{')?.strip_suffix('}')?;
    if is_key_like(inner) && !inner.contains('{') {
        Some(inner)
    } else {
        None
    }
}

/// Placeholder keys are identifier-shaped, optionally dotted. Anything
/// else (JSON braces, format specs) is left alone.
fn is_key_like(candidate: &str) -> bool {
    if candidate.is_empty() {
        return false;
    }
    candidate.split('.').all(|part| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            && !part.chars().next().map_or(true, |c| c.is_ascii_digit())
    })
}

/// Stringify a JSON value for embedding into text: strings drop their
/// quotes, everything else uses compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> HashMap<String, Value> {
        let mut s = HashMap::new();
        s.insert("url".to_string(), json!("https://example.com"));
        s.insert("threshold".to_string(), json!(4200));
        s.insert("parsed".to_string(), json!({"base": "USD", "target": "COP"}));
        s
    }

    #[test]
    fn exact_placeholder_preserves_type() {
        let v = resolve_string("{threshold}", &state());
        assert_eq!(v, json!(4200));
        let m = resolve_string("{parsed}", &state());
        assert_eq!(m, json!({"base": "USD", "target": "COP"}));
    }

    #[test]
    fn embedded_placeholder_stringifies() {
        let v = resolve_string("limit={threshold}", &state());
        assert_eq!(v, json!("limit=4200"));
    }

    #[test]
    fn missing_key_passes_literal_through() {
        assert_eq!(resolve_string("{ghost}", &state()), json!("{ghost}"));
        assert_eq!(
            resolve_text("check {ghost} later", &state()),
            "check {ghost} later"
        );
    }

    #[test]
    fn dotted_paths_reach_into_mappings() {
        assert_eq!(resolve_string("{parsed.base}", &state()), json!("USD"));
        assert_eq!(
            resolve_text("pair {parsed.base}/{parsed.target}", &state()),
            "pair USD/COP"
        );
    }

    #[test]
    fn json_braces_are_not_placeholders() {
        let text = r#"respond with {"ok": true}"#;
        assert_eq!(resolve_text(text, &state()), text);
    }

    #[test]
    fn resolves_inside_nested_config_values() {
        let cfg = json!({"query": {"url": "{url}", "limit": "{threshold}"}});
        let resolved = resolve_value(&cfg, &state());
        assert_eq!(
            resolved,
            json!({"query": {"url": "https://example.com", "limit": 4200}})
        );
    }
}
