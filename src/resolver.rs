//! Scoped template interpolation — `{{scope.path}}` — and nested-path
//! read/write over a session's scope tree. Pure with respect to scope data;
//! the only side channel is the injected secret resolver.

use serde_json::Value;
use std::fmt;

use crate::model::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    User,
    Context,
    Temp,
    Input,
    Output,
    Local,
    Secret,
}

impl Scope {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "user" => Some(Scope::User),
            "context" => Some(Scope::Context),
            "temp" => Some(Scope::Temp),
            "input" => Some(Scope::Input),
            "output" => Some(Scope::Output),
            "local" => Some(Scope::Local),
            "secret" => Some(Scope::Secret),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Context => "context",
            Scope::Temp => "temp",
            Scope::Input => "input",
            Scope::Output => "output",
            Scope::Local => "local",
            Scope::Secret => "secret",
        }
    }

    /// `user`, `context`, and `input` are populated by the engine/caller and
    /// rejected on write; `temp`, `output`, `local` are mutable by design.
    pub fn is_writable(&self) -> bool {
        matches!(self, Scope::Temp | Scope::Output | Scope::Local)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown scope '{0}'")]
    UnknownScope(String),
    #[error("scope '{0}' is read-only")]
    ReadOnlyScope(String),
    #[error("empty variable path")]
    EmptyPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRef {
    pub scope: Scope,
    /// Dotted path within the scope; empty for bare `secret:name` references
    /// where `name` is carried in `secret_name` instead.
    pub path: String,
    pub secret_name: Option<String>,
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.secret_name {
            Some(name) => write!(f, "secret:{name}"),
            None => write!(f, "{}.{}", self.scope.as_str(), self.path),
        }
    }
}

/// Parse the interior of a `{{...}}` reference: `scope.dot.path` or
/// `secret:name`.
pub fn parse_reference(raw: &str) -> Result<VarRef, ValidationError> {
    let raw = raw.trim();
    if let Some(name) = raw.strip_prefix("secret:") {
        if name.is_empty() {
            return Err(ValidationError::EmptyPath);
        }
        return Ok(VarRef { scope: Scope::Secret, path: String::new(), secret_name: Some(name.to_string()) });
    }

    let (scope_name, path) = raw.split_once('.').unwrap_or((raw, ""));
    let scope = Scope::parse(scope_name).ok_or_else(|| ValidationError::UnknownScope(scope_name.to_string()))?;
    if path.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    Ok(VarRef { scope, path: path.to_string(), secret_name: None })
}

pub trait SecretResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// A resolver with no configured secrets; every `secret:` reference is
/// absent. Useful for tests and flows that don't use secrets.
pub struct NoSecrets;

impl SecretResolver for NoSecrets {
    fn resolve(&self, _name: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub enum Resolved {
    Value(Value),
    Absent,
}

/// Navigate a dotted path through nested maps/arrays. Missing segments
/// resolve to `None` rather than panicking; arrays are indexed numerically.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(segment)?;
            }
            Value::Array(arr) => {
                let idx: usize = segment.parse().ok()?;
                current = arr.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Set a dotted path inside a JSON object, creating intermediate objects as
/// needed. The final segment always sets (overwrites) the value.
pub fn set_path(root: &mut serde_json::Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    set_path_segments(root, &segments, value);
}

fn set_path_segments(map: &mut serde_json::Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            map.insert((*last).to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            if !entry.is_object() {
                *entry = Value::Object(Default::default());
            }
            if let Value::Object(child) = entry {
                set_path_segments(child, rest, value);
            }
        }
    }
}

pub struct VariableResolver<'a> {
    state: &'a SessionState,
    secrets: &'a dyn SecretResolver,
}

impl<'a> VariableResolver<'a> {
    pub fn new(state: &'a SessionState, secrets: &'a dyn SecretResolver) -> Self {
        Self { state, secrets }
    }

    pub fn resolve(&self, var_ref: &VarRef) -> Resolved {
        if let Some(name) = &var_ref.secret_name {
            return match self.secrets.resolve(name) {
                Some(v) => Resolved::Value(Value::String(v)),
                None => Resolved::Absent,
            };
        }

        let Some(scope_value) = self.state.get(var_ref.scope.as_str()) else {
            return Resolved::Absent;
        };
        match get_path(scope_value, &var_ref.path) {
            Some(v) => Resolved::Value(v.clone()),
            None => Resolved::Absent,
        }
    }

    /// Scan `text` for `{{...}}` references and replace each with its
    /// stringified resolved value. Validation errors (unknown scope, empty
    /// path) are logged and treated as absent.
    pub fn substitute_variables(&self, text: &str, preserve_unresolved: bool) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                // Unterminated reference: emit the rest verbatim.
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let raw = &after_open[..end];
            let replacement = match parse_reference(raw) {
                Ok(var_ref) => match self.resolve(&var_ref) {
                    Resolved::Value(v) => stringify(&v),
                    Resolved::Absent => {
                        if preserve_unresolved {
                            format!("{{{{{raw}}}}}")
                        } else {
                            String::new()
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!(reference = raw, error = %e, "failed to parse variable reference");
                    if preserve_unresolved {
                        format!("{{{{{raw}}}}}")
                    } else {
                        String::new()
                    }
                }
            };
            out.push_str(&replacement);
            rest = &after_open[end + 2..];
        }
        out.push_str(rest);
        out
    }

    /// Recurse through a JSON value, substituting string fields. A string
    /// whose *entire* content is one `{{...}}` reference returns the raw
    /// resolved value with its native type; any other string (including a
    /// mix of text and references) always yields a string.
    pub fn substitute_object(&self, value: &Value, preserve_unresolved: bool) -> Value {
        match value {
            Value::String(s) => {
                if let Some(inner) = whole_reference(s) {
                    match parse_reference(inner) {
                        Ok(var_ref) => match self.resolve(&var_ref) {
                            Resolved::Value(v) => return v,
                            Resolved::Absent => {
                                return if preserve_unresolved {
                                    Value::String(s.clone())
                                } else {
                                    Value::String(String::new())
                                };
                            }
                        },
                        Err(e) => {
                            tracing::warn!(reference = inner, error = %e, "failed to parse variable reference");
                            return if preserve_unresolved {
                                Value::String(s.clone())
                            } else {
                                Value::String(String::new())
                            };
                        }
                    }
                }
                Value::String(self.substitute_variables(s, preserve_unresolved))
            }
            Value::Array(items) => Value::Array(
                items.iter().map(|v| self.substitute_object(v, preserve_unresolved)).collect(),
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.substitute_object(v, preserve_unresolved));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }
}

/// If `s` is exactly one `{{...}}` reference with nothing else around it,
/// return its inner text.
fn whole_reference(s: &str) -> Option<&str> {
    let s = s.trim();
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

/// Write `value` at `path` in `scope`. Rejects writes to read-only scopes.
pub fn write_scope(
    state: &mut SessionState,
    scope: Scope,
    path: &str,
    value: Value,
) -> Result<(), ValidationError> {
    if !scope.is_writable() {
        return Err(ValidationError::ReadOnlyScope(scope.as_str().to_string()));
    }
    if path.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    let entry = state
        .entry(scope.as_str().to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if !entry.is_object() {
        *entry = Value::Object(Default::default());
    }
    if let Value::Object(map) = entry {
        set_path(map, path, value);
    }
    Ok(())
}

/// Resolve `variable` (an optionally scope-prefixed dotted path) to a
/// `(scope, path)` pair. A prefix is only recognized as a scope if it's one
/// of the seven `Scope` variants; anything else (including a bare,
/// unprefixed path) falls back to the `variables` bucket used for
/// unqualified ACTION/QUESTION writes, which lives outside the `Scope` enum
/// entirely.
pub fn split_variable_scope(variable: &str) -> (String, String) {
    match variable.split_once('.') {
        Some((scope, path)) if Scope::parse(scope).is_some() => (scope.to_string(), path.to_string()),
        _ => ("variables".to_string(), variable.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_with(scopes: serde_json::Value) -> SessionState {
        match scopes {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn substitute_variables_basic() {
        let state = state_with(json!({ "temp": { "greeting_name": "TestUser" } }));
        let resolver = VariableResolver::new(&state, &NoSecrets);
        let out = resolver.substitute_variables("Hello {{temp.greeting_name}}, welcome!", false);
        assert_eq!(out, "Hello TestUser, welcome!");
    }

    #[test]
    fn substitute_variables_absent_preserve() {
        let state = state_with(json!({}));
        let resolver = VariableResolver::new(&state, &NoSecrets);
        let out = resolver.substitute_variables("Hi {{temp.missing}}", true);
        assert_eq!(out, "Hi {{temp.missing}}");
    }

    #[test]
    fn substitute_variables_absent_blank() {
        let state = state_with(json!({}));
        let resolver = VariableResolver::new(&state, &NoSecrets);
        let out = resolver.substitute_variables("Hi {{temp.missing}}!", false);
        assert_eq!(out, "Hi !");
    }

    #[test]
    fn substitute_object_preserves_type_for_whole_reference() {
        let state = state_with(json!({ "temp": { "count": 42 } }));
        let resolver = VariableResolver::new(&state, &NoSecrets);
        let out = resolver.substitute_object(&json!("{{temp.count}}"), false);
        assert_eq!(out, json!(42));
    }

    #[test]
    fn substitute_object_mixed_string_is_always_string() {
        let state = state_with(json!({ "temp": { "count": 42 } }));
        let resolver = VariableResolver::new(&state, &NoSecrets);
        let out = resolver.substitute_object(&json!("count: {{temp.count}}"), false);
        assert_eq!(out, json!("count: 42"));
    }

    #[test]
    fn substitute_object_recurses_maps_and_arrays() {
        let state = state_with(json!({ "temp": { "a": "x", "b": "y" } }));
        let resolver = VariableResolver::new(&state, &NoSecrets);
        let input = json!({ "list": ["{{temp.a}}", "{{temp.b}}"] });
        let out = resolver.substitute_object(&input, false);
        assert_eq!(out, json!({ "list": ["x", "y"] }));
    }

    #[test]
    fn secret_scope_never_reads_session_state() {
        let state = state_with(json!({ "secret": { "leaked": "oops" } }));
        struct Secrets;
        impl SecretResolver for Secrets {
            fn resolve(&self, name: &str) -> Option<String> {
                (name == "api_key").then(|| "shh".to_string())
            }
        }
        let resolver = VariableResolver::new(&state, &Secrets);
        assert_eq!(resolver.substitute_variables("{{secret:api_key}}", false), "shh");
        // A reference to a name under the `secret` *scope in state* is not
        // special-cased; only `secret:name` syntax goes through the resolver.
        assert_eq!(resolver.substitute_variables("{{secret:leaked}}", false), "");
    }

    #[test]
    fn write_scope_rejects_read_only() {
        let mut state = state_with(json!({}));
        let err = write_scope(&mut state, Scope::User, "name", json!("x")).unwrap_err();
        assert_eq!(err, ValidationError::ReadOnlyScope("user".into()));
    }

    #[test]
    fn write_scope_creates_intermediate_maps() {
        let mut state = state_with(json!({}));
        write_scope(&mut state, Scope::Temp, "a.b.c", json!(1)).unwrap();
        assert_eq!(state["temp"]["a"]["b"]["c"], json!(1));
    }

    #[test]
    fn get_path_indexes_arrays() {
        let v = json!({ "items": [10, 20, 30] });
        assert_eq!(get_path(&v, "items.1"), Some(&json!(20)));
    }

    #[test]
    fn parse_reference_rejects_unknown_scope() {
        assert!(parse_reference("bogus.path").is_err());
    }

    #[test]
    fn split_variable_scope_defaults_to_variables() {
        assert_eq!(split_variable_scope("answer"), ("variables".to_string(), "answer".to_string()));
        assert_eq!(split_variable_scope("temp.answer"), ("temp".to_string(), "answer".to_string()));
    }
}
