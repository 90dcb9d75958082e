//! Structured condition clauses and first-match evaluation for CONDITION
//! nodes. Clauses are evaluated in declaration order; the first clause whose
//! operator is satisfied wins, and ties are broken purely by list position —
//! there is no implicit specificity ranking.
//!
//! On the wire a clause is authored in one of two shapes (never this
//! module's own `{field, operator, value, then}` layout, which only exists
//! internally once a clause has been parsed):
//!
//! - expression form: `{"if": "temp.age >= 18", "then": "adult"}`
//! - structured form: `{"if": {"var": "temp.age", "gte": 18}, "then": "adult"}`

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::SessionState;
use crate::resolver::{self, SecretResolver, VariableResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Contains,
    NotContains,
    In,
    NotIn,
    Exists,
    NotExists,
    IsEmpty,
    IsNotEmpty,
}

/// The structured-form operator key for each variant that's reachable from
/// either wire shape; the four extensions below (`not_contains`, `not_in`,
/// `exists`/`not_exists`/`is_empty`/`is_not_empty`) have no expression-form
/// spelling and are only produced by constructing a clause directly.
fn op_key(op: Op) -> &'static str {
    match op {
        Op::Equals => "eq",
        Op::NotEquals => "ne",
        Op::GreaterThan => "gt",
        Op::GreaterOrEqual => "gte",
        Op::LessThan => "lt",
        Op::LessOrEqual => "lte",
        Op::In => "in",
        Op::Contains => "contains",
        Op::NotContains => "not_contains",
        Op::NotIn => "not_in",
        Op::Exists => "exists",
        Op::NotExists => "not_exists",
        Op::IsEmpty => "is_empty",
        Op::IsNotEmpty => "is_not_empty",
    }
}

fn op_from_key(key: &str) -> Option<Op> {
    Some(match key {
        "eq" => Op::Equals,
        "ne" => Op::NotEquals,
        "gt" => Op::GreaterThan,
        "gte" => Op::GreaterOrEqual,
        "lt" => Op::LessThan,
        "lte" => Op::LessOrEqual,
        "in" => Op::In,
        "contains" => Op::Contains,
        "not_contains" => Op::NotContains,
        "not_in" => Op::NotIn,
        "exists" => Op::Exists,
        "not_exists" => Op::NotExists,
        "is_empty" => Op::IsEmpty,
        "is_not_empty" => Op::IsNotEmpty,
        _ => return None,
    })
}

fn op_from_expression_token(token: &str) -> Option<Op> {
    Some(match token {
        "==" => Op::Equals,
        "!=" => Op::NotEquals,
        ">=" => Op::GreaterOrEqual,
        "<=" => Op::LessOrEqual,
        ">" => Op::GreaterThan,
        "<" => Op::LessThan,
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionClause {
    /// A scope-qualified dotted path, e.g. `temp.age` or `input.text` —
    /// the same addressing used by `{{scope.path}}` references, minus the
    /// braces.
    pub field: String,
    pub operator: Op,
    pub value: Option<Value>,
    /// Edge label to follow when this clause matches.
    pub then: String,
}

impl<'de> Deserialize<'de> for ConditionClause {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(rename = "if")]
            if_: Value,
            then: String,
        }
        let wire = Wire::deserialize(deserializer)?;
        let (field, operator, value) = parse_if(&wire.if_).map_err(de::Error::custom)?;
        Ok(ConditionClause { field, operator, value, then: wire.then })
    }
}

impl Serialize for ConditionClause {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        let mut if_obj = serde_json::Map::with_capacity(2);
        if_obj.insert("var".to_string(), Value::String(self.field.clone()));
        if_obj.insert(op_key(self.operator).to_string(), self.value.clone().unwrap_or(Value::Null));
        map.serialize_entry("if", &Value::Object(if_obj))?;
        map.serialize_entry("then", &self.then)?;
        map.end()
    }
}

/// Parse the `if` field of either wire shape into `(field, operator, value)`.
fn parse_if(value: &Value) -> Result<(String, Op, Option<Value>), String> {
    match value {
        Value::String(expr) => parse_expression(expr),
        Value::Object(map) => parse_structured(map),
        other => Err(format!("condition 'if' must be a string or object, got {other}")),
    }
}

/// `"dotted.path OP literal"`, tolerant of single- or double-quoted string
/// literals, a bare number, or `true`/`false`.
fn parse_expression(expr: &str) -> Result<(String, Op, Option<Value>), String> {
    const TOKENS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];
    for token in TOKENS {
        if let Some(idx) = expr.find(token) {
            let field = expr[..idx].trim().to_string();
            let operator = op_from_expression_token(token).expect("token drawn from the match list above");
            let literal = expr[idx + token.len()..].trim();
            if field.is_empty() {
                return Err(format!("condition expression '{expr}' has no left-hand field"));
            }
            return Ok((field, operator, Some(parse_literal(literal))));
        }
    }
    Err(format!("condition expression '{expr}' has no comparison operator"))
}

fn parse_literal(raw: &str) -> Value {
    let trimmed = raw.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return Value::String(trimmed[1..trimmed.len() - 1].to_string());
        }
    }
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return Value::Number(num);
        }
    }
    Value::String(trimmed.to_string())
}

/// `{"var": "dotted.path", OP: literal}` — the operator is whichever
/// recognized key besides `var` is present.
fn parse_structured(map: &serde_json::Map<String, Value>) -> Result<(String, Op, Option<Value>), String> {
    let field = map
        .get("var")
        .and_then(Value::as_str)
        .ok_or("structured condition is missing a string 'var' key")?
        .to_string();

    for (key, value) in map {
        if key == "var" {
            continue;
        }
        if let Some(operator) = op_from_key(key) {
            return Ok((field, operator, Some(value.clone())));
        }
    }
    Err(format!("structured condition on '{field}' has no recognized comparison operator key"))
}

/// Evaluate `clauses` against `state` in order, returning the `then` label
/// of the first match, or `default_path` if none match.
pub fn evaluate(
    clauses: &[ConditionClause],
    default_path: &str,
    state: &SessionState,
    secrets: &dyn SecretResolver,
) -> String {
    let resolver = VariableResolver::new(state, secrets);
    for clause in clauses {
        if clause_matches(clause, &resolver) {
            return clause.then.clone();
        }
    }
    default_path.to_string()
}

fn clause_matches(clause: &ConditionClause, resolver: &VariableResolver) -> bool {
    let field_value = resolve_field(&clause.field, resolver);

    match clause.operator {
        Op::Exists => field_value.is_some(),
        Op::NotExists => field_value.is_none(),
        Op::IsEmpty => is_empty(field_value.as_ref()),
        Op::IsNotEmpty => !is_empty(field_value.as_ref()),
        Op::Equals => values_equal(field_value.as_ref(), clause.value.as_ref()),
        Op::NotEquals => !values_equal(field_value.as_ref(), clause.value.as_ref()),
        Op::GreaterThan => compare_numeric(field_value.as_ref(), clause.value.as_ref())
            .is_some_and(|o| o == std::cmp::Ordering::Greater),
        Op::GreaterOrEqual => compare_numeric(field_value.as_ref(), clause.value.as_ref())
            .is_some_and(|o| o != std::cmp::Ordering::Less),
        Op::LessThan => compare_numeric(field_value.as_ref(), clause.value.as_ref())
            .is_some_and(|o| o == std::cmp::Ordering::Less),
        Op::LessOrEqual => compare_numeric(field_value.as_ref(), clause.value.as_ref())
            .is_some_and(|o| o != std::cmp::Ordering::Greater),
        Op::Contains => contains(field_value.as_ref(), clause.value.as_ref()),
        Op::NotContains => !contains(field_value.as_ref(), clause.value.as_ref()),
        Op::In => clause
            .value
            .as_ref()
            .and_then(Value::as_array)
            .is_some_and(|arr| arr.iter().any(|v| Some(v) == field_value.as_ref())),
        Op::NotIn => !clause
            .value
            .as_ref()
            .and_then(Value::as_array)
            .is_some_and(|arr| arr.iter().any(|v| Some(v) == field_value.as_ref())),
    }
}

fn resolve_field(field: &str, resolver: &VariableResolver) -> Option<Value> {
    let var_ref = resolver::parse_reference(field).ok()?;
    match resolver.resolve(&var_ref) {
        resolver::Resolved::Value(v) => Some(v),
        resolver::Resolved::Absent => None,
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(m)) => m.is_empty(),
        _ => false,
    }
}

fn values_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => match (as_f64(a), as_f64(b)) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (None, None) => true,
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn compare_numeric(a: Option<&Value>, b: Option<&Value>) -> Option<std::cmp::Ordering> {
    let a = a?;
    let b = b?;
    match (as_f64(a), as_f64(b)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => a.as_str().zip(b.as_str()).map(|(a, b)| a.cmp(b)),
    }
}

fn contains(haystack: Option<&Value>, needle: Option<&Value>) -> bool {
    match (haystack, needle) {
        (Some(Value::String(h)), Some(Value::String(n))) => h.contains(n.as_str()),
        (Some(Value::Array(h)), Some(n)) => h.contains(n),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::NoSecrets;
    use serde_json::json;

    fn state_with(scopes: Value) -> SessionState {
        match scopes {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn parses_expression_form_with_quoted_literal() {
        let clause: ConditionClause =
            serde_json::from_value(json!({ "if": "temp.rot13_shift == 'u'", "then": "$0" })).unwrap();
        assert_eq!(clause.field, "temp.rot13_shift");
        assert_eq!(clause.operator, Op::Equals);
        assert_eq!(clause.value, Some(json!("u")));
        assert_eq!(clause.then, "$0");
    }

    #[test]
    fn parses_expression_form_with_numeric_and_gte() {
        let clause: ConditionClause = serde_json::from_value(json!({ "if": "temp.age >= 18", "then": "adult" })).unwrap();
        assert_eq!(clause.field, "temp.age");
        assert_eq!(clause.operator, Op::GreaterOrEqual);
        assert_eq!(clause.value, Some(json!(18.0)));
    }

    #[test]
    fn parses_structured_form() {
        let clause: ConditionClause =
            serde_json::from_value(json!({ "if": { "var": "temp.morse_sos", "eq": "sos" }, "then": "option_0" })).unwrap();
        assert_eq!(clause.field, "temp.morse_sos");
        assert_eq!(clause.operator, Op::Equals);
        assert_eq!(clause.value, Some(json!("sos")));
        assert_eq!(clause.then, "option_0");
    }

    #[test]
    fn rejects_if_with_no_recognized_operator() {
        let result: Result<ConditionClause, _> = serde_json::from_value(json!({ "if": { "var": "temp.x" }, "then": "y" }));
        assert!(result.is_err());
    }

    #[test]
    fn first_match_wins_on_tie() {
        let state = state_with(json!({ "temp": { "score": 10 } }));
        let clauses: Vec<ConditionClause> = serde_json::from_value(json!([
            { "if": { "var": "temp.score", "gte": 0 }, "then": "low" },
            { "if": { "var": "temp.score", "gte": 5 }, "then": "high" },
        ]))
        .unwrap();
        assert_eq!(evaluate(&clauses, "default", &state, &NoSecrets), "low");
    }

    #[test]
    fn falls_through_to_default_path() {
        let state = state_with(json!({ "temp": { "score": 1 } }));
        let clauses: Vec<ConditionClause> =
            serde_json::from_value(json!([{ "if": "temp.score > 100", "then": "high" }])).unwrap();
        assert_eq!(evaluate(&clauses, "default", &state, &NoSecrets), "default");
    }

    #[test]
    fn exists_and_not_exists() {
        let state = state_with(json!({ "temp": { "set": true } }));
        assert!(clause_matches(
            &ConditionClause { field: "temp.set".into(), operator: Op::Exists, value: None, then: "x".into() },
            &VariableResolver::new(&state, &NoSecrets)
        ));
        assert!(clause_matches(
            &ConditionClause { field: "temp.missing".into(), operator: Op::NotExists, value: None, then: "x".into() },
            &VariableResolver::new(&state, &NoSecrets)
        ));
    }

    #[test]
    fn contains_on_string_and_array() {
        let state = state_with(json!({ "temp": { "text": "hello world", "tags": ["a", "b"] } }));
        let resolver = VariableResolver::new(&state, &NoSecrets);
        assert!(clause_matches(
            &ConditionClause { field: "temp.text".into(), operator: Op::Contains, value: Some(json!("world")), then: "x".into() },
            &resolver
        ));
        assert!(clause_matches(
            &ConditionClause { field: "temp.tags".into(), operator: Op::Contains, value: Some(json!("a")), then: "x".into() },
            &resolver
        ));
    }

    #[test]
    fn numeric_comparison_coerces_numeric_strings() {
        let state = state_with(json!({ "input": { "age": "21" } }));
        let resolver = VariableResolver::new(&state, &NoSecrets);
        assert!(clause_matches(
            &ConditionClause { field: "input.age".into(), operator: Op::GreaterOrEqual, value: Some(json!(18)), then: "x".into() },
            &resolver
        ));
    }

    #[test]
    fn serialize_then_deserialize_round_trips() {
        let clause = ConditionClause { field: "temp.x".into(), operator: Op::Contains, value: Some(json!("a")), then: "y".into() };
        let wire = serde_json::to_value(&clause).unwrap();
        let parsed: ConditionClause = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed, clause);
    }
}
