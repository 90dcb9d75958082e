//! ACTION node operations (C3): variable mutation, arithmetic, and outbound
//! API calls. Everything except `api_call` is a synchronous, local mutation
//! over the session's scope tree; `api_call` is the one op with a network
//! side effect and is split into its own async path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::model::SessionState;
use crate::resolver::{self, Scope};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ActionOp {
    SetVariable {
        variable: String,
        value: Value,
    },
    Increment {
        variable: String,
        #[serde(default = "default_increment_by")]
        by: f64,
    },
    Append {
        variable: String,
        value: Value,
    },
    Remove {
        variable: String,
    },
    Clear {
        variable: String,
    },
    Calculate {
        variable: String,
        /// Arithmetic expression with `{{scope.path}}` references already
        /// substituted by the caller before this op runs.
        expression: String,
    },
    ApiCall {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        payload: Value,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        #[serde(default)]
        store_response: bool,
        #[serde(default = "default_response_key")]
        response_key: String,
    },
}

fn default_increment_by() -> f64 {
    1.0
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_response_key() -> String {
    "result".to_string()
}

/// Resolve a `variable` target into a writable `(scope, path)` pair,
/// defaulting to the `variables` scope per [`resolver::split_variable_scope`].
fn target(variable: &str) -> (Scope, String) {
    let (scope_name, path) = resolver::split_variable_scope(variable);
    let scope = Scope::parse(&scope_name).unwrap_or(Scope::Temp);
    (scope, path)
}

fn read(state: &SessionState, scope: Scope, path: &str) -> Option<Value> {
    state.get(scope.as_str()).and_then(|v| resolver::get_path(v, path)).cloned()
}

fn write(state: &mut SessionState, scope: Scope, path: &str, value: Value) -> Result<(), AppError> {
    resolver::write_scope(state, scope, path, value)
        .map_err(|e| AppError::InvalidInput(e.to_string()))
}

/// Apply a synchronous action op in place. `ApiCall` is rejected here — the
/// engine must route it through [`call_api`] instead.
pub fn apply(op: &ActionOp, state: &mut SessionState) -> Result<(), AppError> {
    match op {
        ActionOp::SetVariable { variable, value } => {
            let (scope, path) = target(variable);
            write(state, scope, &path, value.clone())
        }
        ActionOp::Increment { variable, by } => {
            let (scope, path) = target(variable);
            let current = read(state, scope, &path).and_then(|v| v.as_f64()).unwrap_or(0.0);
            write(state, scope, &path, json_number(current + by))
        }
        ActionOp::Append { variable, value } => {
            let (scope, path) = target(variable);
            let mut current = match read(state, scope, &path) {
                Some(Value::Array(arr)) => arr,
                Some(other) => vec![other],
                None => Vec::new(),
            };
            current.push(value.clone());
            write(state, scope, &path, Value::Array(current))
        }
        ActionOp::Remove { variable } => {
            let (scope, path) = target(variable);
            remove_path(state, scope, &path);
            Ok(())
        }
        ActionOp::Clear { variable } => {
            let (scope, path) = target(variable);
            write(state, scope, &path, Value::Null)
        }
        ActionOp::Calculate { variable, expression } => {
            let (scope, path) = target(variable);
            let result = eval_expression(expression)?;
            write(state, scope, &path, json_number(result))
        }
        ActionOp::ApiCall { .. } => Err(AppError::InvalidInput(
            "api_call must be dispatched via call_api, not apply".into(),
        )),
    }
}

fn remove_path(state: &mut SessionState, scope: Scope, path: &str) {
    let Some(Value::Object(scope_map)) = state.get_mut(scope.as_str()) else { return };
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else { return };
    let mut current = scope_map;
    for seg in segments {
        match current.get_mut(seg) {
            Some(Value::Object(next)) => current = next,
            _ => return,
        }
    }
    current.remove(last);
}

fn json_number(n: f64) -> Value {
    serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

/// Perform the `api_call` op. Returns the response body (or a
/// `{status, ok}` summary when not storing the body) for the caller to
/// write into `response_key` under `webhook_responses`/`api_responses`.
pub async fn call_api(client: &reqwest::Client, op: &ActionOp) -> Result<Value, AppError> {
    let ActionOp::ApiCall { url, method, headers, payload, timeout_secs, .. } = op else {
        return Err(AppError::InvalidInput("call_api requires an ApiCall op".into()));
    };

    let method = method.parse::<reqwest::Method>().map_err(|e| AppError::InvalidInput(e.to_string()))?;
    let mut req = client
        .request(method, url)
        .timeout(std::time::Duration::from_secs(*timeout_secs));
    for (k, v) in headers {
        req = req.header(k, v);
    }
    if !payload.is_null() {
        req = req.json(payload);
    }

    let resp = req.send().await.map_err(|e| AppError::ApiCallFailed(e.to_string()))?;
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        tracing::warn!(%status, url, "api_call returned non-success status");
        return Err(AppError::ApiCallFailed(format!("{status}")));
    }
    Ok(body)
}

// ---------------------------------------------------------------------------
// Arithmetic expression evaluator for `calculate`
// ---------------------------------------------------------------------------
//
// Deliberately narrow: numeric literals, `+ - * / %`, and parentheses. No
// identifiers, no function calls — variable references are substituted into
// the expression string before it reaches here.

pub fn eval_expression(expr: &str) -> Result<f64, AppError> {
    let tokens = tokenize(expr)?;
    let mut pos = 0;
    let value = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(AppError::InvalidInput(format!("unexpected token in expression: {expr}")));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, AppError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '+' => { tokens.push(Token::Plus); i += 1; }
            '-' => { tokens.push(Token::Minus); i += 1; }
            '*' => { tokens.push(Token::Star); i += 1; }
            '/' => { tokens.push(Token::Slash); i += 1; }
            '%' => { tokens.push(Token::Percent); i += 1; }
            '(' => { tokens.push(Token::LParen); i += 1; }
            ')' => { tokens.push(Token::RParen); i += 1; }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse()
                    .map_err(|_| AppError::InvalidInput(format!("invalid number '{text}' in expression")))?;
                tokens.push(Token::Number(n));
            }
            other => {
                return Err(AppError::InvalidInput(format!(
                    "unexpected character '{other}' in expression"
                )));
            }
        }
    }
    Ok(tokens)
}

fn parse_expr(tokens: &[Token], pos: &mut usize) -> Result<f64, AppError> {
    let mut value = parse_term(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(Token::Plus) => {
                *pos += 1;
                value += parse_term(tokens, pos)?;
            }
            Some(Token::Minus) => {
                *pos += 1;
                value -= parse_term(tokens, pos)?;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_term(tokens: &[Token], pos: &mut usize) -> Result<f64, AppError> {
    let mut value = parse_factor(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some(Token::Star) => {
                *pos += 1;
                value *= parse_factor(tokens, pos)?;
            }
            Some(Token::Slash) => {
                *pos += 1;
                let rhs = parse_factor(tokens, pos)?;
                if rhs == 0.0 {
                    return Err(AppError::InvalidInput("division by zero in expression".into()));
                }
                value /= rhs;
            }
            Some(Token::Percent) => {
                *pos += 1;
                let rhs = parse_factor(tokens, pos)?;
                if rhs == 0.0 {
                    return Err(AppError::InvalidInput("modulo by zero in expression".into()));
                }
                value %= rhs;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_factor(tokens: &[Token], pos: &mut usize) -> Result<f64, AppError> {
    match tokens.get(*pos) {
        Some(Token::Minus) => {
            *pos += 1;
            Ok(-parse_factor(tokens, pos)?)
        }
        Some(Token::Plus) => {
            *pos += 1;
            parse_factor(tokens, pos)
        }
        Some(Token::Number(n)) => {
            *pos += 1;
            Ok(*n)
        }
        Some(Token::LParen) => {
            *pos += 1;
            let value = parse_expr(tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::RParen) => {
                    *pos += 1;
                    Ok(value)
                }
                _ => Err(AppError::InvalidInput("unmatched '(' in expression".into())),
            }
        }
        _ => Err(AppError::InvalidInput("expected a number or '(' in expression".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_with(scopes: Value) -> SessionState {
        match scopes {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn set_variable_writes_default_scope() {
        let mut state = state_with(json!({}));
        apply(&ActionOp::SetVariable { variable: "name".into(), value: json!("Ada") }, &mut state).unwrap();
        assert_eq!(state["temp"]["name"], json!("Ada"));
    }

    #[test]
    fn increment_defaults_to_one_and_accumulates() {
        let mut state = state_with(json!({}));
        let op = ActionOp::Increment { variable: "temp.count".into(), by: 1.0 };
        apply(&op, &mut state).unwrap();
        apply(&op, &mut state).unwrap();
        assert_eq!(state["temp"]["count"], json!(2.0));
    }

    #[test]
    fn append_creates_array_from_scalar() {
        let mut state = state_with(json!({ "temp": { "tags": "first" } }));
        apply(&ActionOp::Append { variable: "temp.tags".into(), value: json!("second") }, &mut state).unwrap();
        assert_eq!(state["temp"]["tags"], json!(["first", "second"]));
    }

    #[test]
    fn remove_deletes_key_without_erroring_on_missing() {
        let mut state = state_with(json!({ "temp": { "a": 1 } }));
        apply(&ActionOp::Remove { variable: "temp.a".into() }, &mut state).unwrap();
        assert!(state["temp"].get("a").is_none());
        apply(&ActionOp::Remove { variable: "temp.never_existed".into() }, &mut state).unwrap();
    }

    #[test]
    fn clear_sets_null_rather_than_removing() {
        let mut state = state_with(json!({ "temp": { "a": 1 } }));
        apply(&ActionOp::Clear { variable: "temp.a".into() }, &mut state).unwrap();
        assert_eq!(state["temp"]["a"], json!(null));
    }

    #[test]
    fn calculate_respects_precedence_and_parens() {
        assert_eq!(eval_expression("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(eval_expression("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(eval_expression("10 % 3").unwrap(), 1.0);
        assert_eq!(eval_expression("-5 + 2").unwrap(), -3.0);
    }

    #[test]
    fn calculate_rejects_division_by_zero() {
        assert!(eval_expression("1 / 0").is_err());
    }

    #[test]
    fn calculate_writes_result_into_target() {
        let mut state = state_with(json!({}));
        let op = ActionOp::Calculate { variable: "temp.total".into(), expression: "3 * 7".into() };
        apply(&op, &mut state).unwrap();
        assert_eq!(state["temp"]["total"], json!(21.0));
    }

    #[test]
    fn api_call_is_rejected_by_sync_apply() {
        let mut state = state_with(json!({}));
        let op = ActionOp::ApiCall {
            url: "https://example.com".into(),
            method: "GET".into(),
            headers: HashMap::new(),
            payload: Value::Null,
            timeout_secs: 30,
            store_response: false,
            response_key: "result".into(),
        };
        assert!(apply(&op, &mut state).is_err());
    }
}
