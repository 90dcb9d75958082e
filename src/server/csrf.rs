//! Double-submit cookie CSRF protection for the state-changing turn routes.
//! Safe methods (GET/HEAD/OPTIONS) get a `csrf_token` cookie minted if one
//! isn't already set; state-changing methods must echo that cookie's value
//! back in the `X-CSRF-Token` header, compared in constant time.

use axum::body::Body;
use axum::http::{HeaderValue, Method, Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

const COOKIE_NAME: &str = "csrf_token";
const HEADER_NAME: &str = "x-csrf-token";
const COOKIE_MAX_AGE_SECS: u64 = 3600 * 24;

pub async fn protect(req: Request<Body>, next: Next) -> Response {
    if matches!(req.method(), &Method::GET | &Method::HEAD | &Method::OPTIONS) {
        let cookie_present = cookie_value(&req).is_some();
        let mut response = next.run(req).await;
        if !cookie_present {
            set_cookie(&mut response, &generate_token());
        }
        return response;
    }

    let cookie_token = cookie_value(&req);
    let header_token = req
        .headers()
        .get(HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match (cookie_token, header_token) {
        (Some(cookie), Some(header)) if constant_time_eq(cookie.as_bytes(), header.as_bytes()) => {
            next.run(req).await
        }
        (None, _) => {
            tracing::warn!(path = %req.uri().path(), "csrf validation failed: no token in cookie");
            forbidden("csrf token missing in cookie")
        }
        (_, None) => {
            tracing::warn!(path = %req.uri().path(), "csrf validation failed: no token in header");
            forbidden("csrf token missing in header")
        }
        _ => {
            tracing::warn!(path = %req.uri().path(), "csrf validation failed: token mismatch");
            forbidden("csrf token mismatch")
        }
    }
}

fn forbidden(message: &str) -> Response {
    (StatusCode::FORBIDDEN, message.to_string()).into_response()
}

fn cookie_value(req: &Request<Body>) -> Option<String> {
    let header = req.headers().get(header::COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == COOKIE_NAME).then(|| value.to_string())
    })
}

fn set_cookie(response: &mut Response, token: &str) {
    let cookie = format!(
        "{COOKIE_NAME}={token}; HttpOnly; SameSite=Strict; Secure; Max-Age={COOKIE_MAX_AGE_SECS}; Path=/"
    );
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes).expect("system RNG unavailable");
    URL_SAFE_NO_PAD.encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"abc123", b"abc123"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_slices() {
        assert!(!constant_time_eq(b"abc123", b"abc124"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
    }

    #[test]
    fn generated_tokens_are_unique_and_well_formed() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert!(a.len() >= 32);
    }
}
