use axum::http::HeaderMap;
use thiserror::Error;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("proxy API key is not configured")]
    Unconfigured,
    #[error("no API key supplied")]
    Missing,
    #[error("API key does not match")]
    Invalid,
}

// Checks the shared secret from `X-API-Key` or `Authorization: Bearer`; both headers are tried
pub fn validate(headers: &HeaderMap, expected: Option<&str>) -> Result<(), AuthError> {
    let expected = match expected {
        Some(key) if !key.is_empty() => key,
        _ => return Err(AuthError::Unconfigured),
    };

    let header_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    let bearer_key = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    if header_key.is_none() && bearer_key.is_none() {
        return Err(AuthError::Missing);
    }

    for candidate in [header_key, bearer_key].into_iter().flatten() {
        if constant_time_eq(candidate.as_bytes(), expected.as_bytes()) {
            return Ok(());
        }
    }
    Err(AuthError::Invalid)
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, rest) = value.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    (!token.is_empty()).then_some(token)
}

pub fn constant_time_eq(provided: &[u8], expected: &[u8]) -> bool {
    provided.len() == expected.len() && xor_accumulate(provided, expected) == 0
}

/// Folds every byte pair into a single difference byte, with no early exit.
fn xor_accumulate(provided: &[u8], expected: &[u8]) -> u8 {
    let diff = provided
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b));
    std::hint::black_box(diff)
}
