use crate::error::{AppError, AppResult};
use axum::http::{header, HeaderMap, StatusCode};

/// Checks the downstream bearer token against the configured proxy keys.
/// With no keys configured the proxy runs open, which is only sensible
/// behind an external auth layer.
pub fn authenticate(headers: &HeaderMap, proxy_keys: &[String]) -> AppResult<()> {
    if proxy_keys.is_empty() {
        return Ok(());
    }
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
        .unwrap_or("");
    if !token.is_empty() && proxy_keys.iter().any(|key| key == token) {
        return Ok(());
    }
    Err(
        AppError::new(
            StatusCode::UNAUTHORIZED,
            "invalid_proxy_key",
            "missing or invalid proxy key",
        )
        .with_type("authentication_error"),
    )
}
