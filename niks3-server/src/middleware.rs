//! Request middleware: Host restriction and bearer-token authentication.

use anyhow::anyhow;
use axum::extract::{Extension, Host};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::error::{ServerError, ServerResult};
use crate::State;

/// Restricts valid Host headers; a request with no Host header, or one
/// not in the configured allow-list, is rejected. An empty allow-list
/// disables the check.
pub async fn restrict_host<B>(
    Extension(state): Extension<State>,
    Host(host): Host,
    req: Request<B>,
    next: Next<B>,
) -> ServerResult<Response> {
    let allowed_hosts = &state.config.read_proxy.allowed_hosts;

    if !allowed_hosts.is_empty() && !allowed_hosts.iter().any(|h| h.as_str() == host) {
        return Err(ServerError::RequestError(anyhow!("Bad Host")));
    }

    Ok(next.run(req).await)
}

/// Requires `Authorization: Bearer <token>`, matching the configured
/// token in constant time so that the response timing never leaks how
/// many leading bytes matched.
pub async fn require_bearer_token<B>(
    Extension(state): Extension<State>,
    req: Request<B>,
    next: Next<B>,
) -> ServerResult<Response> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ServerError::Unauthorized)?;

    let presented = header.strip_prefix("Bearer ").ok_or(ServerError::Unauthorized)?;

    if !tokens_match(presented, &state.auth.token) {
        return Err(ServerError::Unauthorized);
    }

    Ok(next.run(req).await)
}

/// Constant-time token comparison: the branch on length is the only data-
/// dependent early exit, and length alone reveals nothing an attacker
/// couldn't already guess by trying tokens of different sizes.
fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc123", "abc123"));
    }

    #[test]
    fn test_tokens_match_rejects_wrong_value() {
        assert!(!tokens_match("abc124", "abc123"));
    }

    #[test]
    fn test_tokens_match_rejects_wrong_length() {
        assert!(!tokens_match("abc12", "abc123"));
        assert!(!tokens_match("abc1234", "abc123"));
        assert!(!tokens_match("", "abc123"));
    }
}
