//! Auth gate for the local API.
//!
//! Runs before every protected handler:
//!
//! 1. Candidate credential from `Authorization: Bearer <token>`, or, only if
//!    no usable bearer header is present, the legacy query parameters
//!    `guid`, `password`, `token` (first non-empty wins, in that order).
//! 2. Canonical password from the vault, falling back to the legacy
//!    `password` field in config.
//! 3. Trimmed comparison in constant time.
//!
//! No candidate is a client fault (401). No canonical password is a server
//! fault (500): the agent has not been provisioned. An unreadable vault is
//! 503 rather than a silent mismatch.

use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::context::AppContext;
use crate::error::AuthError;
use crate::vault::Vault;

/// Legacy credential query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct LegacyAuthParams {
    /// Oldest clients send the password as `guid`.
    pub guid: Option<String>,
    /// Plain `password` parameter.
    pub password: Option<String>,
    /// Plain `token` parameter.
    pub token: Option<String>,
}

impl LegacyAuthParams {
    fn candidate(self) -> Option<String> {
        [self.guid, self.password, self.token]
            .into_iter()
            .flatten()
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

/// Token carried by an `Authorization` value: the text after a `Bearer`
/// scheme, or the whole value for any other scheme.
fn header_token(value: &str) -> Option<String> {
    let value = value.trim();
    let token = match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ if value.eq_ignore_ascii_case("bearer") => "",
        _ => value,
    };
    (!token.is_empty()).then(|| token.to_string())
}

/// Pull the candidate credential out of a request.
///
/// A present `Authorization` header is authoritative. The legacy query
/// parameters are only read when the header is absent.
pub fn extract_candidate(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        return value.to_str().ok().and_then(header_token);
    }
    Query::<LegacyAuthParams>::try_from_uri(uri)
        .ok()
        .and_then(|Query(params)| params.candidate())
}

/// Resolve the password requests are checked against.
pub fn resolve_canonical(vault: &Vault, config: &Config) -> Result<String, AuthError> {
    if let Some(password) = vault.get_server_password()? {
        let password = password.trim();
        if !password.is_empty() {
            return Ok(password.to_string());
        }
    }
    config
        .legacy_password()
        .map(|p| p.trim().to_string())
        .ok_or(AuthError::Misconfigured)
}

/// Constant-time comparison of trimmed credentials.
///
/// Both sides are hashed first so neither the common prefix nor the
/// length of the canonical password leaks through timing.
pub fn credentials_match(candidate: &str, canonical: &str) -> bool {
    let a = Sha256::digest(candidate.trim().as_bytes());
    let b = Sha256::digest(canonical.trim().as_bytes());
    a.as_slice().ct_eq(b.as_slice()).into()
}

/// Full gate decision for one request.
pub fn authorize(ctx: &AppContext, headers: &HeaderMap, uri: &Uri) -> Result<(), AuthError> {
    let candidate = extract_candidate(headers, uri).ok_or(AuthError::MissingCredential)?;
    let canonical = resolve_canonical(&ctx.vault, &ctx.config.snapshot())?;

    if credentials_match(&candidate, &canonical) {
        Ok(())
    } else {
        Err(AuthError::InvalidCredential)
    }
}

impl AuthError {
    /// HTTP status for this rejection.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::InvalidCredential => StatusCode::UNAUTHORIZED,
            Self::Misconfigured => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = if status == StatusCode::UNAUTHORIZED {
            "Unauthorized"
        } else {
            "ServerError"
        };
        let body = serde_json::json!({
            "status": status.as_u16(),
            "error": { "type": kind, "message": self.to_string() },
        });
        (status, Json(body)).into_response()
    }
}

/// Axum middleware wrapping protected routes.
pub async fn require_password(
    State(ctx): State<AppContext>,
    req: Request,
    next: Next,
) -> Response {
    match authorize(&ctx, req.headers(), req.uri()) {
        Ok(()) => next.run(req).await,
        Err(err) => {
            match &err {
                AuthError::Misconfigured | AuthError::Store(_) => {
                    log::error!("[Auth] {} {}: {err}", req.method(), req.uri().path());
                }
                _ => log::debug!("[Auth] Rejected {} {}: {err}", req.method(), req.uri().path()),
            }
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(auth: Option<&str>) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(value) = auth {
            map.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_bearer_header_wins_over_query() {
        let candidate = extract_candidate(&headers(Some("Bearer  abc ")), &uri("/x?password=zzz"));
        assert_eq!(candidate.as_deref(), Some("abc"));
    }

    #[test]
    fn test_bearer_scheme_case_insensitive() {
        let candidate = extract_candidate(&headers(Some("bearer abc")), &uri("/x"));
        assert_eq!(candidate.as_deref(), Some("abc"));
    }

    #[test]
    fn test_query_priority_guid_password_token() {
        let none = headers(None);
        assert_eq!(
            extract_candidate(&none, &uri("/x?token=t&password=p&guid=g")).as_deref(),
            Some("g")
        );
        assert_eq!(
            extract_candidate(&none, &uri("/x?token=t&password=p")).as_deref(),
            Some("p")
        );
        assert_eq!(extract_candidate(&none, &uri("/x?token=t")).as_deref(), Some("t"));
        assert_eq!(extract_candidate(&none, &uri("/x?guid=&token=t")).as_deref(), Some("t"));
    }

    #[test]
    fn test_non_bearer_header_ignores_query() {
        let candidate = extract_candidate(&headers(Some("Basic Zm9vOmJhcg==")), &uri("/x?guid=g"));
        assert_eq!(candidate.as_deref(), Some("Basic Zm9vOmJhcg=="));

        let candidate = extract_candidate(&headers(Some("Token hunter3")), &uri("/x?password=g"));
        assert_eq!(candidate.as_deref(), Some("Token hunter3"));
    }

    #[test]
    fn test_missing_candidate() {
        assert_eq!(extract_candidate(&headers(None), &uri("/x")), None);
        assert_eq!(extract_candidate(&headers(Some("Bearer   ")), &uri("/x")), None);
        assert_eq!(extract_candidate(&headers(Some("Bearer")), &uri("/x?guid=g")), None);
        assert_eq!(extract_candidate(&headers(Some("Bearer ")), &uri("/x?token=g")), None);
    }

    #[test]
    fn test_credentials_match_trims() {
        assert!(credentials_match(" secret\n", "secret"));
        assert!(credentials_match("secret", "  secret  "));
        assert!(!credentials_match("secret", "secret2"));
        assert!(!credentials_match("", "secret"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(AuthError::MissingCredential.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::InvalidCredential.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::Misconfigured.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            AuthError::Store(crate::error::StoreError::Unavailable("x".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
