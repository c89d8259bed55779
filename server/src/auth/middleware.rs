//! Authentication extractor.
//!
//! When `AUTH_SECRET` is configured, run endpoints require
//! `Authorization: Bearer <secret>`. Without it every request is anonymous.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};

use subtle::ConstantTimeEq;

use crate::AppState;

/// Caller allowed to start and steer runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Authenticated,
    Anonymous,
}

impl FromRequestParts<AppState> for Operator {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = state.config.auth_secret.as_deref() else {
            return Ok(Operator::Anonymous);
        };

        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match auth_header {
            Some(header) if header.starts_with("Bearer ") => {
                let token = header.trim_start_matches("Bearer ").trim();
                if token.is_empty() {
                    return Err((StatusCode::UNAUTHORIZED, "Empty bearer token"));
                }
                if !constant_time_eq(token.as_bytes(), secret.as_bytes()) {
                    tracing::warn!("rejected request with invalid bearer token");
                    return Err((StatusCode::UNAUTHORIZED, "Invalid bearer token"));
                }
                Ok(Operator::Authenticated)
            }
            Some(_) => Err((
                StatusCode::UNAUTHORIZED,
                "Invalid authorization header format",
            )),
            None => Err((StatusCode::UNAUTHORIZED, "Missing authorization header")),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
