//! Caller role middleware for protected routes.
//!
//! Authentication happens upstream: the Identity Provider's gateway verifies
//! the caller and forwards its role in the `X-Caller-Role` header. This layer
//! only parses that role and puts a [`Caller`] into the request extensions.

use crate::errors::QueueError;
use axum::{extract::Request, middleware::Next, response::IntoResponse};
use common::identity::CallerRole;
use tracing::instrument;

pub const CALLER_ROLE_HEADER: &str = "x-caller-role";

/// Authenticated caller, available to handlers as `Extension<Caller>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub role: CallerRole,
}

fn extract_role(req: &Request) -> Result<CallerRole, QueueError> {
    let header = req
        .headers()
        .get(CALLER_ROLE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::debug!(target: "qs.middleware.caller", "Missing caller role header");
            QueueError::Unauthenticated("Missing caller role".to_string())
        })?;

    header.parse::<CallerRole>().map_err(|_| {
        tracing::debug!(target: "qs.middleware.caller", "Unrecognised caller role");
        QueueError::Unauthenticated("Unrecognised caller role".to_string())
    })
}

/// Reject requests without a recognised caller role with 401.
#[instrument(skip_all, name = "qs.middleware.caller")]
pub async fn require_caller(mut req: Request, next: Next) -> Result<impl IntoResponse, QueueError> {
    let role = extract_role(&req)?;
    req.extensions_mut().insert(Caller { role });
    Ok(next.run(req).await)
}
