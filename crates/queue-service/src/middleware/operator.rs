//! One-time code check for staff actions that change who is served.
//!
//! When the service is built with an [`OtpVerifier`], a staff caller must
//! present the phone number and the one-time code issued to it by the
//! Identity Provider before `call-next` or `remove` reaches the engine.
//! Patient callers pass through untouched; the engine refuses them with 403.

use crate::errors::QueueError;
use crate::middleware::Caller;
use crate::routes::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::IntoResponse,
};
use common::identity::{OtpVerdict, OtpVerifier};
use std::sync::Arc;
use tracing::instrument;

pub const OPERATOR_PHONE_HEADER: &str = "x-operator-phone";
pub const OPERATOR_OTP_HEADER: &str = "x-operator-otp";

fn header<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn check(verifier: &dyn OtpVerifier, req: &Request) -> Result<(), QueueError> {
    let (Some(phone), Some(code)) = (
        header(req, OPERATOR_PHONE_HEADER),
        header(req, OPERATOR_OTP_HEADER),
    ) else {
        tracing::debug!(target: "qs.middleware.operator", "Missing operator OTP headers");
        return Err(QueueError::Unauthenticated(
            "Operator one-time code required".to_string(),
        ));
    };

    let verdict = verifier.verify(phone, code);
    if verdict.is_verified() {
        return Ok(());
    }

    tracing::debug!(target: "qs.middleware.operator", ?verdict, "Operator OTP rejected");
    let reason = match verdict {
        OtpVerdict::Expired => "One-time code expired",
        OtpVerdict::RateLimited => "Too many attempts, request a new code",
        OtpVerdict::Invalid { .. } | OtpVerdict::NotFound | OtpVerdict::Verified => {
            "Invalid one-time code"
        }
    };
    Err(QueueError::Unauthenticated(reason.to_string()))
}

/// Require a verified operator code from staff callers.
///
/// Runs after [`super::require_caller`], which supplies the `Caller`.
#[instrument(skip_all, name = "qs.middleware.operator")]
pub async fn require_operator_otp(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, QueueError> {
    let is_staff = req
        .extensions()
        .get::<Caller>()
        .is_some_and(|caller| caller.role.can_operate_queues());

    if let (true, Some(verifier)) = (is_staff, state.operator_otp.as_deref()) {
        check(verifier, &req)?;
    }
    Ok(next.run(req).await)
}
