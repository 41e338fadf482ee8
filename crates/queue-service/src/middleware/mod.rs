//! Middleware for the queue service.
//!
//! - `caller` - Resolves the caller's role for protected routes
//! - `operator` - One-time code check for staff call-next and remove

pub mod caller;
pub mod operator;

pub use caller::{require_caller, Caller, CALLER_ROLE_HEADER};
pub use operator::{require_operator_otp, OPERATOR_OTP_HEADER, OPERATOR_PHONE_HEADER};
