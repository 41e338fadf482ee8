//! Common utilities and types shared across the queue workspace.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes (queues, entries)
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for short numeric codes (OTPs, session join codes)
pub mod codes;

/// Module for the Identity Provider contract (caller roles, OTP verification)
pub mod identity;
