//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports [`secrecy`]. Wrap anything that must never appear in logs:
//! the redis URL (may embed a password), issued OTP codes, bearer tokens.
//! `Debug` on these types prints a redaction marker, and the value is
//! zeroized on drop. Reading the value requires an explicit
//! [`ExposeSecret::expose_secret`] call, which keeps every read greppable.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let url = SecretString::from("redis://:hunter2@localhost:6379");
//! assert!(!format!("{url:?}").contains("hunter2"));
//! assert!(url.expose_secret().starts_with("redis://"));
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
