//! Identity Provider contract consumed by the queue service.
//!
//! Credential management (OTP delivery, JWT issuance) lives outside this
//! workspace. The queue engine needs exactly two things from it:
//!
//! - the caller's [`CallerRole`], which the HTTP glue receives pre-validated
//!   and passes into every engine operation;
//! - a synchronous OTP verdict ([`OtpVerifier`]) that the glue consults before
//!   it will vouch for a staff role.
//!
//! [`TtlOtpStore`] is the reference OTP store. Codes are kept only as SHA-256
//! digests, expire after a fixed TTL, are evicted after too many failed
//! attempts, and the store refuses new codes once it holds `capacity` live
//! entries.

use crate::codes::{six_digit_code, CodeGenerationError};
use crate::secret::SecretString;
use ring::digest::{digest, SHA256};
use ring::rand::SystemRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Default OTP lifetime (5 minutes).
pub const DEFAULT_OTP_TTL: Duration = Duration::from_secs(5 * 60);

/// Default number of wrong guesses before a code is burned.
pub const DEFAULT_OTP_MAX_ATTEMPTS: u32 = 5;

/// Default upper bound on live codes held in memory.
pub const DEFAULT_OTP_CAPACITY: usize = 10_000;

/// Role of an authenticated caller, as asserted by the Identity Provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    /// A person joining a queue.
    Patient,
    /// Clinic staff or session host; may advance and prune queues.
    Provider,
    /// Platform administrator.
    Admin,
}

impl CallerRole {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallerRole::Patient => "patient",
            CallerRole::Provider => "provider",
            CallerRole::Admin => "admin",
        }
    }

    /// Whether this role may create, advance, prune or end queues.
    #[must_use]
    pub const fn can_operate_queues(&self) -> bool {
        matches!(self, CallerRole::Provider | CallerRole::Admin)
    }
}

impl fmt::Display for CallerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallerRole {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "patient" | "user" => Ok(CallerRole::Patient),
            "provider" | "staff" | "doctor" => Ok(CallerRole::Provider),
            "admin" => Ok(CallerRole::Admin),
            other => Err(IdentityError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Unknown caller role: {0}")]
    UnknownRole(String),

    #[error("OTP store at capacity")]
    CapacityExceeded,

    #[error(transparent)]
    CodeGeneration(#[from] CodeGenerationError),
}

/// Outcome of an OTP check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpVerdict {
    /// Code matched; the record has been consumed.
    Verified,
    /// Wrong code; the record stays until attempts run out.
    Invalid { attempts_left: u32 },
    /// Code outlived its TTL; the record has been evicted.
    Expired,
    /// Too many wrong codes; the record has been evicted.
    RateLimited,
    /// No code was issued for this phone (or it was already consumed).
    NotFound,
}

impl OtpVerdict {
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        matches!(self, OtpVerdict::Verified)
    }
}

/// Synchronous OTP verification, as offered by the Identity Provider.
pub trait OtpVerifier: Send + Sync {
    fn verify(&self, phone: &str, code: &str) -> OtpVerdict;
}

#[derive(Debug)]
struct OtpRecord {
    digest: Vec<u8>,
    expires_at: Instant,
    attempts: u32,
}

/// Bounded, expiring OTP store.
pub struct TtlOtpStore {
    ttl: Duration,
    max_attempts: u32,
    capacity: usize,
    rng: SystemRandom,
    records: Mutex<HashMap<String, OtpRecord>>,
}

impl fmt::Debug for TtlOtpStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlOtpStore")
            .field("ttl", &self.ttl)
            .field("max_attempts", &self.max_attempts)
            .field("capacity", &self.capacity)
            .field("live_records", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for TtlOtpStore {
    fn default() -> Self {
        Self::new(DEFAULT_OTP_TTL, DEFAULT_OTP_MAX_ATTEMPTS, DEFAULT_OTP_CAPACITY)
    }
}

impl TtlOtpStore {
    #[must_use]
    pub fn new(ttl: Duration, max_attempts: u32, capacity: usize) -> Self {
        Self {
            ttl,
            max_attempts,
            capacity,
            rng: SystemRandom::new(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh code for `phone`, replacing any previous one.
    ///
    /// The plain code is returned once (for delivery) and never stored.
    pub fn issue(&self, phone: &str) -> Result<SecretString, IdentityError> {
        let code = six_digit_code(&self.rng)?;
        let now = Instant::now();

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.retain(|_, record| record.expires_at > now);

        if records.len() >= self.capacity && !records.contains_key(phone) {
            warn!(
                target: "common.identity.otp",
                capacity = self.capacity,
                "OTP store full, refusing to issue"
            );
            return Err(IdentityError::CapacityExceeded);
        }

        records.insert(
            phone.to_string(),
            OtpRecord {
                digest: hash_code(&code),
                expires_at: now + self.ttl,
                attempts: 0,
            },
        );

        debug!(target: "common.identity.otp", "OTP issued");
        Ok(SecretString::from(code))
    }

    /// Drop every expired record, returning how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        before - records.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OtpVerifier for TtlOtpStore {
    fn verify(&self, phone: &str, code: &str) -> OtpVerdict {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(record) = records.get_mut(phone) else {
            return OtpVerdict::NotFound;
        };

        if Instant::now() > record.expires_at {
            records.remove(phone);
            return OtpVerdict::Expired;
        }

        if record.attempts >= self.max_attempts {
            records.remove(phone);
            return OtpVerdict::RateLimited;
        }

        if hash_code(code) != record.digest {
            record.attempts += 1;
            return OtpVerdict::Invalid {
                attempts_left: self.max_attempts.saturating_sub(record.attempts),
            };
        }

        records.remove(phone);
        OtpVerdict::Verified
    }
}

fn hash_code(code: &str) -> Vec<u8> {
    digest(&SHA256, code.as_bytes()).as_ref().to_vec()
}
