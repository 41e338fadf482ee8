//! Short numeric codes drawn from the system CSPRNG.
//!
//! Used for one-time passwords and for the six-digit join codes handed out
//! for ad-hoc queue sessions. Codes never start with `0`, so they survive
//! being typed into numeric fields.

use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Lowest six-digit code.
const SIX_DIGIT_FLOOR: u32 = 100_000;

/// Number of distinct six-digit codes.
const SIX_DIGIT_SPAN: u32 = 900_000;

#[derive(Debug, Error)]
#[error("system random number generator failed")]
pub struct CodeGenerationError;

/// Generate a six-digit decimal code in `100000..=999999`.
///
/// The modulo bias over a 32-bit draw is below 0.03% and irrelevant for
/// codes that are rate limited or collision-checked by their callers.
pub fn six_digit_code(rng: &SystemRandom) -> Result<String, CodeGenerationError> {
    let mut bytes = [0u8; 4];
    rng.fill(&mut bytes).map_err(|_| CodeGenerationError)?;
    let value = SIX_DIGIT_FLOOR + u32::from_be_bytes(bytes) % SIX_DIGIT_SPAN;
    Ok(value.to_string())
}
