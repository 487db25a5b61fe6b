//! Cryptographic utilities for provider callback verification.
//!
//! Callback URLs handed to the provider carry a `token` query parameter: the
//! HMAC-SHA256 of the task id under the webhook secret. An inbound callback
//! is only accepted when the token matches.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use muse_core::TaskId;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 and return the hex-encoded result.
///
/// # Errors
///
/// Returns `hmac::digest::InvalidLength` if the key is rejected. HMAC accepts
/// keys of any size, so this only fails on a broken implementation.
pub fn hmac_sha256_hex(
    secret: &str,
    message: &str,
) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison to prevent timing attacks.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Token placed in the callback URL for `task_id`.
///
/// # Errors
///
/// See [`hmac_sha256_hex`].
pub fn callback_token(
    secret: &str,
    task_id: &TaskId,
) -> Result<String, hmac::digest::InvalidLength> {
    hmac_sha256_hex(secret, &task_id.to_string())
}

/// Whether `token` was issued for `task_id` under `secret`.
#[must_use]
pub fn verify_callback_token(secret: &str, task_id: &TaskId, token: &str) -> bool {
    callback_token(secret, task_id).is_ok_and(|expected| constant_time_eq(&expected, token))
}
