//! Argon2id password hashing. Hashes are stored as PHC strings, so the
//! parameters used at hash time travel with the hash.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;

use invoicer_core::security::Password;

use crate::error::EngineError;

/// Hash with explicit cost parameters. Production callers pass
/// `Params::default()`; tests use cheap ones.
pub fn hash_password(password: &Password, params: Params) -> Result<String, EngineError> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|e| EngineError::Internal(format!("salt encoding: {e}")))?;
    let hash = Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.expose().as_bytes(), &salt)
        .map_err(|e| EngineError::Internal(format!("password hashing: {e}")))?;
    Ok(hash.to_string())
}

/// `false` for a wrong password and for an unparseable stored hash.
pub fn verify_password(password: &Password, phc: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(phc) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.expose().as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
pub(crate) fn cheap_params() -> Params {
    Params::new(8, 1, 1, None).unwrap()
}
