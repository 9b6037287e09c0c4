//! One-way password hashing with Argon2id. The stored value is a PHC
//! string, which already carries the salt and parameters, so no extra
//! metadata is kept.

use super::{FieldModifier, LockOutcome, ModifierError, ModifierResult};
use argon2::password_hash::{Error as HashError, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};

const SALT_LEN: usize = 16;

pub struct PasswordModifier {
    rng: Mutex<StdRng>,
}

impl PasswordModifier {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Seeded construction for reproducible salts.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn require_str<'v>(value: &'v Value, what: &str) -> ModifierResult<&'v str> {
        value
            .as_str()
            .ok_or_else(|| ModifierError::Malformed(format!("{} is not a string", what)))
    }
}

impl Default for PasswordModifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldModifier for PasswordModifier {
    fn name(&self) -> &str {
        "password"
    }

    fn lock(
        &self,
        _previous: Option<&Value>,
        plain: &Value,
        _args: &[Value],
    ) -> ModifierResult<LockOutcome> {
        let password = Self::require_str(plain, "password")?;
        let mut salt = [0u8; SALT_LEN];
        self.rng().fill(&mut salt);
        let salt =
            SaltString::encode_b64(&salt).map_err(|err| ModifierError::Crypto(err.to_string()))?;
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| ModifierError::Crypto(err.to_string()))?;
        Ok(LockOutcome::new(Value::String(hash.to_string())))
    }

    fn test(
        &self,
        locked: &Value,
        _meta: Option<&Value>,
        candidate: &Value,
        _args: &[Value],
    ) -> ModifierResult<bool> {
        let stored = Self::require_str(locked, "password hash")?;
        let candidate = Self::require_str(candidate, "password")?;
        let parsed =
            PasswordHash::new(stored).map_err(|err| ModifierError::Malformed(err.to_string()))?;
        match Argon2::default().verify_password(candidate.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(HashError::Password) => Ok(false),
            Err(err) => Err(ModifierError::Crypto(err.to_string())),
        }
    }
}
