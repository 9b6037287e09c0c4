//! One-way salted digest. Stores hex SHA-256 of the salt followed by the
//! canonical JSON text of the plain value; membership checks re-hash the
//! candidate with the stored salt.

use super::{FieldModifier, LockOutcome, ModifierError, ModifierResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::{Mutex, MutexGuard};

const SALT_LEN: usize = 16;

pub struct DigestModifier {
    rng: Mutex<StdRng>,
}

impl DigestModifier {
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

    fn hash(salt: &[u8], plain: &Value) -> ModifierResult<String> {
        let canonical =
            serde_json::to_vec(plain).map_err(|err| ModifierError::Malformed(err.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }
}

impl Default for DigestModifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldModifier for DigestModifier {
    fn name(&self) -> &str {
        "digest"
    }

    fn lock(
        &self,
        _previous: Option<&Value>,
        plain: &Value,
        _args: &[Value],
    ) -> ModifierResult<LockOutcome> {
        let mut salt = [0u8; SALT_LEN];
        self.rng().fill(&mut salt);
        let digest = Self::hash(&salt, plain)?;
        Ok(LockOutcome::new(Value::String(digest))
            .with_meta(json!({ "salt": hex::encode(salt) })))
    }

    fn test(
        &self,
        locked: &Value,
        meta: Option<&Value>,
        candidate: &Value,
        _args: &[Value],
    ) -> ModifierResult<bool> {
        let stored = locked
            .as_str()
            .ok_or_else(|| ModifierError::Malformed("digest value is not a string".to_string()))?;
        let salt_hex = meta
            .and_then(|meta| meta.get("salt"))
            .and_then(Value::as_str)
            .ok_or_else(|| ModifierError::Malformed("digest meta is missing its salt".to_string()))?;
        let salt =
            hex::decode(salt_hex).map_err(|err| ModifierError::Malformed(err.to_string()))?;
        Ok(Self::hash(&salt, candidate)? == stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seeded_digests_are_reproducible() {
        let first = DigestModifier::with_seed(9);
        let second = DigestModifier::with_seed(9);
        let a = first.lock(None, &json!("token"), &[]).unwrap();
        let b = second.lock(None, &json!("token"), &[]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_each_lock_draws_a_fresh_salt() {
        let modifier = DigestModifier::with_seed(9);
        let a = modifier.lock(None, &json!("token"), &[]).unwrap();
        let b = modifier.lock(None, &json!("token"), &[]).unwrap();
        assert_ne!(a.value, b.value);
        assert_ne!(a.meta, b.meta);
    }

    #[test]
    fn test_membership_check_uses_stored_salt() {
        let modifier = DigestModifier::with_seed(9);
        let locked = modifier.lock(None, &json!({"n": 1}), &[]).unwrap();
        let meta = locked.meta.as_ref();
        assert!(modifier.test(&locked.value, meta, &json!({"n": 1}), &[]).unwrap());
        assert!(!modifier.test(&locked.value, meta, &json!({"n": 2}), &[]).unwrap());
    }

    #[test]
    fn test_unlock_is_not_supported() {
        let modifier = DigestModifier::with_seed(9);
        assert!(matches!(
            modifier.unlock(&json!("deadbeef"), None, &[]),
            Err(ModifierError::OperationNotSupported { .. })
        ));
    }

    #[test]
    fn test_missing_salt_meta_is_malformed() {
        let modifier = DigestModifier::with_seed(9);
        assert!(matches!(
            modifier.test(&json!("deadbeef"), None, &json!("x"), &[]),
            Err(ModifierError::Malformed(_))
        ));
    }
}
