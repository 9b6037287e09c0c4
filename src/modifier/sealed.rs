//! Two-way authenticated encryption with AES-256-GCM. The stored value is
//! the base64 ciphertext of the plain value's canonical JSON; the nonce
//! and detached tag travel in the layer metadata. The key is derived from
//! a secret string and never leaves the modifier.

use super::{FieldModifier, LockOutcome, ModifierError, ModifierResult};
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce, Tag};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::{Mutex, MutexGuard};
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Zeroize, ZeroizeOnDrop)]
struct SealKey([u8; 32]);

pub struct SealedModifier {
    key: SealKey,
    rng: Mutex<StdRng>,
}

impl SealedModifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: Self::derive_key(secret),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Seeded construction for reproducible nonces.
    pub fn with_seed(secret: &str, seed: u64) -> Self {
        Self {
            key: Self::derive_key(secret),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn derive_key(secret: &str) -> SealKey {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        SealKey(hasher.finalize().into())
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn cipher(&self) -> ModifierResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key.0)
            .map_err(|err| ModifierError::Crypto(err.to_string()))
    }

    fn decode_meta(meta: Option<&Value>, field: &str, expected_len: usize) -> ModifierResult<Vec<u8>> {
        let encoded = meta
            .and_then(|meta| meta.get(field))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ModifierError::Malformed(format!("sealed meta is missing `{}`", field))
            })?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|err| ModifierError::Malformed(err.to_string()))?;
        if bytes.len() != expected_len {
            return Err(ModifierError::Malformed(format!(
                "sealed `{}` has length {}, expected {}",
                field,
                bytes.len(),
                expected_len
            )));
        }
        Ok(bytes)
    }
}

impl FieldModifier for SealedModifier {
    fn name(&self) -> &str {
        "sealed"
    }

    fn two_way(&self) -> bool {
        true
    }

    fn lock(
        &self,
        _previous: Option<&Value>,
        plain: &Value,
        _args: &[Value],
    ) -> ModifierResult<LockOutcome> {
        let mut buffer =
            serde_json::to_vec(plain).map_err(|err| ModifierError::Malformed(err.to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        self.rng().fill(&mut nonce);
        let tag = self
            .cipher()?
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
            .map_err(|err| ModifierError::Crypto(err.to_string()))?;
        Ok(LockOutcome::new(Value::String(BASE64.encode(&buffer))).with_meta(json!({
            "iv": BASE64.encode(nonce),
            "tag": BASE64.encode(tag),
        })))
    }

    fn unlock(
        &self,
        locked: &Value,
        meta: Option<&Value>,
        _args: &[Value],
    ) -> ModifierResult<Value> {
        let ciphertext = locked
            .as_str()
            .ok_or_else(|| ModifierError::Malformed("sealed value is not a string".to_string()))?;
        let mut buffer = BASE64
            .decode(ciphertext)
            .map_err(|err| ModifierError::Malformed(err.to_string()))?;
        let nonce = Self::decode_meta(meta, "iv", NONCE_LEN)?;
        let tag = Self::decode_meta(meta, "tag", TAG_LEN)?;
        self.cipher()?
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                b"",
                &mut buffer,
                Tag::from_slice(&tag),
            )
            .map_err(|_| ModifierError::Crypto("sealed value failed authentication".to_string()))?;
        serde_json::from_slice(&buffer).map_err(|err| ModifierError::Malformed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unlock_inverts_lock() {
        let modifier = SealedModifier::with_seed("s3cret", 5);
        let plain = json!({"card": "4111-1111", "cvv": 123});
        let locked = modifier.lock(None, &plain, &[]).unwrap();
        assert_ne!(locked.value, plain);
        let recovered = modifier.unlock(&locked.value, locked.meta.as_ref(), &[]).unwrap();
        assert_eq!(recovered, plain);
    }

    #[test]
    fn test_meta_carries_nonce_and_tag() {
        let modifier = SealedModifier::with_seed("s3cret", 5);
        let locked = modifier.lock(None, &json!("x"), &[]).unwrap();
        let meta = locked.meta.unwrap();
        assert!(meta.get("iv").is_some());
        assert!(meta.get("tag").is_some());
    }

    #[test]
    fn test_wrong_secret_fails_authentication() {
        let locked = SealedModifier::with_seed("right", 5)
            .lock(None, &json!("x"), &[])
            .unwrap();
        let other = SealedModifier::with_seed("wrong", 5);
        assert!(matches!(
            other.unlock(&locked.value, locked.meta.as_ref(), &[]),
            Err(ModifierError::Crypto(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let modifier = SealedModifier::with_seed("s3cret", 5);
        let locked = modifier.lock(None, &json!("payload"), &[]).unwrap();
        let mut bytes = BASE64.decode(locked.value.as_str().unwrap()).unwrap();
        bytes[0] ^= 0xff;
        let tampered = Value::String(BASE64.encode(&bytes));
        assert!(matches!(
            modifier.unlock(&tampered, locked.meta.as_ref(), &[]),
            Err(ModifierError::Crypto(_))
        ));
    }

    #[test]
    fn test_default_membership_check_goes_through_unlock() {
        let modifier = SealedModifier::with_seed("s3cret", 5);
        let locked = modifier.lock(None, &json!("payload"), &[]).unwrap();
        assert!(modifier
            .test(&locked.value, locked.meta.as_ref(), &json!("payload"), &[])
            .unwrap());
        assert!(!modifier
            .test(&locked.value, locked.meta.as_ref(), &json!("other"), &[])
            .unwrap());
    }

    #[test]
    fn test_missing_meta_is_malformed() {
        let modifier = SealedModifier::with_seed("s3cret", 5);
        let locked = modifier.lock(None, &json!("x"), &[]).unwrap();
        assert!(matches!(
            modifier.unlock(&locked.value, None, &[]),
            Err(ModifierError::Malformed(_))
        ));
    }
}
