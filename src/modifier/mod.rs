//! # Field Modifier Pipeline
//!
//! Modifiers transform a field's value between its plain application form
//! and the form actually stored in a row. Each table field may carry a
//! stack of modifiers; writes push the plain value through every layer in
//! declaration order, reads pull the stored value back out in reverse.
//!
//! A modifier is either two-way (lock and unlock are inverses, e.g.
//! [`SealedModifier`]) or one-way (lock destroys information, e.g.
//! [`DigestModifier`]); one-way layers answer membership questions through
//! [`FieldModifier::test`] instead of unlock. Per-layer bookkeeping such as
//! salts and nonces travels next to the row under the reserved
//! [`MODS_KEY`] key.

mod digest;
mod localized;
mod password;
mod sealed;

pub use digest::DigestModifier;
pub use localized::LocalizedModifier;
pub use password::PasswordModifier;
pub use sealed::SealedModifier;

use crate::query::Expr;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Reserved row key holding per-field modifier metadata arrays.
pub const MODS_KEY: &str = "~mods";

#[derive(Debug, Error)]
pub enum ModifierError {
    #[error("Operation `{op}` is not supported by modifier `{modifier}`")]
    OperationNotSupported { modifier: String, op: String },

    #[error("Modifier `{0}` requires a selector argument")]
    MissingSelector(String),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Crypto failure: {0}")]
    Crypto(String),

    #[error("Malformed modified value: {0}")]
    Malformed(String),
}

pub type ModifierResult<T> = Result<T, ModifierError>;

/// Result of locking one layer: the stored form plus optional metadata
/// the layer needs back at unlock or test time.
#[derive(Debug, Clone, PartialEq)]
pub struct LockOutcome {
    pub value: Value,
    pub meta: Option<Value>,
}

impl LockOutcome {
    pub fn new(value: Value) -> Self {
        Self { value, meta: None }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// A fully locked field value and the metadata array for its stack, one
/// entry per layer (null where a layer produced none).
#[derive(Debug, Clone, PartialEq)]
pub struct LockedValue {
    pub value: Value,
    pub metas: Vec<Value>,
}

/// One transformation layer attached to a field.
pub trait FieldModifier: Send + Sync {
    /// Stable name used in logs and error messages.
    fn name(&self) -> &str;

    /// Whether [`unlock`](Self::unlock) inverts [`lock`](Self::lock).
    fn two_way(&self) -> bool {
        false
    }

    /// Transforms a plain value into its stored form. `previous` is this
    /// layer's previous output when the field already holds data, which
    /// container layers merge into rather than replace.
    fn lock(
        &self,
        previous: Option<&Value>,
        plain: &Value,
        args: &[Value],
    ) -> ModifierResult<LockOutcome>;

    /// Recovers the plain value from the stored form.
    fn unlock(&self, locked: &Value, meta: Option<&Value>, args: &[Value]) -> ModifierResult<Value> {
        let _ = (locked, meta, args);
        Err(ModifierError::OperationNotSupported {
            modifier: self.name().to_string(),
            op: "unlock".to_string(),
        })
    }

    /// Expression form of unlock, for pushing reads down into a query.
    /// Only layers whose unlock needs no per-row metadata can offer one.
    fn unlock_expr(&self, expr: Expr, args: &[Value]) -> ModifierResult<Expr> {
        let _ = (expr, args);
        Err(ModifierError::OperationNotSupported {
            modifier: self.name().to_string(),
            op: "unlock_expr".to_string(),
        })
    }

    /// Checks a candidate plain value against a stored one without
    /// recovering the plain form.
    fn test(
        &self,
        locked: &Value,
        meta: Option<&Value>,
        candidate: &Value,
        args: &[Value],
    ) -> ModifierResult<bool> {
        if self.two_way() {
            Ok(self.unlock(locked, meta, args)? == *candidate)
        } else {
            Err(ModifierError::OperationNotSupported {
                modifier: self.name().to_string(),
                op: "test".to_string(),
            })
        }
    }
}

/// Ordered stack of modifiers attached to a single field.
///
/// Writes run front to back, reads back to front. The stored value is the
/// outermost layer's output.
#[derive(Clone, Default)]
pub struct ModifierStack {
    layers: Vec<Arc<dyn FieldModifier>>,
}

impl ModifierStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: Arc<dyn FieldModifier>) {
        self.layers.push(layer);
    }

    #[must_use]
    pub fn with(mut self, layer: Arc<dyn FieldModifier>) -> Self {
        self.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Arc<dyn FieldModifier>] {
        &self.layers
    }

    /// True when every layer inverts, so reads can recover the plain value.
    pub fn two_way(&self) -> bool {
        self.layers.iter().all(|layer| layer.two_way())
    }

    /// Locks `plain` through every layer in declaration order.
    ///
    /// `stored` is the field's current locked value and metadata array, if
    /// the row already holds one. Each layer receives its own previous
    /// output, recovered by unwinding the enclosing two-way layers; once a
    /// one-way layer blocks the unwinding, inner layers see no previous.
    pub fn lock(
        &self,
        stored: Option<(&Value, &[Value])>,
        plain: &Value,
        args: &[Value],
    ) -> ModifierResult<LockedValue> {
        let previous = self.unwind_previous(stored, args);
        let mut value = plain.clone();
        let mut metas = Vec::with_capacity(self.layers.len());
        for (position, layer) in self.layers.iter().enumerate() {
            let outcome = layer.lock(previous[position].as_ref(), &value, args)?;
            value = outcome.value;
            metas.push(outcome.meta.unwrap_or(Value::Null));
        }
        Ok(LockedValue { value, metas })
    }

    /// Unlocks a stored value through every layer in reverse order. Fails
    /// with [`ModifierError::OperationNotSupported`] if any layer is
    /// one-way.
    pub fn unlock(&self, locked: &Value, metas: &[Value], args: &[Value]) -> ModifierResult<Value> {
        let mut value = locked.clone();
        for (position, layer) in self.layers.iter().enumerate().rev() {
            value = layer.unlock(&value, meta_at(metas, position), args)?;
        }
        Ok(value)
    }

    /// Builds the expression that unlocks this stack inside a query.
    pub fn unlock_expr(&self, expr: Expr, args: &[Value]) -> ModifierResult<Expr> {
        let mut expr = expr;
        for layer in self.layers.iter().rev() {
            expr = layer.unlock_expr(expr, args)?;
        }
        Ok(expr)
    }

    /// Checks `candidate` against a stored value. Outer two-way layers are
    /// unwound; the outermost one-way layer then answers. A fully two-way
    /// stack compares the recovered plain value directly.
    pub fn test(
        &self,
        locked: &Value,
        metas: &[Value],
        candidate: &Value,
        args: &[Value],
    ) -> ModifierResult<bool> {
        let mut value = locked.clone();
        for (position, layer) in self.layers.iter().enumerate().rev() {
            if layer.two_way() {
                value = layer.unlock(&value, meta_at(metas, position), args)?;
            } else {
                return layer.test(&value, meta_at(metas, position), candidate, args);
            }
        }
        Ok(value == *candidate)
    }

    /// Per-layer previous outputs recovered from the stored value. Index
    /// `i` holds what layer `i` produced on the last write, or `None` once
    /// an outer layer cannot be unwound.
    fn unwind_previous(
        &self,
        stored: Option<(&Value, &[Value])>,
        args: &[Value],
    ) -> Vec<Option<Value>> {
        let mut previous: Vec<Option<Value>> = vec![None; self.layers.len()];
        let Some((stored_value, stored_metas)) = stored else {
            return previous;
        };
        let mut current = Some(stored_value.clone());
        for position in (0..self.layers.len()).rev() {
            previous[position] = current.clone();
            if position == 0 {
                break;
            }
            let layer = &self.layers[position];
            current = match (current, layer.two_way()) {
                (Some(value), true) => {
                    match layer.unlock(&value, meta_at(stored_metas, position), args) {
                        Ok(inner) => Some(inner),
                        Err(err) => {
                            log::warn!(
                                "could not unwind `{}` layer for re-lock: {}",
                                layer.name(),
                                err
                            );
                            None
                        }
                    }
                }
                _ => None,
            };
        }
        previous
    }
}

impl fmt::Debug for ModifierStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.layers.iter().map(|layer| layer.name()))
            .finish()
    }
}

fn meta_at(metas: &[Value], position: usize) -> Option<&Value> {
    metas.get(position).filter(|meta| !meta.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sealed() -> Arc<dyn FieldModifier> {
        Arc::new(SealedModifier::with_seed("stack secret", 7))
    }

    #[test]
    fn test_two_way_stack_unlock_inverts_lock() {
        let stack = ModifierStack::new().with(sealed());
        let locked = stack.lock(None, &json!({"note": "hello"}), &[]).unwrap();
        let plain = stack.unlock(&locked.value, &locked.metas, &[]).unwrap();
        assert_eq!(plain, json!({"note": "hello"}));
    }

    #[test]
    fn test_one_way_stack_refuses_unlock() {
        let stack = ModifierStack::new().with(Arc::new(DigestModifier::with_seed(1)));
        let locked = stack.lock(None, &json!("token"), &[]).unwrap();
        assert!(matches!(
            stack.unlock(&locked.value, &locked.metas, &[]),
            Err(ModifierError::OperationNotSupported { .. })
        ));
    }

    #[test]
    fn test_metas_align_with_layers() {
        let stack = ModifierStack::new()
            .with(Arc::new(DigestModifier::with_seed(2)))
            .with(sealed());
        let locked = stack.lock(None, &json!("token"), &[]).unwrap();
        assert_eq!(locked.metas.len(), 2);
        assert!(locked.metas[0].get("salt").is_some());
        assert!(locked.metas[1].get("iv").is_some());
    }

    #[test]
    fn test_sealed_digest_stack_tests_through_outer_layer() {
        let stack = ModifierStack::new()
            .with(Arc::new(DigestModifier::with_seed(3)))
            .with(sealed());
        let locked = stack.lock(None, &json!("s3cret"), &[]).unwrap();
        assert!(stack.test(&locked.value, &locked.metas, &json!("s3cret"), &[]).unwrap());
        assert!(!stack.test(&locked.value, &locked.metas, &json!("wrong"), &[]).unwrap());
    }

    #[test]
    fn test_container_layer_sees_previous_through_sealing() {
        let stack = ModifierStack::new()
            .with(Arc::new(LocalizedModifier::new()))
            .with(sealed());
        let first = stack
            .lock(None, &json!("Hallo"), &[json!("de")])
            .unwrap();
        let second = stack
            .lock(
                Some((&first.value, &first.metas)),
                &json!("Hello"),
                &[json!("en")],
            )
            .unwrap();
        let merged = stack
            .unlock(&second.value, &second.metas, &[json!("de")])
            .unwrap();
        assert_eq!(merged, json!("Hallo"));
        let merged = stack
            .unlock(&second.value, &second.metas, &[json!("en")])
            .unwrap();
        assert_eq!(merged, json!("Hello"));
    }

    #[test]
    fn test_empty_stack_is_identity() {
        let stack = ModifierStack::new();
        let locked = stack.lock(None, &json!(42), &[]).unwrap();
        assert_eq!(locked.value, json!(42));
        assert!(locked.metas.is_empty());
        assert_eq!(stack.unlock(&json!(42), &[], &[]).unwrap(), json!(42));
    }
}
