//! Two-way locale container. The stored form is an object keyed by locale;
//! locking merges the plain value under the selected locale instead of
//! replacing what other locales hold, and unlocking picks one locale back
//! out. Because unlock needs no per-row metadata it also has an expression
//! form, so reads can stay inside the remote query.

use super::{FieldModifier, LockOutcome, ModifierError, ModifierResult};
use crate::query::Expr;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalizedModifier;

impl LocalizedModifier {
    pub fn new() -> Self {
        Self
    }

    fn selector<'a>(&self, args: &'a [Value]) -> ModifierResult<&'a str> {
        args.first()
            .and_then(Value::as_str)
            .ok_or_else(|| ModifierError::MissingSelector(self.name().to_string()))
    }
}

impl FieldModifier for LocalizedModifier {
    fn name(&self) -> &str {
        "localized"
    }

    fn two_way(&self) -> bool {
        true
    }

    fn lock(
        &self,
        previous: Option<&Value>,
        plain: &Value,
        args: &[Value],
    ) -> ModifierResult<LockOutcome> {
        let locale = self.selector(args)?;
        let mut locales: Map<String, Value> = match previous {
            None => Map::new(),
            Some(Value::Object(existing)) => existing.clone(),
            Some(other) => {
                return Err(ModifierError::Malformed(format!(
                    "localized storage is not an object: {}",
                    other
                )))
            }
        };
        locales.insert(locale.to_string(), plain.clone());
        let mut names: Vec<&String> = locales.keys().collect();
        names.sort();
        let meta = json!({ "locales": names });
        Ok(LockOutcome::new(Value::Object(locales)).with_meta(meta))
    }

    fn unlock(
        &self,
        locked: &Value,
        _meta: Option<&Value>,
        args: &[Value],
    ) -> ModifierResult<Value> {
        let locale = self.selector(args)?;
        let locales = locked.as_object().ok_or_else(|| {
            ModifierError::Malformed("localized storage is not an object".to_string())
        })?;
        locales
            .get(locale)
            .cloned()
            .ok_or_else(|| ModifierError::UnknownKey(format!("locale `{}`", locale)))
    }

    fn unlock_expr(&self, expr: Expr, args: &[Value]) -> ModifierResult<Expr> {
        let locale = self.selector(args)?;
        let container = expr
            .try_object()
            .map_err(|err| ModifierError::Malformed(err.to_string()))?;
        Ok(container.index(locale))
    }
}
