//! Shared caches and the override/precompiled dispatch tables (§4.5, §5).
//!
//! Every table here follows the same concurrency contract: many readers,
//! occasional writers, insert-if-absent, and idempotent concurrent inserts
//! (whichever of two racing inserts for the same key wins, both see a
//! consistent cache afterwards). A `Mutex<HashMap<..>>` meets that
//! contract without pretending to be a lock-free structure it doesn't need
//! to be.

use crate::expr::Expression;
use crate::lower::ExpressionCompilation;
use pine_core::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Caches a fully evaluated `(encoded_expression, environment)` pair to
/// its result value, keyed by the pair's own structural equality.
#[derive(Default)]
pub struct EvalCache {
    table: Mutex<HashMap<(Value, Value), Value>>,
}

impl EvalCache {
    pub fn new() -> EvalCache {
        EvalCache::default()
    }

    pub fn get(&self, encoded: &Value, env: &Value) -> Option<Value> {
        let table = self.table.lock().expect("eval cache lock poisoned");
        table.get(&(encoded.clone(), env.clone())).cloned()
    }

    pub fn insert(&self, encoded: Value, env: Value, result: Value) {
        let mut table = self.table.lock().expect("eval cache lock poisoned");
        table.entry((encoded, env)).or_insert(result);
    }

    pub fn len(&self) -> usize {
        self.table.lock().expect("eval cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caches the decoding of an encoded `Value` into an `Expression`.
#[derive(Default)]
pub struct ParseCache {
    table: Mutex<HashMap<Value, Expression>>,
}

impl ParseCache {
    pub fn new() -> ParseCache {
        ParseCache::default()
    }

    pub fn get(&self, encoded: &Value) -> Option<Expression> {
        let table = self.table.lock().expect("parse cache lock poisoned");
        table.get(encoded).cloned()
    }

    pub fn insert(&self, encoded: Value, parsed: Expression) {
        let mut table = self.table.lock().expect("parse cache lock poisoned");
        table.entry(encoded).or_insert(parsed);
    }
}

/// Caches the lowering (generic plus any specializations) of an
/// `Expression`.
#[derive(Default)]
pub struct CompilationCache {
    table: Mutex<HashMap<Expression, Arc<ExpressionCompilation>>>,
}

impl CompilationCache {
    pub fn new() -> CompilationCache {
        CompilationCache::default()
    }

    pub fn get(&self, expr: &Expression) -> Option<Arc<ExpressionCompilation>> {
        let table = self.table.lock().expect("compilation cache lock poisoned");
        table.get(expr).cloned()
    }

    pub fn get_or_insert_with(
        &self,
        expr: &Expression,
        build: impl FnOnce() -> ExpressionCompilation,
    ) -> Arc<ExpressionCompilation> {
        let mut table = self.table.lock().expect("compilation cache lock poisoned");
        table.entry(expr.clone()).or_insert_with(|| Arc::new(build())).clone()
    }

    /// Force-overwrite the cached compilation for `expr`, used when a host
    /// directs a specific set of specializations rather than letting PGO
    /// samples decide.
    pub fn insert(&self, expr: Expression, compilation: ExpressionCompilation) {
        let mut table = self.table.lock().expect("compilation cache lock poisoned");
        table.insert(expr, Arc::new(compilation));
    }
}

/// A host-supplied replacement for evaluating an encoded expression
/// against an environment, installed ahead of the normal parse/lower path.
pub type OverrideFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Maps an encoded expression `Value` directly to a host function, bypassing
/// parsing and lowering entirely when present.
#[derive(Default, Clone)]
pub struct OverrideTable {
    table: Arc<Mutex<HashMap<Value, OverrideFn>>>,
}

impl fmt::Debug for OverrideTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.table.lock().map(|t| t.len()).unwrap_or(0);
        f.debug_struct("OverrideTable").field("len", &len).finish()
    }
}

impl OverrideTable {
    pub fn new() -> OverrideTable {
        OverrideTable::default()
    }

    pub fn install(&self, encoded: Value, f: OverrideFn) {
        let mut table = self.table.lock().expect("override table lock poisoned");
        table.insert(encoded, f);
    }

    pub fn lookup(&self, encoded: &Value) -> Option<OverrideFn> {
        let table = self.table.lock().expect("override table lock poisoned");
        table.get(encoded).cloned()
    }
}

/// The result of dispatching to a precompiled handler for an encoded
/// expression (§4.5): a handler may produce a final value outright, signal
/// a tail-call-like re-entry into the dispatcher with a new `(expression,
/// environment)` pair, or request one stepwise continuation with an
/// intermediate value.
pub enum PrecompiledDispatch {
    Final(Value),
    TailCall(Value, Value),
    Stepwise(Value),
}

pub type PrecompiledFn = Arc<dyn Fn(&Value) -> PrecompiledDispatch + Send + Sync>;

/// Maps an encoded expression `Value` to a precompiled dispatch handler,
/// installed by a host ahead of time for known-hot expressions.
#[derive(Default, Clone)]
pub struct PrecompiledRegistry {
    table: Arc<Mutex<HashMap<Value, PrecompiledFn>>>,
}

impl PrecompiledRegistry {
    pub fn new() -> PrecompiledRegistry {
        PrecompiledRegistry::default()
    }

    pub fn install(&self, encoded: Value, f: PrecompiledFn) {
        let mut table = self.table.lock().expect("precompiled registry lock poisoned");
        table.insert(encoded, f);
    }

    pub fn lookup(&self, encoded: &Value) -> Option<PrecompiledFn> {
        let table = self.table.lock().expect("precompiled registry lock poisoned");
        table.get(encoded).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pine_core::value_from_int;

    #[test]
    fn eval_cache_insert_if_absent_keeps_the_first_winner() {
        let cache = EvalCache::new();
        let key_encoded = value_from_int(1);
        let key_env = Value::empty_list();
        cache.insert(key_encoded.clone(), key_env.clone(), value_from_int(100));
        cache.insert(key_encoded.clone(), key_env.clone(), value_from_int(999));
        assert_eq!(cache.get(&key_encoded, &key_env), Some(value_from_int(100)));
    }

    #[test]
    fn override_table_round_trips_a_handler() {
        let table = OverrideTable::new();
        let key = value_from_int(1);
        table.install(key.clone(), Arc::new(|_: &Value| value_from_int(42)));
        let handler = table.lookup(&key).expect("handler installed");
        assert_eq!(handler(&Value::empty_list()), value_from_int(42));
        assert!(table.lookup(&value_from_int(2)).is_none());
    }
}
