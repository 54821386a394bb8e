//! The top-level engine (§6): wires parsing, the reference evaluator,
//! lowering, the caches, and PGO together behind a single handle.

use crate::cache::{CompilationCache, EvalCache, OverrideFn, ParseCache, PrecompiledFn, PrecompiledRegistry, OverrideTable};
use crate::constraint::EnvConstraintId;
use crate::error::ErrorKind;
use crate::eval::{self, EvaluateConfig};
use crate::expr::{self, Expression};
use crate::lower::{self, ExpressionCompilation, LowerConfig};
use crate::pgo::{PgoAnalyzer, PgoConfig};
use pine_core::Value;
use std::sync::Arc;

/// The result of one top-level `Vm::evaluate`/`profile_evaluate` call
/// (§6): the return value plus the bookkeeping a host needs to judge how
/// much work that call did.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub expression_value: Value,
    pub expression: Expression,
    pub environment: Value,
    pub instruction_count: u64,
    pub parse_and_eval_count: u64,
    pub return_value: Value,
}

/// A self-contained Pine engine: one set of caches, one PGO analyzer, and
/// the tuning that governs both. Cheap to construct; caches start empty.
pub struct Vm {
    pub evaluate_config: EvaluateConfig,
    pub lower_config: LowerConfig,
    eval_cache: EvalCache,
    parse_cache: ParseCache,
    compilation_cache: CompilationCache,
    override_table: OverrideTable,
    precompiled: PrecompiledRegistry,
    pgo: PgoAnalyzer,
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_config(EvaluateConfig::default(), LowerConfig::default(), PgoConfig::default())
    }

    pub fn with_config(evaluate_config: EvaluateConfig, lower_config: LowerConfig, pgo_config: PgoConfig) -> Vm {
        Vm {
            evaluate_config,
            lower_config,
            eval_cache: EvalCache::new(),
            parse_cache: ParseCache::new(),
            compilation_cache: CompilationCache::new(),
            override_table: OverrideTable::new(),
            precompiled: PrecompiledRegistry::new(),
            pgo: PgoAnalyzer::new(pgo_config),
        }
    }

    fn parse_cached(&self, encoded: &Value) -> Result<Expression, ErrorKind> {
        if let Some(cached) = self.parse_cache.get(encoded) {
            return Ok(cached);
        }
        let parsed = expr::parse_expression(encoded)?;
        self.parse_cache.insert(encoded.clone(), parsed.clone());
        Ok(parsed)
    }

    /// The tables a nested `ParseAndEval` step should see, so self-hosted
    /// recursion (not just the outermost `evaluate`/`profile_evaluate` call)
    /// hits the override table, the eval cache, and the precompiled
    /// registry the same way the root call does.
    fn hooks(&self) -> eval::EvalHooks<'_> {
        eval::EvalHooks {
            override_table: Some(&self.override_table),
            eval_cache: Some(&self.eval_cache),
            precompiled: Some(&self.precompiled),
        }
    }

    /// Evaluate an encoded expression via an override if one is installed,
    /// then the eval cache, then the reference interpreter. Every nested
    /// `ParseAndEval` this recurses into consults the same three tables.
    pub fn evaluate(&self, encoded_expr: &Value, env: &Value) -> Result<Report, ErrorKind> {
        if let Some(handler) = self.override_table.lookup(encoded_expr) {
            let return_value = handler(env);
            return Ok(Report {
                expression_value: encoded_expr.clone(),
                expression: expr::Expression::Literal(return_value.clone()),
                environment: env.clone(),
                instruction_count: 0,
                parse_and_eval_count: 0,
                return_value,
            });
        }
        let expr = self.parse_cached(encoded_expr)?;
        if let Some(cached) = self.eval_cache.get(encoded_expr, env) {
            return Ok(Report {
                expression_value: encoded_expr.clone(),
                expression: expr,
                environment: env.clone(),
                instruction_count: 0,
                parse_and_eval_count: 0,
                return_value: cached,
            });
        }
        let (return_value, stats) =
            eval::evaluate_with_stats_and_hooks(&expr, env, &self.evaluate_config, &self.hooks())?;
        if eval::worth_caching(stats.instruction_count, stats.parse_and_eval_count) {
            self.eval_cache.insert(encoded_expr.clone(), env.clone(), return_value.clone());
        }
        Ok(Report {
            expression_value: encoded_expr.clone(),
            expression: expr,
            environment: env.clone(),
            instruction_count: stats.instruction_count,
            parse_and_eval_count: stats.parse_and_eval_count,
            return_value,
        })
    }

    /// Evaluate via the lowered, PGO-specialized instruction path, also
    /// recording `(expr, env)` as a new profiling sample.
    pub fn profile_evaluate(&self, encoded_expr: &Value, env: &Value) -> Result<Report, ErrorKind> {
        if let Some(handler) = self.override_table.lookup(encoded_expr) {
            let return_value = handler(env);
            return Ok(Report {
                expression_value: encoded_expr.clone(),
                expression: expr::Expression::Literal(return_value.clone()),
                environment: env.clone(),
                instruction_count: 0,
                parse_and_eval_count: 0,
                return_value,
            });
        }
        let expr = self.parse_cached(encoded_expr)?;
        self.pgo.record(&expr, env);
        let compilation = self.compilation_for(&expr);
        let instructions = compilation.select_for_environment(env);
        let (return_value, stats) =
            eval::run_instructions_with_stats_and_hooks(instructions, env, &self.evaluate_config, &self.hooks())?;
        Ok(Report {
            expression_value: encoded_expr.clone(),
            expression: expr,
            environment: env.clone(),
            instruction_count: stats.instruction_count,
            parse_and_eval_count: stats.parse_and_eval_count,
            return_value,
        })
    }

    fn compilation_for(&self, expr: &Expression) -> Arc<ExpressionCompilation> {
        self.compilation_cache.get_or_insert_with(expr, || {
            let constraints = self.pgo.constraints_for(expr);
            lower::build_compilation(expr, &constraints, &self.lower_config)
        })
    }

    /// Build (or fetch the cached) lowering for an encoded expression,
    /// using whatever PGO classes have been derived for it so far.
    pub fn build_compilation(&self, encoded_expr: &Value) -> Result<Arc<ExpressionCompilation>, ErrorKind> {
        let expr = self.parse_cached(encoded_expr)?;
        Ok(self.compilation_for(&expr))
    }

    /// Replace the cached compilation for an encoded expression with one
    /// built against exactly the given constraints, bypassing PGO.
    pub fn install_compilation_classes(
        &self,
        encoded_expr: &Value,
        constraints: &[EnvConstraintId],
    ) -> Result<(), ErrorKind> {
        let expr = self.parse_cached(encoded_expr)?;
        let compilation = lower::build_compilation(&expr, constraints, &self.lower_config);
        self.compilation_cache.insert(expr, compilation);
        Ok(())
    }

    pub fn install_override(&self, encoded_expr: Value, handler: OverrideFn) {
        self.override_table.install(encoded_expr, handler);
    }

    pub fn install_precompiled(&self, encoded_expr: Value, handler: PrecompiledFn) {
        self.precompiled.install(encoded_expr, handler);
    }

    pub fn lookup_precompiled(&self, encoded_expr: &Value) -> Option<PrecompiledFn> {
        self.precompiled.lookup(encoded_expr)
    }

    pub fn eval_cache_len(&self) -> usize {
        self.eval_cache.len()
    }
}
