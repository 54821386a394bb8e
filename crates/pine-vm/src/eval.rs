//! The evaluator (§4.4, §9).
//!
//! `evaluate` is the reference semantics: a total, direct recursive
//! interpretation of the `Expression` language (including `Conditional`
//! and `ParseAndEval`), the thing every optimization in this crate must
//! agree with. `run_instructions` is the optimized path: it walks a
//! `StackFrameInstructions` produced by the lowerer with an explicit
//! per-frame result array, so repeated or deeply nested list literals
//! don't grow the native call stack — only a non-trivial `Conditional`
//! branch or a `ParseAndEval` miss recurses into a fresh evaluation.

use crate::cache::{EvalCache, OverrideTable, PrecompiledDispatch, PrecompiledFn, PrecompiledRegistry};
use crate::error::ErrorKind;
use crate::expr::{Expression, parse_expression};
use crate::instr::{StackFrameInstructions, StackInstruction};
use crate::kernel::{self, KernelId};
use pine_core::Value;
use std::cell::Cell;

/// Evaluator-wide tuning (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluateConfig {
    /// Raised as `LimitExceeded` once a single top-level `evaluate` call's
    /// `ParseAndEval` count would exceed this.
    pub parse_and_eval_count_limit: u64,
}

impl Default for EvaluateConfig {
    fn default() -> EvaluateConfig {
        EvaluateConfig { parse_and_eval_count_limit: 100_000 }
    }
}

/// The §4.4 cache-insert work heuristic: a frame is only worth memoizing
/// once its own work (instructions run, weighted extra for every nested
/// `ParseAndEval` subframe it opened) clears this bar. Cheap frames churn
/// the eval cache without ever being expensive enough to amortize a lookup.
const CACHE_INSERT_INSTRUCTION_THRESHOLD: u64 = 700;
const CACHE_INSERT_SUBFRAME_WEIGHT: u64 = 100;

pub(crate) fn worth_caching(instruction_count: u64, subframe_count: u64) -> bool {
    instruction_count + CACHE_INSERT_SUBFRAME_WEIGHT * subframe_count > CACHE_INSERT_INSTRUCTION_THRESHOLD
}

/// Optional host-supplied tables consulted during `ParseAndEval` recursion
/// (§3, §4.4, §4.5), not just at the top of a `Vm::evaluate`/
/// `profile_evaluate` call. Every field is `None` for the bare `evaluate`/
/// `run_instructions` entry points, which have no `Vm` to draw tables from.
#[derive(Default, Clone, Copy)]
pub struct EvalHooks<'a> {
    pub override_table: Option<&'a OverrideTable>,
    pub eval_cache: Option<&'a EvalCache>,
    pub precompiled: Option<&'a PrecompiledRegistry>,
}

fn trace_enabled() -> bool {
    std::env::var_os("PINE_TRACE").is_some()
}

fn trace(msg: impl Fn() -> String) {
    if trace_enabled() {
        eprintln!("pine_vm: {}", msg());
    }
}

/// Evaluate `expr` against `env` using the direct recursive semantics.
pub fn evaluate(expr: &Expression, env: &Value, config: &EvaluateConfig) -> Result<Value, ErrorKind> {
    let budget = Cell::new(0u64);
    let node_count = Cell::new(0u64);
    eval_inner(expr, env, &[], &budget, &node_count, config, &EvalHooks::default())
}

/// Counters accumulated over one top-level `evaluate`/`run_instructions`
/// call (§6's `Report.instructionCount`/`Report.parseAndEvalCount`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvalStats {
    pub instruction_count: u64,
    pub parse_and_eval_count: u64,
}

/// Like `evaluate`, but also returns the instruction and `ParseAndEval`
/// counts accumulated along the way, for hosts that need the full §6
/// `Report`.
pub fn evaluate_with_stats(
    expr: &Expression,
    env: &Value,
    config: &EvaluateConfig,
) -> Result<(Value, EvalStats), ErrorKind> {
    evaluate_with_stats_and_hooks(expr, env, config, &EvalHooks::default())
}

/// Like `evaluate_with_stats`, but also consults a `Vm`'s override table,
/// eval cache, and precompiled registry for every `ParseAndEval` step, not
/// just the outermost call.
pub(crate) fn evaluate_with_stats_and_hooks(
    expr: &Expression,
    env: &Value,
    config: &EvaluateConfig,
    hooks: &EvalHooks,
) -> Result<(Value, EvalStats), ErrorKind> {
    let budget = Cell::new(0u64);
    let node_count = Cell::new(0u64);
    let value = eval_inner(expr, env, &[], &budget, &node_count, config, hooks)?;
    Ok((value, EvalStats { instruction_count: node_count.get(), parse_and_eval_count: budget.get() }))
}

/// Resolve a `StackReference` against a frame's already-computed results.
fn resolve_stack_reference(results: &[Value], offset: i32) -> Result<Value, ErrorKind> {
    let index = results.len() as i64 + i64::from(offset);
    if index < 0 {
        return Err(ErrorKind::InvalidInstruction {
            reason: format!("stack reference {offset} underflows a frame of {} results", results.len()),
        });
    }
    results
        .get(index as usize)
        .cloned()
        .ok_or_else(|| ErrorKind::InvalidInstruction { reason: format!("stack reference {offset} out of range") })
}

/// The shared recursive core: handles every `Expression` variant,
/// including `Conditional` and `ParseAndEval`. `results` resolves
/// `StackReference`s relative to the enclosing frame, if any (empty when
/// called from the top-level `evaluate`). `hooks` is consulted on every
/// `ParseAndEval` step, not just the outermost call, so a `Vm`'s override
/// table, eval cache, and precompiled registry all apply to self-hosted
/// recursion the same way they apply at the top level.
fn eval_inner(
    expr: &Expression,
    env: &Value,
    results: &[Value],
    budget: &Cell<u64>,
    node_count: &Cell<u64>,
    config: &EvaluateConfig,
    hooks: &EvalHooks,
) -> Result<Value, ErrorKind> {
    node_count.set(node_count.get() + 1);
    match expr {
        Expression::Literal(v) => Ok(v.clone()),
        Expression::Environment => Ok(env.clone()),
        Expression::StackReference(offset) => resolve_stack_reference(results, *offset),
        Expression::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_inner(item, env, results, budget, node_count, config, hooks)?);
            }
            Ok(Value::list(values))
        }
        Expression::KernelApplication(id, arg) => {
            Ok(kernel::apply(*id, &eval_inner(arg, env, results, budget, node_count, config, hooks)?))
        }
        Expression::Conditional(c, t, f) => {
            let cond = eval_inner(c, env, results, budget, node_count, config, hooks)?;
            if cond.is_true() {
                eval_inner(t, env, results, budget, node_count, config, hooks)
            } else if cond.is_false() {
                eval_inner(f, env, results, budget, node_count, config, hooks)
            } else {
                Ok(Value::empty_list())
            }
        }
        Expression::ParseAndEval(enc, sub_env) => {
            let encoded_value = eval_inner(enc, env, results, budget, node_count, config, hooks)?;
            let env_value = eval_inner(sub_env, env, results, budget, node_count, config, hooks)?;
            eval_parse_and_eval(&encoded_value, &env_value, budget, node_count, config, hooks)
        }
        Expression::StringTag(tag, inner) => {
            trace(|| format!("string_tag '{tag}'"));
            eval_inner(inner, env, results, budget, node_count, config, hooks)
        }
        Expression::SkipHeadPath(counts, arg) => {
            let mut v = eval_inner(arg, env, results, budget, node_count, config, hooks)?;
            for n in counts {
                v = kernel::apply(KernelId::Skip, &Value::list(vec![pine_core::value_from_int(*n), v]));
            }
            Ok(kernel::apply(KernelId::Head, &v))
        }
        Expression::EqualTwo(l, r) => {
            let lv = eval_inner(l, env, results, budget, node_count, config, hooks)?;
            let rv = eval_inner(r, env, results, budget, node_count, config, hooks)?;
            Ok(kernel::apply(KernelId::Equal, &Value::list(vec![lv, rv])))
        }
    }
}

/// Charge one `ParseAndEval` step against the budget, enforcing the
/// `parse_and_eval_count_limit` the same way regardless of whether it came
/// from a real `ParseAndEval` node or a precompiled handler's `TailCall`.
fn charge_parse_and_eval_step(budget: &Cell<u64>, config: &EvaluateConfig) -> Result<u64, ErrorKind> {
    let observed = budget.get() + 1;
    if observed > config.parse_and_eval_count_limit {
        return Err(ErrorKind::LimitExceeded { limit: config.parse_and_eval_count_limit, observed });
    }
    budget.set(observed);
    trace(|| format!("parse_and_eval #{observed} (limit {})", config.parse_and_eval_count_limit));
    Ok(observed)
}

/// Resolve one `ParseAndEval(enc, sub_env)` step against `encoded_value`/
/// `env_value` (§4.4, §4.5): an installed override short-circuits parsing
/// and lowering entirely, an eval-cache hit returns the memoized result, a
/// precompiled handler drives `eval_precompiled`, and otherwise this falls
/// back to parsing and recursing the way the direct semantics always have.
/// A result built from a fresh parse is inserted back into the eval cache
/// only when the §4.4 work heuristic judges the subframe expensive enough
/// to be worth memoizing.
fn eval_parse_and_eval(
    encoded_value: &Value,
    env_value: &Value,
    budget: &Cell<u64>,
    node_count: &Cell<u64>,
    config: &EvaluateConfig,
    hooks: &EvalHooks,
) -> Result<Value, ErrorKind> {
    if let Some(handler) = hooks.override_table.and_then(|t| t.lookup(encoded_value)) {
        charge_parse_and_eval_step(budget, config)?;
        return Ok(handler(env_value));
    }
    if let Some(cached) = hooks.eval_cache.and_then(|c| c.get(encoded_value, env_value)) {
        charge_parse_and_eval_step(budget, config)?;
        return Ok(cached);
    }
    if let Some(handler) = hooks.precompiled.and_then(|p| p.lookup(encoded_value)) {
        charge_parse_and_eval_step(budget, config)?;
        return eval_precompiled(handler, env_value, budget, node_count, config, hooks);
    }

    charge_parse_and_eval_step(budget, config)?;
    let parsed = parse_expression(encoded_value)?;

    let instructions_before = node_count.get();
    let subframes_before = budget.get();
    let result = eval_inner(&parsed, env_value, &[], budget, node_count, config, hooks)?;

    if let Some(cache) = hooks.eval_cache {
        let instruction_count = node_count.get() - instructions_before;
        let subframe_count = budget.get() - subframes_before;
        if worth_caching(instruction_count, subframe_count) {
            cache.insert(encoded_value.clone(), env_value.clone(), result.clone());
        }
    }
    Ok(result)
}

/// Drive a precompiled handler's dispatch loop (§4.5) to a final value: a
/// `Final` result returns outright, a `Stepwise` result is evaluated as one
/// more expression against the same environment (not a fresh budgeted
/// `ParseAndEval` step), and a `TailCall` re-enters dispatch against a new
/// `(expression, environment)` pair, charged as one more `ParseAndEval` step.
fn eval_precompiled(
    handler: PrecompiledFn,
    env_value: &Value,
    budget: &Cell<u64>,
    node_count: &Cell<u64>,
    config: &EvaluateConfig,
    hooks: &EvalHooks,
) -> Result<Value, ErrorKind> {
    match handler(env_value) {
        PrecompiledDispatch::Final(v) => Ok(v),
        PrecompiledDispatch::Stepwise(v) => {
            let parsed = parse_expression(&v)?;
            eval_inner(&parsed, env_value, &[], budget, node_count, config, hooks)
        }
        PrecompiledDispatch::TailCall(next_encoded, next_env) => {
            eval_parse_and_eval(&next_encoded, &next_env, budget, node_count, config, hooks)
        }
    }
}

/// Run a lowered instruction stream against `env` to completion, using an
/// explicit per-frame result array. `ParseAndEval` misses embedded in an
/// `Eval` instruction's expression (not inlined at lowering time) recurse
/// through `eval_inner`, each bounded by the same `ParseAndEvalCountLimit`.
pub fn run_instructions(
    instructions: &StackFrameInstructions,
    env: &Value,
    config: &EvaluateConfig,
) -> Result<Value, ErrorKind> {
    run_instructions_with_stats(instructions, env, config).map(|(v, _)| v)
}

/// Like `run_instructions`, but also returns the step/`ParseAndEval` counts
/// for hosts that need the full §6 `Report`. `instruction_count` here is the
/// number of instructions actually executed (jumps can skip some), not
/// merely `instructions.len()`.
pub fn run_instructions_with_stats(
    instructions: &StackFrameInstructions,
    env: &Value,
    config: &EvaluateConfig,
) -> Result<(Value, EvalStats), ErrorKind> {
    run_instructions_with_stats_and_hooks(instructions, env, config, &EvalHooks::default())
}

/// Like `run_instructions_with_stats`, but also consults a `Vm`'s override
/// table, eval cache, and precompiled registry for every `ParseAndEval`
/// step encountered inside an `Eval` instruction's expression.
pub(crate) fn run_instructions_with_stats_and_hooks(
    instructions: &StackFrameInstructions,
    env: &Value,
    config: &EvaluateConfig,
    hooks: &EvalHooks,
) -> Result<(Value, EvalStats), ErrorKind> {
    let budget = Cell::new(0u64);
    let node_count = Cell::new(0u64);
    let mut results: Vec<Value> = Vec::with_capacity(instructions.len());
    let mut ip = 0usize;
    let mut executed = 0u64;
    loop {
        let Some(instr) = instructions.get(ip) else {
            return Err(ErrorKind::InvalidInstruction { reason: format!("instruction pointer {ip} out of range") });
        };
        executed += 1;
        match instr {
            StackInstruction::Eval(expr) => {
                let value = eval_inner(expr, env, &results, &budget, &node_count, config, hooks)?;
                results.push(value);
                ip += 1;
            }
            StackInstruction::ConditionalJump { true_offset, invalid_offset } => {
                let last = results.last().ok_or(ErrorKind::ReturnBeforeAssignment)?;
                if last.is_true() {
                    ip = *true_offset;
                } else if last.is_false() {
                    ip += 1;
                } else {
                    results.push(Value::empty_list());
                    ip = *invalid_offset;
                }
            }
            StackInstruction::Jump(target) => ip = *target,
            StackInstruction::CopyLastAssigned => {
                let last = results.last().ok_or(ErrorKind::ReturnBeforeAssignment)?.clone();
                results.push(last);
                ip += 1;
            }
            StackInstruction::Return => {
                let value = results.last().cloned().ok_or(ErrorKind::ReturnBeforeAssignment)?;
                let stats = EvalStats { instruction_count: executed, parse_and_eval_count: budget.get() };
                return Ok((value, stats));
            }
        }
    }
}
