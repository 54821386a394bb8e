//! The lowerer (§3, §4.3): turns a surface `Expression`, optionally
//! specialized against an `EnvConstraintId`, into a `StackFrameInstructions`
//! an evaluator can run without recursing into the native call stack for
//! anything but non-trivial `Conditional` branches.
//!
//! The pipeline is: substitute known environment paths, reduce (bounded
//! constant folding), inline closed `ParseAndEval` calls, reduce again,
//! fuse recognizable kernel chains, then emit instructions. Lowering never
//! raises: anything it cannot fold or inline is simply left for the
//! evaluator to handle at run time.

use crate::constraint::EnvConstraintId;
use crate::expr::{Expression, parse_expression};
use crate::instr::{StackFrameInstructions, StackInstruction};
use crate::kernel::{self, KernelId};
use pine_core::Value;
use std::collections::HashMap;

/// Tuning knobs for the lowering pipeline (§4.3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerConfig {
    /// Maximum number of constant-folding passes over the tree.
    pub reduction_depth_bound: u32,
    /// A sub-expression must have at least this many nodes (or be a
    /// kernel application / fused form / string tag) and occur more than
    /// once to be promoted to its own instruction.
    pub cse_size_threshold: usize,
    /// `ParseAndEval` inlining is skipped once the parsed expression
    /// exceeds this many sub-expressions.
    pub inline_max_subexprs: usize,
    /// ...or this many `Conditional` nodes.
    pub inline_max_conditionals: usize,
    /// ...or this many nested `ParseAndEval` nodes.
    pub inline_max_nested: usize,
}

impl Default for LowerConfig {
    fn default() -> LowerConfig {
        LowerConfig {
            reduction_depth_bound: 10,
            cse_size_threshold: 10,
            inline_max_subexprs: 300,
            inline_max_conditionals: 3,
            inline_max_nested: 4,
        }
    }
}

/// The generic lowering of an `Expression` plus zero or more
/// environment-specialized lowerings, ordered most-specific-first.
#[derive(Debug, Clone)]
pub struct ExpressionCompilation {
    generic: StackFrameInstructions,
    specializations: Vec<(EnvConstraintId, StackFrameInstructions)>,
}

impl ExpressionCompilation {
    /// Pick the first specialization whose constraint matches `env`,
    /// falling back to the generic lowering.
    pub fn select_for_environment(&self, env: &Value) -> &StackFrameInstructions {
        self.specializations
            .iter()
            .find(|(constraint, _)| constraint.matches(env))
            .map(|(_, instructions)| instructions)
            .unwrap_or(&self.generic)
    }

    pub fn generic(&self) -> &StackFrameInstructions {
        &self.generic
    }

    pub fn specializations(&self) -> &[(EnvConstraintId, StackFrameInstructions)] {
        &self.specializations
    }
}

/// Lower `expr` for every constraint in `constraints` plus the unconstrained
/// case, ordering specializations most-specific-first so `select_for_environment`
/// picks the tightest match.
pub fn build_compilation(
    expr: &Expression,
    constraints: &[EnvConstraintId],
    config: &LowerConfig,
) -> ExpressionCompilation {
    let generic = lower(expr, None, config);
    let mut ordered: Vec<&EnvConstraintId> = constraints.iter().collect();
    ordered.sort_by(|a, b| b.len().cmp(&a.len()));
    let specializations =
        ordered.into_iter().map(|c| (c.clone(), lower(expr, Some(c), config))).collect();
    ExpressionCompilation { generic, specializations }
}

/// Lower a single `(expr, constraint)` pair to an instruction stream.
pub fn lower(expr: &Expression, constraint: Option<&EnvConstraintId>, config: &LowerConfig) -> StackFrameInstructions {
    let substituted = match constraint {
        Some(c) => substitute_paths(expr, c),
        None => expr.clone(),
    };
    let reduced = reduce(substituted, config.reduction_depth_bound);
    let mut inlining_stack = Vec::new();
    let inlined = inline_parse_and_eval(reduced, &mut inlining_stack, config);
    let reduced_again = reduce(inlined, config.reduction_depth_bound);
    let fused = fuse(reduced_again);
    StackFrameInstructions::new(emit(fused, config))
}

// --- Step 1: substitution -------------------------------------------------

/// Replace every sub-expression that is exactly a fixed environment path
/// bound by `constraint` with the literal value that path is known to hold.
fn substitute_paths(expr: &Expression, constraint: &EnvConstraintId) -> Expression {
    if let Some(path) = expr.as_environment_path() {
        if let Some(bound) = constraint.binding_for(&path) {
            return Expression::Literal(bound.clone());
        }
    }
    match expr {
        Expression::Literal(_) | Expression::Environment | Expression::StackReference(_) => expr.clone(),
        Expression::List(items) => {
            Expression::List(items.iter().map(|e| substitute_paths(e, constraint)).collect())
        }
        Expression::KernelApplication(id, arg) => {
            Expression::KernelApplication(*id, Box::new(substitute_paths(arg, constraint)))
        }
        Expression::Conditional(c, t, f) => Expression::Conditional(
            Box::new(substitute_paths(c, constraint)),
            Box::new(substitute_paths(t, constraint)),
            Box::new(substitute_paths(f, constraint)),
        ),
        Expression::ParseAndEval(enc, env) => Expression::ParseAndEval(
            Box::new(substitute_paths(enc, constraint)),
            Box::new(substitute_paths(env, constraint)),
        ),
        Expression::StringTag(s, inner) => {
            Expression::StringTag(s.clone(), Box::new(substitute_paths(inner, constraint)))
        }
        Expression::SkipHeadPath(counts, arg) => {
            Expression::SkipHeadPath(counts.clone(), Box::new(substitute_paths(arg, constraint)))
        }
        Expression::EqualTwo(l, r) => Expression::EqualTwo(
            Box::new(substitute_paths(l, constraint)),
            Box::new(substitute_paths(r, constraint)),
        ),
    }
}

// --- A closed-expression evaluator, shared by reduction and inlining -----

/// Evaluate an expression known to have no free `Environment` reference
/// relative to `env` (the binding, if any, for an `Environment` node
/// encountered directly under this call — used when recursing into a
/// `ParseAndEval`'s freshly parsed body). Returns `None` if the expression
/// cannot be fully resolved at lowering time (an unbound `Environment`, a
/// `StackReference`, or a `ParseAndEval` whose encoded value fails to
/// parse).
fn const_eval(expr: &Expression, env: Option<&Value>) -> Option<Value> {
    match expr {
        Expression::Literal(v) => Some(v.clone()),
        Expression::Environment => env.cloned(),
        Expression::StackReference(_) => None,
        Expression::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(const_eval(item, env)?);
            }
            Some(Value::list(values))
        }
        Expression::KernelApplication(id, arg) => Some(kernel::apply(*id, &const_eval(arg, env)?)),
        Expression::Conditional(c, t, f) => {
            let cond = const_eval(c, env)?;
            if cond.is_true() {
                const_eval(t, env)
            } else if cond.is_false() {
                const_eval(f, env)
            } else {
                Some(Value::empty_list())
            }
        }
        Expression::ParseAndEval(enc, e) => {
            let encoded_value = const_eval(enc, env)?;
            let env_value = const_eval(e, env)?;
            let parsed = parse_expression(&encoded_value).ok()?;
            const_eval(&parsed, Some(&env_value))
        }
        Expression::StringTag(_, inner) => const_eval(inner, env),
        Expression::SkipHeadPath(counts, arg) => {
            let mut v = const_eval(arg, env)?;
            for n in counts {
                v = kernel::apply(KernelId::Skip, &Value::list(vec![pine_core::value_from_int(*n), v]));
            }
            Some(kernel::apply(KernelId::Head, &v))
        }
        Expression::EqualTwo(l, r) => {
            let lv = const_eval(l, env)?;
            let rv = const_eval(r, env)?;
            Some(kernel::apply(KernelId::Equal, &Value::list(vec![lv, rv])))
        }
    }
}

// --- Step 2: reduction -----------------------------------------------------

/// Apply local constant-folding rewrites repeatedly until a fixpoint or
/// `depth_bound` passes, whichever comes first.
pub fn reduce(expr: Expression, depth_bound: u32) -> Expression {
    let mut current = expr;
    for _ in 0..depth_bound {
        let next = reduce_once(&current);
        if next == current {
            return next;
        }
        current = next;
    }
    current
}

fn try_fold(expr: Expression) -> Expression {
    if expr.is_environment_free() {
        if let Some(v) = const_eval(&expr, None) {
            return Expression::Literal(v);
        }
    }
    expr
}

fn reduce_once(expr: &Expression) -> Expression {
    match expr {
        Expression::Literal(_) | Expression::Environment | Expression::StackReference(_) => expr.clone(),
        Expression::List(items) => {
            try_fold(Expression::List(items.iter().map(reduce_once).collect()))
        }
        Expression::KernelApplication(id, arg) => {
            try_fold(Expression::KernelApplication(*id, Box::new(reduce_once(arg))))
        }
        Expression::Conditional(c, t, f) => {
            let c_r = reduce_once(c);
            if c_r.is_environment_free() {
                if let Some(v) = const_eval(&c_r, None) {
                    if v.is_true() {
                        return reduce_once(t);
                    }
                    if v.is_false() {
                        return reduce_once(f);
                    }
                    return Expression::Literal(Value::empty_list());
                }
            }
            try_fold(Expression::Conditional(Box::new(c_r), Box::new(reduce_once(t)), Box::new(reduce_once(f))))
        }
        Expression::ParseAndEval(enc, env) => {
            try_fold(Expression::ParseAndEval(Box::new(reduce_once(enc)), Box::new(reduce_once(env))))
        }
        Expression::StringTag(s, inner) => {
            let inner_r = reduce_once(inner);
            if matches!(inner_r, Expression::Literal(_)) {
                inner_r
            } else {
                Expression::StringTag(s.clone(), Box::new(inner_r))
            }
        }
        Expression::SkipHeadPath(counts, arg) => {
            try_fold(Expression::SkipHeadPath(counts.clone(), Box::new(reduce_once(arg))))
        }
        Expression::EqualTwo(l, r) => {
            try_fold(Expression::EqualTwo(Box::new(reduce_once(l)), Box::new(reduce_once(r))))
        }
    }
}

// --- Step 3: ParseAndEval inlining -----------------------------------------

fn inline_parse_and_eval(expr: Expression, stack: &mut Vec<pine_core::ContentHash>, config: &LowerConfig) -> Expression {
    match expr {
        Expression::ParseAndEval(enc, env) => {
            let enc_i = inline_parse_and_eval(*enc, stack, config);
            let env_i = inline_parse_and_eval(*env, stack, config);
            if enc_i.is_environment_free() {
                if let Some(encoded_value) = const_eval(&enc_i, None) {
                    let hash = encoded_value.structural_hash();
                    if !stack.contains(&hash) {
                        if let Ok(parsed) = parse_expression(&encoded_value) {
                            if parsed.subexpression_count() <= config.inline_max_subexprs
                                && parsed.conditional_count() <= config.inline_max_conditionals
                                && parsed.parse_and_eval_count() <= config.inline_max_nested
                            {
                                stack.push(hash);
                                let substituted = substitute_environment(parsed, &env_i);
                                let inlined = inline_parse_and_eval(substituted, stack, config);
                                stack.pop();
                                return inlined;
                            }
                        }
                    }
                }
            }
            Expression::ParseAndEval(Box::new(enc_i), Box::new(env_i))
        }
        Expression::List(items) => {
            Expression::List(items.into_iter().map(|e| inline_parse_and_eval(e, stack, config)).collect())
        }
        Expression::KernelApplication(id, arg) => {
            Expression::KernelApplication(id, Box::new(inline_parse_and_eval(*arg, stack, config)))
        }
        Expression::Conditional(c, t, f) => Expression::Conditional(
            Box::new(inline_parse_and_eval(*c, stack, config)),
            Box::new(inline_parse_and_eval(*t, stack, config)),
            Box::new(inline_parse_and_eval(*f, stack, config)),
        ),
        Expression::StringTag(s, inner) => {
            Expression::StringTag(s, Box::new(inline_parse_and_eval(*inner, stack, config)))
        }
        Expression::SkipHeadPath(counts, arg) => {
            Expression::SkipHeadPath(counts, Box::new(inline_parse_and_eval(*arg, stack, config)))
        }
        Expression::EqualTwo(l, r) => Expression::EqualTwo(
            Box::new(inline_parse_and_eval(*l, stack, config)),
            Box::new(inline_parse_and_eval(*r, stack, config)),
        ),
        other => other,
    }
}

/// Replace every `Environment` occurrence in a freshly parsed expression
/// with the (already-lowered) expression that produced the environment it
/// was parsed against.
fn substitute_environment(expr: Expression, replacement: &Expression) -> Expression {
    match expr {
        Expression::Environment => replacement.clone(),
        Expression::Literal(v) => Expression::Literal(v),
        Expression::List(items) => {
            Expression::List(items.into_iter().map(|e| substitute_environment(e, replacement)).collect())
        }
        Expression::KernelApplication(id, arg) => {
            Expression::KernelApplication(id, Box::new(substitute_environment(*arg, replacement)))
        }
        Expression::Conditional(c, t, f) => Expression::Conditional(
            Box::new(substitute_environment(*c, replacement)),
            Box::new(substitute_environment(*t, replacement)),
            Box::new(substitute_environment(*f, replacement)),
        ),
        Expression::ParseAndEval(enc, env) => Expression::ParseAndEval(
            Box::new(substitute_environment(*enc, replacement)),
            Box::new(substitute_environment(*env, replacement)),
        ),
        Expression::StringTag(s, inner) => {
            Expression::StringTag(s, Box::new(substitute_environment(*inner, replacement)))
        }
        Expression::StackReference(o) => Expression::StackReference(o),
        Expression::SkipHeadPath(counts, arg) => {
            Expression::SkipHeadPath(counts, Box::new(substitute_environment(*arg, replacement)))
        }
        Expression::EqualTwo(l, r) => Expression::EqualTwo(
            Box::new(substitute_environment(*l, replacement)),
            Box::new(substitute_environment(*r, replacement)),
        ),
    }
}

// --- Step 4: peephole fusion ------------------------------------------------

fn fuse(expr: Expression) -> Expression {
    match expr {
        Expression::KernelApplication(KernelId::Head, arg) => {
            let arg_f = fuse(*arg);
            match collect_skip_chain(&arg_f) {
                Some((counts, inner)) => Expression::SkipHeadPath(counts, Box::new(inner)),
                None => Expression::KernelApplication(KernelId::Head, Box::new(arg_f)),
            }
        }
        Expression::KernelApplication(KernelId::Equal, arg) => {
            let arg_f = fuse(*arg);
            if let Expression::List(items) = &arg_f {
                if let [a, b] = items.as_slice() {
                    return Expression::EqualTwo(Box::new(a.clone()), Box::new(b.clone()));
                }
            }
            Expression::KernelApplication(KernelId::Equal, Box::new(arg_f))
        }
        Expression::KernelApplication(id, arg) => Expression::KernelApplication(id, Box::new(fuse(*arg))),
        Expression::List(items) => Expression::List(items.into_iter().map(fuse).collect()),
        Expression::Conditional(c, t, f) => {
            Expression::Conditional(Box::new(fuse(*c)), Box::new(fuse(*t)), Box::new(fuse(*f)))
        }
        Expression::ParseAndEval(enc, env) => {
            Expression::ParseAndEval(Box::new(fuse(*enc)), Box::new(fuse(*env)))
        }
        Expression::StringTag(s, inner) => Expression::StringTag(s, Box::new(fuse(*inner))),
        other => other,
    }
}

/// Recognize `skip(n1, skip(n2, ... skip(nk, base) ...))`, returning the
/// counts in the order they must be applied (innermost first) and the base
/// expression.
fn collect_skip_chain(expr: &Expression) -> Option<(Vec<i64>, Expression)> {
    let Expression::KernelApplication(KernelId::Skip, arg) = expr else {
        return None;
    };
    let Expression::List(items) = arg.as_ref() else {
        return None;
    };
    let [n_expr, inner] = items.as_slice() else {
        return None;
    };
    let Expression::Literal(v) = n_expr else {
        return None;
    };
    let n = pine_core::int_from_value(v).ok()?;
    match collect_skip_chain(inner) {
        Some((mut counts, base)) => {
            counts.push(n);
            Some((counts, base))
        }
        None => Some((vec![n], inner.clone())),
    }
}

// --- Steps 5-7: CSE, imperative-graph construction, emission --------------

/// `true` for expressions worth promoting to their own instruction once
/// they occur more than once: kernel applications, fused forms, string
/// tags, and lists/sub-trees past the configured size threshold.
fn is_large_enough(expr: &Expression, threshold: usize) -> bool {
    match expr {
        Expression::KernelApplication(..)
        | Expression::StringTag(..)
        | Expression::SkipHeadPath(..)
        | Expression::EqualTwo(..) => true,
        _ => expr.subexpression_count() > threshold,
    }
}

fn count_occurrences(expr: &Expression, counts: &mut HashMap<Expression, usize>) {
    *counts.entry(expr.clone()).or_insert(0) += 1;
    match expr {
        Expression::Literal(_) | Expression::Environment | Expression::StackReference(_) => {}
        Expression::List(items) => items.iter().for_each(|i| count_occurrences(i, counts)),
        Expression::KernelApplication(_, arg) => count_occurrences(arg, counts),
        Expression::Conditional(c, t, f) => {
            count_occurrences(c, counts);
            count_occurrences(t, counts);
            count_occurrences(f, counts);
        }
        Expression::ParseAndEval(enc, env) => {
            count_occurrences(enc, counts);
            count_occurrences(env, counts);
        }
        Expression::StringTag(_, inner) => count_occurrences(inner, counts),
        Expression::SkipHeadPath(_, arg) => count_occurrences(arg, counts),
        Expression::EqualTwo(l, r) => {
            count_occurrences(l, counts);
            count_occurrences(r, counts);
        }
    }
}

/// Replace any sub-expression already present in `slots` (a previously
/// emitted CSE promotion or a hoisted conditional's result) with a
/// `StackReference` computed relative to `at_depth`, the number of results
/// that will already sit in the runtime result array by the time the
/// rewritten expression executes. This is *not* the same as the
/// instruction's position in `instrs`: `ConditionalJump`/`Jump` occupy an
/// instruction slot without ever pushing a result, so only a depth counted
/// this way agrees with `resolve_stack_reference`'s `results.len() + offset`.
fn substitute_known_slots(expr: &Expression, slots: &HashMap<Expression, usize>, at_depth: usize) -> Expression {
    if let Some(&slot) = slots.get(expr) {
        return Expression::StackReference((slot as i64 - at_depth as i64) as i32);
    }
    match expr {
        Expression::List(items) => {
            Expression::List(items.iter().map(|i| substitute_known_slots(i, slots, at_depth)).collect())
        }
        Expression::KernelApplication(id, arg) => {
            Expression::KernelApplication(*id, Box::new(substitute_known_slots(arg, slots, at_depth)))
        }
        Expression::StringTag(s, inner) => {
            Expression::StringTag(s.clone(), Box::new(substitute_known_slots(inner, slots, at_depth)))
        }
        Expression::SkipHeadPath(c, arg) => {
            Expression::SkipHeadPath(c.clone(), Box::new(substitute_known_slots(arg, slots, at_depth)))
        }
        Expression::EqualTwo(l, r) => Expression::EqualTwo(
            Box::new(substitute_known_slots(l, slots, at_depth)),
            Box::new(substitute_known_slots(r, slots, at_depth)),
        ),
        Expression::ParseAndEval(enc, env) => Expression::ParseAndEval(
            Box::new(substitute_known_slots(enc, slots, at_depth)),
            Box::new(substitute_known_slots(env, slots, at_depth)),
        ),
        // `Conditional` cannot appear in a region handed to this function:
        // the caller splits conditionals out before CSE ever runs.
        other => other.clone(),
    }
}

/// Emit a conditional-free region: promote repeated "large enough"
/// sub-expressions to their own `Eval` instruction, then emit the root.
/// `depth` is the number of results already on the runtime stack when this
/// region starts executing; returns the depth once it's done, i.e. `depth`
/// plus the number of `Eval` instructions this call pushed.
fn emit_straight_line(
    expr: Expression,
    instrs: &mut Vec<StackInstruction>,
    slots: &mut HashMap<Expression, usize>,
    threshold: usize,
    depth: usize,
) -> usize {
    let mut counts = HashMap::new();
    count_occurrences(&expr, &mut counts);
    let mut promotions: Vec<Expression> = counts
        .into_iter()
        .filter(|(e, n)| *n > 1 && is_large_enough(e, threshold) && !slots.contains_key(e))
        .map(|(e, _)| e)
        .collect();
    promotions.sort_by_key(Expression::subexpression_count);

    let mut depth = depth;
    for promoted in promotions {
        let substituted = substitute_known_slots(&promoted, slots, depth);
        instrs.push(StackInstruction::Eval(substituted));
        slots.insert(promoted, depth);
        depth += 1;
    }
    let final_expr = substitute_known_slots(&expr, slots, depth);
    instrs.push(StackInstruction::Eval(final_expr));
    depth + 1
}

/// Insert `count` filler instructions at absolute instruction index `at`,
/// shifting every already-recorded `Jump`/`ConditionalJump` target at or
/// past `at` to account for them. Used to pad a conditional's shorter
/// branch so both branches (and an invalid condition) leave the same
/// number of results behind, making the gap code after the conditional
/// needs to jump back over a fixed, branch-independent width.
fn insert_padding(instrs: &mut Vec<StackInstruction>, at: usize, count: usize) {
    if count == 0 {
        return;
    }
    for instr in instrs.iter_mut() {
        match instr {
            StackInstruction::Jump(target) if *target >= at => *target += count,
            StackInstruction::ConditionalJump { true_offset, invalid_offset } => {
                if *true_offset >= at {
                    *true_offset += count;
                }
                if *invalid_offset >= at {
                    *invalid_offset += count;
                }
            }
            _ => {}
        }
    }
    let padding = std::iter::repeat(StackInstruction::Eval(Expression::StackReference(-1))).take(count);
    instrs.splice(at..at, padding);
}

/// Emit `if c { t } else { f }` as: the condition, a `ConditionalJump`, the
/// false region followed by a jump past the true region, then the true
/// region falling through to a single shared `CopyLastAssigned`. Every
/// path — true, false, or an invalid (non-boolean) condition — reaches
/// that shared instruction with its result as "last assigned", so code
/// emitted afterwards can always read the branch's result at offset -1.
///
/// The condition's own promotions stay visible to both branches (both
/// always run it first), but the two branches never share CSE state with
/// each other: only one of them runs per call, so a promotion made in one
/// is simply absent from the other's results at run time. Whichever branch
/// is shorter gets padded with harmless filler so that every path — true,
/// false, or invalid — leaves exactly the same number of results behind;
/// that's what lets a fixed offset, computed once here, correctly reach
/// back across the jump from any later point regardless of which path ran.
fn emit_conditional(
    c: Expression,
    t: Expression,
    f: Expression,
    instrs: &mut Vec<StackInstruction>,
    slots: &mut HashMap<Expression, usize>,
    hoist_counter: &mut i32,
    config: &LowerConfig,
    depth: usize,
) -> usize {
    let depth_after_cond = emit_expr(c, instrs, slots, hoist_counter, config, depth);
    let jump_index = instrs.len();
    instrs.push(StackInstruction::ConditionalJump { true_offset: 0, invalid_offset: 0 });

    let mut false_slots = slots.clone();
    let depth_after_false = emit_expr(f, instrs, &mut false_slots, hoist_counter, config, depth_after_cond);
    let mut false_end = instrs.len();

    let mut jump_over_true_index = instrs.len();
    instrs.push(StackInstruction::Jump(0));

    let mut true_offset = instrs.len();
    let mut true_slots = slots.clone();
    let depth_after_true = emit_expr(t, instrs, &mut true_slots, hoist_counter, config, depth_after_cond);
    let mut true_end = instrs.len();

    let false_width = depth_after_false - depth_after_cond;
    let true_width = depth_after_true - depth_after_cond;
    // An invalid (non-boolean) condition contributes exactly one pushed
    // result (the empty list) before reaching the shared copy, so the
    // common width is never less than 1.
    let target_width = false_width.max(true_width).max(1);

    if false_width < target_width {
        let pad = target_width - false_width;
        insert_padding(instrs, false_end, pad);
        false_end += pad;
        jump_over_true_index += pad;
        true_offset += pad;
        true_end += pad;
    }
    if true_width < target_width {
        insert_padding(instrs, true_end, target_width - true_width);
    }

    let shared_copy_index = instrs.len();
    instrs.push(StackInstruction::CopyLastAssigned);

    if let StackInstruction::ConditionalJump { true_offset: to, invalid_offset: io } = &mut instrs[jump_index] {
        *to = true_offset;
        *io = shared_copy_index;
    }
    if let StackInstruction::Jump(target) = &mut instrs[jump_over_true_index] {
        *target = shared_copy_index;
    }

    depth_after_cond + target_width + 1
}

fn next_hoist_marker(hoist_counter: &mut i32) -> Expression {
    *hoist_counter -= 1;
    Expression::StackReference(*hoist_counter)
}

/// Find the first `Conditional` anywhere under `expr` (pre-order), replace
/// it in place with a unique marker, and return `(conditional, marker,
/// rebuilt_expr)`. `None` if `expr` contains no `Conditional`.
fn hoist_first_conditional(expr: Expression, hoist_counter: &mut i32) -> Option<(Expression, Expression, Expression)> {
    if let Expression::Conditional(..) = &expr {
        let marker = next_hoist_marker(hoist_counter);
        return Some((expr, marker.clone(), marker));
    }
    match expr {
        Expression::List(mut items) => {
            for i in 0..items.len() {
                if items[i].conditional_count() > 0 {
                    let (cond, marker, replaced) = hoist_first_conditional(items[i].clone(), hoist_counter)?;
                    items[i] = replaced;
                    return Some((cond, marker, Expression::List(items)));
                }
            }
            None
        }
        Expression::KernelApplication(id, arg) => {
            let (cond, marker, replaced) = hoist_first_conditional(*arg, hoist_counter)?;
            Some((cond, marker, Expression::KernelApplication(id, Box::new(replaced))))
        }
        Expression::StringTag(s, inner) => {
            let (cond, marker, replaced) = hoist_first_conditional(*inner, hoist_counter)?;
            Some((cond, marker, Expression::StringTag(s, Box::new(replaced))))
        }
        Expression::SkipHeadPath(counts, arg) => {
            let (cond, marker, replaced) = hoist_first_conditional(*arg, hoist_counter)?;
            Some((cond, marker, Expression::SkipHeadPath(counts, Box::new(replaced))))
        }
        Expression::EqualTwo(l, r) => {
            if l.conditional_count() > 0 {
                let (cond, marker, replaced) = hoist_first_conditional(*l, hoist_counter)?;
                Some((cond, marker, Expression::EqualTwo(Box::new(replaced), r)))
            } else {
                let (cond, marker, replaced) = hoist_first_conditional(*r, hoist_counter)?;
                Some((cond, marker, Expression::EqualTwo(l, Box::new(replaced))))
            }
        }
        Expression::ParseAndEval(enc, env) => {
            if enc.conditional_count() > 0 {
                let (cond, marker, replaced) = hoist_first_conditional(*enc, hoist_counter)?;
                Some((cond, marker, Expression::ParseAndEval(Box::new(replaced), env)))
            } else {
                let (cond, marker, replaced) = hoist_first_conditional(*env, hoist_counter)?;
                Some((cond, marker, Expression::ParseAndEval(enc, Box::new(replaced))))
            }
        }
        _ => None,
    }
}

fn emit_expr(
    expr: Expression,
    instrs: &mut Vec<StackInstruction>,
    slots: &mut HashMap<Expression, usize>,
    hoist_counter: &mut i32,
    config: &LowerConfig,
    depth: usize,
) -> usize {
    if expr.conditional_count() == 0 {
        return emit_straight_line(expr, instrs, slots, config.cse_size_threshold, depth);
    }
    if let Expression::Conditional(c, t, f) = expr {
        return emit_conditional(*c, *t, *f, instrs, slots, hoist_counter, config, depth);
    }
    let (cond_expr, marker, rebuilt) = hoist_first_conditional(expr, hoist_counter)
        .expect("conditional_count() > 0 implies a Conditional exists to hoist");
    let Expression::Conditional(c, t, f) = cond_expr else {
        unreachable!("hoist_first_conditional always extracts a Conditional");
    };
    let new_depth = emit_conditional(*c, *t, *f, instrs, slots, hoist_counter, config, depth);
    slots.insert(marker, new_depth - 1);
    emit_expr(rebuilt, instrs, slots, hoist_counter, config, new_depth)
}

fn emit(expr: Expression, config: &LowerConfig) -> Vec<StackInstruction> {
    let mut instrs = Vec::new();
    let mut slots = HashMap::new();
    let mut hoist_counter: i32 = 0;
    emit_expr(expr, &mut instrs, &mut slots, &mut hoist_counter, config, 0);
    instrs.push(StackInstruction::Return);
    instrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::EnvFact;
    use pine_core::value_from_int;

    fn has_kernel_eval(instrs: &StackFrameInstructions, id: KernelId) -> bool {
        instrs.iter().any(|i| matches!(i, StackInstruction::Eval(Expression::KernelApplication(k, _)) if *k == id))
    }

    #[test]
    fn reduces_closed_kernel_application_to_a_literal() {
        let expr = Expression::kernel(
            KernelId::AddInt,
            Expression::List(vec![Expression::Literal(value_from_int(2)), Expression::Literal(value_from_int(3))]),
        );
        let reduced = reduce(expr, 10);
        assert_eq!(reduced, Expression::Literal(value_from_int(5)));
    }

    #[test]
    fn conditional_with_closed_condition_collapses_to_the_taken_branch() {
        let expr = Expression::conditional(
            Expression::Literal(Value::from_bool(true)),
            Expression::Environment,
            Expression::Literal(value_from_int(0)),
        );
        let reduced = reduce(expr, 10);
        assert_eq!(reduced, Expression::Environment);
    }

    #[test]
    fn head_after_skip_fuses_to_skip_head_path() {
        let expr = Expression::kernel(
            KernelId::Head,
            Expression::kernel(
                KernelId::Skip,
                Expression::List(vec![Expression::Literal(value_from_int(2)), Expression::Environment]),
            ),
        );
        let fused = fuse(expr);
        assert_eq!(fused, Expression::SkipHeadPath(vec![2], Box::new(Expression::Environment)));

        let lowered = lower(&fused, None, &LowerConfig::default());
        assert_eq!(lowered.len(), 2);
        assert!(matches!(lowered.get(0), Some(StackInstruction::Eval(Expression::SkipHeadPath(..)))));
        assert!(matches!(lowered.get(1), Some(StackInstruction::Return)));
    }

    #[test]
    fn substitution_folds_a_bound_environment_path_to_a_literal() {
        let constraint = EnvConstraintId::new(vec![EnvFact::new(vec![0], value_from_int(7))]);
        let expr = Expression::kernel(KernelId::Head, Expression::Environment);
        let lowered = lower(&expr, Some(&constraint), &LowerConfig::default());
        assert_eq!(lowered.len(), 2);
        assert_eq!(lowered.get(0), Some(&StackInstruction::Eval(Expression::Literal(value_from_int(7)))));
    }

    #[test]
    fn top_level_conditional_emits_a_single_shared_continuation() {
        let expr = Expression::conditional(
            Expression::kernel(KernelId::IsSortedAscendingInt, Expression::Environment),
            Expression::Literal(value_from_int(1)),
            Expression::Literal(value_from_int(0)),
        );
        let lowered = lower(&expr, None, &LowerConfig::default());
        let copies = lowered.count_matching(|i| matches!(i, StackInstruction::CopyLastAssigned));
        assert_eq!(copies, 1);
        assert!(matches!(lowered.get(lowered.len() - 1), Some(StackInstruction::Return)));
    }

    #[test]
    fn cse_promotes_a_repeated_kernel_application() {
        let repeated = Expression::kernel(KernelId::Reverse, Expression::Environment);
        let expr = Expression::List(vec![repeated.clone(), repeated]);
        let lowered = lower(&expr, None, &LowerConfig::default());
        assert_eq!(has_kernel_eval(&lowered, KernelId::Reverse) as usize, 1);
    }

    #[test]
    fn conditional_sharing_a_cse_candidate_with_its_true_branch_still_agrees_with_direct_evaluation() {
        // condition and true branch both mention `reverse(Env)`, so CSE
        // inside the condition region must not leak a stale reference into
        // the true branch (the promoted value never runs there).
        let reverse_env = Expression::kernel(KernelId::Reverse, Expression::Environment);
        let condition = Expression::kernel(
            KernelId::Equal,
            Expression::List(vec![reverse_env.clone(), reverse_env.clone()]),
        );
        let expr = Expression::conditional(condition, reverse_env, Expression::Literal(value_from_int(0)));

        let env = Value::list(vec![value_from_int(1), value_from_int(2), value_from_int(3)]);
        let direct = crate::eval::evaluate(&expr, &env, &crate::eval::EvaluateConfig::default()).unwrap();

        let lowered = lower(&expr, None, &LowerConfig::default());
        let via_instructions =
            crate::eval::run_instructions(&lowered, &env, &crate::eval::EvaluateConfig::default()).unwrap();

        assert_eq!(direct, via_instructions);
        assert_eq!(direct, Value::list(vec![value_from_int(3), value_from_int(2), value_from_int(1)]));
    }

    #[test]
    fn closed_parse_and_eval_inlines_away() {
        let inner = Expression::kernel(KernelId::Length, Expression::Environment);
        let encoded = crate::expr::encode_expression(&inner);
        let expr = Expression::parse_and_eval(
            Expression::Literal(encoded),
            Expression::Literal(Value::list(vec![value_from_int(1), value_from_int(2)])),
        );
        let lowered = lower(&expr, None, &LowerConfig::default());
        // Fully closed: folds all the way down to a literal 2.
        assert_eq!(lowered.get(0), Some(&StackInstruction::Eval(Expression::Literal(value_from_int(2)))));
    }
}
