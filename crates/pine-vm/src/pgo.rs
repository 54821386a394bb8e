//! Profile-guided specialization (§4.6): turn repeated observed
//! environment shapes into `EnvConstraintId`s the lowerer can specialize
//! against.
//!
//! Observation is decoupled from frame execution entirely: for a given
//! expression we statically know which sub-expressions are fixed
//! environment-navigation paths (`Expression::as_environment_path`), so
//! recording a sample is just navigating the environment by each such path
//! and remembering what came back.

use crate::constraint::{EnvConstraintId, EnvFact};
use crate::expr::Expression;
use pine_core::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// One observed environment's facts for a given expression: the value
/// found at every statically-known environment path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    pub facts: Vec<(Vec<usize>, Value)>,
}

fn collect_environment_paths(expr: &Expression, out: &mut Vec<Vec<usize>>) {
    if let Some(path) = expr.as_environment_path() {
        out.push(path);
        return;
    }
    match expr {
        Expression::Literal(_) | Expression::Environment | Expression::StackReference(_) => {}
        Expression::List(items) => items.iter().for_each(|i| collect_environment_paths(i, out)),
        Expression::KernelApplication(_, arg) => collect_environment_paths(arg, out),
        Expression::Conditional(c, t, f) => {
            collect_environment_paths(c, out);
            collect_environment_paths(t, out);
            collect_environment_paths(f, out);
        }
        Expression::ParseAndEval(enc, env) => {
            collect_environment_paths(enc, out);
            collect_environment_paths(env, out);
        }
        Expression::StringTag(_, inner) => collect_environment_paths(inner, out),
        Expression::SkipHeadPath(_, arg) => collect_environment_paths(arg, out),
        Expression::EqualTwo(l, r) => {
            collect_environment_paths(l, out);
            collect_environment_paths(r, out);
        }
    }
}

/// Sample one `(expr, env)` evaluation: the value found at every
/// statically-known environment path under `expr`.
pub fn observe(expr: &Expression, env: &Value) -> FrameReport {
    let mut paths = Vec::new();
    collect_environment_paths(expr, &mut paths);
    let facts = paths.into_iter().filter_map(|p| env.navigate(&p).map(|v| (p, v))).collect();
    FrameReport { facts }
}

/// Tuning knobs for turning accumulated `FrameReport`s into constraints
/// (§4.6, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgoConfig {
    /// A distinct fact-set must be observed at least this many times to
    /// become a specialization candidate.
    pub class_usage_count_min: usize,
    /// At most this many specializations are kept per expression.
    pub limit_classes_per_expression: usize,
    /// At most this many samples are retained per expression; further
    /// samples are dropped once the cap is reached.
    pub limit_sample_count_per_expression: usize,
}

impl Default for PgoConfig {
    fn default() -> PgoConfig {
        PgoConfig { class_usage_count_min: 2, limit_classes_per_expression: 8, limit_sample_count_per_expression: 1000 }
    }
}

/// Accumulates `FrameReport`s per expression and derives ordered,
/// most-specific-first `EnvConstraintId` lists. Safe for concurrent
/// readers and occasional writers; recording is idempotent under
/// concurrent calls (each sample is independently appended).
pub struct PgoAnalyzer {
    config: PgoConfig,
    reports: Mutex<HashMap<Expression, Vec<FrameReport>>>,
}

impl PgoAnalyzer {
    pub fn new(config: PgoConfig) -> PgoAnalyzer {
        PgoAnalyzer { config, reports: Mutex::new(HashMap::new()) }
    }

    /// Record one observed evaluation of `expr` against `env`.
    pub fn record(&self, expr: &Expression, env: &Value) {
        let report = observe(expr, env);
        if report.facts.is_empty() {
            return;
        }
        let mut guard = self.reports.lock().expect("pgo reports lock poisoned");
        let entry = guard.entry(expr.clone()).or_default();
        if entry.len() < self.config.limit_sample_count_per_expression {
            entry.push(report);
        }
    }

    /// Derive the current ordered (most-specific-first) constraint list
    /// for `expr` from everything recorded so far.
    pub fn constraints_for(&self, expr: &Expression) -> Vec<EnvConstraintId> {
        let guard = self.reports.lock().expect("pgo reports lock poisoned");
        let Some(reports) = guard.get(expr) else {
            return Vec::new();
        };

        let mut counts: HashMap<EnvConstraintId, usize> = HashMap::new();
        for report in reports {
            let facts = report.facts.iter().map(|(p, v)| EnvFact::new(p.clone(), v.clone())).collect();
            let id = EnvConstraintId::new(facts);
            *counts.entry(id).or_insert(0) += 1;
        }

        let mut classes: Vec<(EnvConstraintId, usize)> =
            counts.into_iter().filter(|(_, n)| *n >= self.config.class_usage_count_min).collect();
        classes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(b.1.cmp(&a.1)));
        classes.truncate(self.config.limit_classes_per_expression);
        classes.into_iter().map(|(c, _)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelId;
    use pine_core::value_from_int;

    #[test]
    fn observe_collects_values_at_every_environment_path() {
        let expr = Expression::List(vec![
            Expression::kernel(KernelId::Head, Expression::Environment),
            Expression::kernel(
                KernelId::Head,
                Expression::kernel(
                    KernelId::Skip,
                    Expression::List(vec![Expression::Literal(value_from_int(1)), Expression::Environment]),
                ),
            ),
        ]);
        let env = Value::list(vec![value_from_int(10), value_from_int(20)]);
        let report = observe(&expr, &env);
        assert_eq!(
            report.facts,
            vec![(vec![0], value_from_int(10)), (vec![1], value_from_int(20))]
        );
    }

    #[test]
    fn repeated_shape_becomes_a_specialization_after_the_usage_threshold() {
        let expr = Expression::kernel(KernelId::Head, Expression::Environment);
        let analyzer = PgoAnalyzer::new(PgoConfig { class_usage_count_min: 2, ..PgoConfig::default() });
        assert!(analyzer.constraints_for(&expr).is_empty());

        let env = Value::list(vec![value_from_int(7)]);
        analyzer.record(&expr, &env);
        assert!(analyzer.constraints_for(&expr).is_empty());
        analyzer.record(&expr, &env);

        let constraints = analyzer.constraints_for(&expr);
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].binding_for(&[0]), Some(&value_from_int(7)));
    }

    #[test]
    fn distinct_environment_shapes_do_not_reach_the_threshold_alone() {
        let expr = Expression::kernel(KernelId::Head, Expression::Environment);
        let analyzer = PgoAnalyzer::new(PgoConfig { class_usage_count_min: 2, ..PgoConfig::default() });
        analyzer.record(&expr, &Value::list(vec![value_from_int(1)]));
        analyzer.record(&expr, &Value::list(vec![value_from_int(2)]));
        assert!(analyzer.constraints_for(&expr).is_empty());
    }
}
