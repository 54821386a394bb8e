//! Concrete end-to-end scenarios (§8): each drives the engine through its
//! public surface only, the way a host embedding this crate would.

use pine_vm::{
    EvaluateConfig, Expression, KernelId, PgoAnalyzer, PgoConfig, StackInstruction, Vm, build_compilation,
    encode_expression, evaluate, int_from_value, parse_expression, value_from_int,
};
use pine_core::Value;

fn int(n: i64) -> Value {
    value_from_int(n)
}

#[test]
fn boolean_negation_via_kernels() {
    let expr = Expression::conditional(
        Expression::Literal(Value::from_bool(true)),
        Expression::Literal(Value::empty_list()),
        Expression::Literal(Value::list(vec![Value::empty_list()])),
    );
    let vm = Vm::new();
    let encoded = encode_expression(&expr);
    let report = vm.evaluate(&encoded, &int(999)).unwrap();
    assert_eq!(report.return_value, Value::empty_list());
}

#[test]
fn integer_addition() {
    let expr = Expression::kernel(
        KernelId::AddInt,
        Expression::Literal(Value::list(vec![int(2), int(3), int(-1)])),
    );
    let vm = Vm::new();
    let encoded = encode_expression(&expr);
    let report = vm.evaluate(&encoded, &Value::empty_list()).unwrap();
    assert_eq!(report.return_value, int(4));
}

#[test]
fn head_after_skip_fuses_and_evaluates() {
    let expr = Expression::kernel(
        KernelId::Head,
        Expression::kernel(
            KernelId::Skip,
            Expression::List(vec![Expression::Literal(int(2)), Expression::Environment]),
        ),
    );
    let env = Value::list(vec![int(10), int(20), int(30), int(40)]);

    let direct = evaluate(&expr, &env, &EvaluateConfig::default()).unwrap();
    assert_eq!(direct, int(30));

    let compilation = build_compilation(&expr, &[], &Default::default());
    let instructions = compilation.generic();
    let skip_head_evals = instructions.count_matching(|i| {
        matches!(i, StackInstruction::Eval(Expression::SkipHeadPath(..)))
    });
    assert_eq!(skip_head_evals, 1);
    let any_raw_skip_or_head = instructions.iter().any(|i| {
        matches!(
            i,
            StackInstruction::Eval(Expression::KernelApplication(KernelId::Skip | KernelId::Head, _))
        )
    });
    assert!(!any_raw_skip_or_head);
}

#[test]
fn self_interpretation_is_an_identity() {
    // id = encode_expression(ParseAndEval(Environment, Literal([]))): a
    // program that treats its own environment as an encoded expression and
    // evaluates it against an empty environment.
    let id_expr = Expression::parse_and_eval(Expression::Environment, Expression::Literal(Value::empty_list()));
    let id = encode_expression(&id_expr);

    // env0 is itself a valid encoded expression, since `id_expr` is going
    // to hand it to `parse_expression`.
    let env0 = encode_expression(&Expression::Literal(int(42)));

    let direct = evaluate(&id_expr, &env0, &EvaluateConfig::default()).unwrap();
    assert_eq!(direct, int(42));

    let wrapped = Expression::parse_and_eval(Expression::Literal(id), Expression::Literal(env0));
    // Any outer env: `wrapped`'s own enc/env sub-expressions are both
    // literals, so the outer environment never factors in.
    for outer_env in [int(0), Value::empty_list(), Value::list(vec![int(1), int(2)])] {
        let via_self_interpretation = evaluate(&wrapped, &outer_env, &EvaluateConfig::default()).unwrap();
        assert_eq!(direct, via_self_interpretation);
    }
}

/// Count `KernelApplication` nodes anywhere under an expression embedded in
/// a lowered `Eval` instruction (the specialized paths below are expected
/// to fold all the way down to a bare literal, i.e. zero).
fn count_kernel_applications(expr: &Expression) -> usize {
    match expr {
        Expression::Literal(_) | Expression::Environment | Expression::StackReference(_) => 0,
        Expression::List(items) => items.iter().map(count_kernel_applications).sum(),
        Expression::KernelApplication(_, arg) => 1 + count_kernel_applications(arg),
        Expression::Conditional(c, t, f) => {
            count_kernel_applications(c) + count_kernel_applications(t) + count_kernel_applications(f)
        }
        Expression::ParseAndEval(enc, env) => count_kernel_applications(enc) + count_kernel_applications(env),
        Expression::StringTag(_, inner) => count_kernel_applications(inner),
        Expression::SkipHeadPath(_, arg) => 1 + count_kernel_applications(arg),
        Expression::EqualTwo(l, r) => 1 + count_kernel_applications(l) + count_kernel_applications(r),
    }
}

fn total_kernel_applications(instructions: &pine_vm::StackFrameInstructions) -> usize {
    instructions
        .iter()
        .map(|i| match i {
            StackInstruction::Eval(e) => count_kernel_applications(e),
            _ => 0,
        })
        .sum()
}

#[test]
fn pgo_specialization_reduces_kernel_invocations() {
    // env = [record, fieldId]; record = [41, 47]; fieldId selects into it.
    let record_path = Expression::kernel(KernelId::Head, Expression::Environment);
    let field_id_path = Expression::kernel(
        KernelId::Head,
        Expression::kernel(KernelId::Skip, Expression::List(vec![Expression::Literal(int(1)), Expression::Environment])),
    );
    let expr = Expression::kernel(
        KernelId::Head,
        Expression::kernel(KernelId::Skip, Expression::List(vec![field_id_path, record_path])),
    );

    let analyzer = PgoAnalyzer::new(PgoConfig { class_usage_count_min: 2, ..PgoConfig::default() });
    let record = Value::list(vec![int(41), int(47)]);
    for i in 0..12 {
        let field_id = i % 2;
        let env = Value::list(vec![record.clone(), int(field_id)]);
        analyzer.record(&expr, &env);
    }

    let constraints = analyzer.constraints_for(&expr);
    assert_eq!(constraints.len(), 2);

    let compilation = build_compilation(&expr, &constraints, &Default::default());
    assert_eq!(compilation.specializations().len(), 2);

    let generic_kernel_calls = total_kernel_applications(compilation.generic());
    assert!(generic_kernel_calls > 1, "the unconstrained lowering still has to head/skip at run time");

    let env_zero = Value::list(vec![record.clone(), int(0)]);
    let env_one = Value::list(vec![record.clone(), int(1)]);
    for env in [&env_zero, &env_one] {
        let specialized = compilation.select_for_environment(env);
        assert_ne!(specialized, compilation.generic());
        let specialized_kernel_calls = total_kernel_applications(specialized);
        assert!(
            specialized_kernel_calls <= 1,
            "a specialized lowering should reduce to a constant with at most one kernel invocation"
        );
        assert!(specialized_kernel_calls < generic_kernel_calls);

        let expected = evaluate(&expr, env, &EvaluateConfig::default()).unwrap();
        let via_specialization = pine_vm::run_instructions(specialized, env, &EvaluateConfig::default()).unwrap();
        assert_eq!(expected, via_specialization);
    }
    assert_eq!(evaluate(&expr, &env_zero, &EvaluateConfig::default()).unwrap(), int(41));
    assert_eq!(evaluate(&expr, &env_one, &EvaluateConfig::default()).unwrap(), int(47));
}

#[test]
fn parse_and_eval_count_limit_enforced_at_exactly_observed_plus_one() {
    // A self-recursive program: parse_and_eval(self, env) forever.
    let recursive = Expression::parse_and_eval(Expression::Environment, Expression::Environment);
    let encoded = encode_expression(&recursive);
    let env = encoded.clone();

    let config = EvaluateConfig { parse_and_eval_count_limit: 10 };
    let parsed = parse_expression(&env).unwrap();
    let err = evaluate(&parsed, &env, &config).unwrap_err();
    assert_eq!(err, pine_vm::ErrorKind::LimitExceeded { limit: 10, observed: 11 });
}

#[test]
fn lowering_soundness_holds_for_matching_and_non_matching_environments() {
    let expr = Expression::kernel(KernelId::Head, Expression::Environment);
    let constraint = pine_vm::EnvConstraintId::new(vec![pine_vm::EnvFact::new(vec![0], int(7))]);
    let compilation = build_compilation(&expr, &[constraint], &Default::default());

    let matching_env = Value::list(vec![int(7), int(100)]);
    let non_matching_env = Value::list(vec![int(3), int(100)]);

    let config = EvaluateConfig::default();
    for env in [&matching_env, &non_matching_env] {
        let direct = evaluate(&expr, env, &config).unwrap();
        let via_compilation = pine_vm::run_instructions(compilation.select_for_environment(env), env, &config).unwrap();
        assert_eq!(direct, via_compilation);
    }
    assert_eq!(int_from_value(&evaluate(&expr, &matching_env, &config).unwrap()).unwrap(), 7);
}
