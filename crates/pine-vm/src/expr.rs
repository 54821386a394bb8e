//! The Pine IR: a closed, tagged union of pure, total expression variants
//! (§3), plus the interpreter-internal variants introduced only by the
//! lowerer (`StackReference`, `SkipHeadPath`, `EqualTwo`).
//!
//! Every variant has a canonical two-element `[tag_name, body]` encoding
//! as a `Value` (§4.1). The decoder only recognizes the seven public
//! tags: the internal variants are never accepted from an encoded value,
//! which is what keeps `ParseAndEval` from ever smuggling a raw stack
//! reference or fused kernel form into a program.

use crate::error::{ErrorKind, summarize_value};
use crate::kernel::KernelId;
use pine_core::{Value, string_from_value, value_from_int, value_from_string};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expression {
    Literal(Value),
    List(Vec<Expression>),
    Environment,
    KernelApplication(KernelId, Box<Expression>),
    Conditional(Box<Expression>, Box<Expression>, Box<Expression>),
    ParseAndEval(Box<Expression>, Box<Expression>),
    StringTag(String, Box<Expression>),

    /// A negative offset into the current frame's array of
    /// already-computed instruction results. Introduced only by CSE.
    StackReference(i32),
    /// Fusion of a chain of `skip` calls followed by `head`, applied in
    /// order to the value produced by `arg`.
    SkipHeadPath(Vec<i64>, Box<Expression>),
    /// Fusion of `equal` applied to a freshly built two-element list.
    EqualTwo(Box<Expression>, Box<Expression>),
}

impl Expression {
    pub fn kernel(id: KernelId, arg: Expression) -> Expression {
        Expression::KernelApplication(id, Box::new(arg))
    }

    pub fn conditional(cond: Expression, if_true: Expression, if_false: Expression) -> Expression {
        Expression::Conditional(Box::new(cond), Box::new(if_true), Box::new(if_false))
    }

    pub fn parse_and_eval(encoded: Expression, env: Expression) -> Expression {
        Expression::ParseAndEval(Box::new(encoded), Box::new(env))
    }

    /// `true` for one of the seven variants an external producer may
    /// construct; `false` for lowerer-internal variants.
    pub fn is_surface(&self) -> bool {
        !matches!(
            self,
            Expression::StackReference(_) | Expression::SkipHeadPath(..) | Expression::EqualTwo(..)
        )
    }

    /// `true` iff this sub-expression (and everything under it) contains
    /// no `Environment` occurrence — the lowerer's constant-foldability
    /// test.
    pub fn is_environment_free(&self) -> bool {
        match self {
            Expression::Literal(_) | Expression::StackReference(_) => true,
            Expression::Environment => false,
            Expression::List(items) => items.iter().all(Expression::is_environment_free),
            Expression::KernelApplication(_, arg) => arg.is_environment_free(),
            Expression::Conditional(c, t, f) => {
                c.is_environment_free() && t.is_environment_free() && f.is_environment_free()
            }
            Expression::ParseAndEval(enc, env) => enc.is_environment_free() && env.is_environment_free(),
            Expression::StringTag(_, inner) => inner.is_environment_free(),
            Expression::SkipHeadPath(_, arg) => arg.is_environment_free(),
            Expression::EqualTwo(l, r) => l.is_environment_free() && r.is_environment_free(),
        }
    }

    /// Count of this expression plus every sub-expression under it.
    pub fn subexpression_count(&self) -> usize {
        1 + match self {
            Expression::Literal(_) | Expression::Environment | Expression::StackReference(_) => 0,
            Expression::List(items) => items.iter().map(Expression::subexpression_count).sum(),
            Expression::KernelApplication(_, arg) => arg.subexpression_count(),
            Expression::Conditional(c, t, f) => {
                c.subexpression_count() + t.subexpression_count() + f.subexpression_count()
            }
            Expression::ParseAndEval(enc, env) => enc.subexpression_count() + env.subexpression_count(),
            Expression::StringTag(_, inner) => inner.subexpression_count(),
            Expression::SkipHeadPath(_, arg) => arg.subexpression_count(),
            Expression::EqualTwo(l, r) => l.subexpression_count() + r.subexpression_count(),
        }
    }

    /// Count of `Conditional` nodes anywhere under (and including) this
    /// expression. Used by the inlining guard (§4.3).
    pub fn conditional_count(&self) -> usize {
        match self {
            Expression::Conditional(c, t, f) => {
                1 + c.conditional_count() + t.conditional_count() + f.conditional_count()
            }
            Expression::Literal(_) | Expression::Environment | Expression::StackReference(_) => 0,
            Expression::List(items) => items.iter().map(Expression::conditional_count).sum(),
            Expression::KernelApplication(_, arg) => arg.conditional_count(),
            Expression::ParseAndEval(enc, env) => enc.conditional_count() + env.conditional_count(),
            Expression::StringTag(_, inner) => inner.conditional_count(),
            Expression::SkipHeadPath(_, arg) => arg.conditional_count(),
            Expression::EqualTwo(l, r) => l.conditional_count() + r.conditional_count(),
        }
    }

    /// Count of `ParseAndEval` nodes anywhere under (and including) this
    /// expression.
    pub fn parse_and_eval_count(&self) -> usize {
        match self {
            Expression::ParseAndEval(enc, env) => {
                1 + enc.parse_and_eval_count() + env.parse_and_eval_count()
            }
            Expression::Literal(_) | Expression::Environment | Expression::StackReference(_) => 0,
            Expression::List(items) => items.iter().map(Expression::parse_and_eval_count).sum(),
            Expression::KernelApplication(_, arg) => arg.parse_and_eval_count(),
            Expression::Conditional(c, t, f) => {
                c.parse_and_eval_count() + t.parse_and_eval_count() + f.parse_and_eval_count()
            }
            Expression::StringTag(_, inner) => inner.parse_and_eval_count(),
            Expression::SkipHeadPath(_, arg) => arg.parse_and_eval_count(),
            Expression::EqualTwo(l, r) => l.parse_and_eval_count() + r.parse_and_eval_count(),
        }
    }

    /// If this expression is exactly "navigate the environment by a fixed
    /// path of list indices" (possibly zero steps), return that path.
    ///
    /// `skip` slices off a prefix of a list (§4.2), so a chain of skips
    /// folds to a single flat offset (`skip(a, skip(b, v)) == skip(a+b, v)`)
    /// rather than a further level of nested navigation; only a `head`
    /// whose argument bottoms out at something other than a skip chain
    /// over `Environment` (i.e. another environment-path expression)
    /// contributes an additional path element.
    pub fn as_environment_path(&self) -> Option<Vec<usize>> {
        match self {
            Expression::Environment => Some(Vec::new()),
            Expression::KernelApplication(KernelId::Head, arg) => {
                let (skip_sum, mut path) = decompose_skip_chain(arg)?;
                path.push(skip_sum);
                Some(path)
            }
            _ => None,
        }
    }
}

/// Strip any chain of `skip(n, ...)` wrappers off `expr`, returning the
/// sum of their counts alongside the environment path of whatever base
/// expression the chain bottoms out at (`Environment` contributes the
/// empty path).
fn decompose_skip_chain(expr: &Expression) -> Option<(usize, Vec<usize>)> {
    match expr {
        Expression::KernelApplication(KernelId::Skip, arg) => {
            let items = match arg.as_ref() {
                Expression::List(items) if items.len() == 2 => items,
                _ => return None,
            };
            let n = match &items[0] {
                Expression::Literal(v) => usize::try_from(pine_core::int_from_value(v).ok()?).ok()?,
                _ => return None,
            };
            let (inner_sum, path) = decompose_skip_chain(&items[1])?;
            Some((n.checked_add(inner_sum)?, path))
        }
        other => Some((0, other.as_environment_path()?)),
    }
}

fn tag(name: &str, body: Value) -> Value {
    Value::list(vec![value_from_string(name), body])
}

fn field(name: &str, value: Value) -> Value {
    Value::list(vec![value_from_string(name), value])
}

/// Encode an `Expression` as its canonical `Value` tree.
pub fn encode_expression(expr: &Expression) -> Value {
    match expr {
        Expression::Literal(v) => tag("Literal", v.clone()),
        Expression::List(items) => {
            tag("List", Value::list(items.iter().map(encode_expression).collect::<Vec<_>>()))
        }
        Expression::Environment => tag("Environment", Value::empty_list()),
        Expression::KernelApplication(id, arg) => tag(
            "KernelApplication",
            Value::list(vec![field("name", value_from_string(id.name())), field("arg", encode_expression(arg))]),
        ),
        Expression::Conditional(c, t, f) => tag(
            "Conditional",
            Value::list(vec![encode_expression(c), encode_expression(t), encode_expression(f)]),
        ),
        Expression::ParseAndEval(encoded, env) => tag(
            "ParseAndEval",
            Value::list(vec![field("encoded", encode_expression(encoded)), field("env", encode_expression(env))]),
        ),
        Expression::StringTag(s, inner) => {
            tag("StringTag", Value::list(vec![value_from_string(s), encode_expression(inner)]))
        }
        Expression::StackReference(offset) => tag("$StackReference", value_from_int(i64::from(*offset))),
        Expression::SkipHeadPath(counts, arg) => tag(
            "$SkipHeadPath",
            Value::list(vec![
                Value::list(counts.iter().map(|n| value_from_int(*n)).collect::<Vec<_>>()),
                encode_expression(arg),
            ]),
        ),
        Expression::EqualTwo(l, r) => {
            tag("$EqualTwo", Value::list(vec![encode_expression(l), encode_expression(r)]))
        }
    }
}

fn parse_err(reason: impl Into<String>, value: &Value) -> ErrorKind {
    ErrorKind::ParseExpressionError { reason: reason.into(), offending_value_summary: summarize_value(value) }
}

fn decode_fields(body: &Value) -> Result<HashMap<String, Value>, ErrorKind> {
    let items = body.as_list().ok_or_else(|| parse_err("expected a list of [field, value] pairs", body))?;
    let mut fields = HashMap::new();
    for item in items {
        let pair = item.as_list().ok_or_else(|| parse_err("expected a [field_name, value] pair", item))?;
        let [name_value, value] = pair else {
            return Err(parse_err("field pair must have exactly 2 elements", item));
        };
        let name = string_from_value(name_value)
            .map_err(|e| parse_err(format!("field name is not a string ({e})"), item))?;
        if fields.insert(name.clone(), value.clone()).is_some() {
            return Err(parse_err(format!("duplicate field '{name}'"), item));
        }
    }
    Ok(fields)
}

fn expect_fields(fields: &HashMap<String, Value>, expected: &[&str], body: &Value) -> Result<(), ErrorKind> {
    for key in fields.keys() {
        if !expected.contains(&key.as_str()) {
            return Err(parse_err(format!("unknown field '{key}'"), body));
        }
    }
    for required in expected {
        if !fields.contains_key(*required) {
            return Err(parse_err(format!("missing field '{required}'"), body));
        }
    }
    Ok(())
}

/// Decode an `Expression` from its canonical `Value` encoding. Rejects
/// unknown tags and unknown fields; never produces an internal variant.
pub fn parse_expression(value: &Value) -> Result<Expression, ErrorKind> {
    let items = value.as_list().ok_or_else(|| parse_err("expected a [tag, body] list", value))?;
    let [tag_value, body] = items else {
        return Err(parse_err("expected exactly 2 elements", value));
    };
    let tag_name =
        string_from_value(tag_value).map_err(|e| parse_err(format!("tag is not a string ({e})"), value))?;

    match tag_name.as_str() {
        "Literal" => Ok(Expression::Literal(body.clone())),
        "List" => {
            let items = body.as_list().ok_or_else(|| parse_err("List body must be a list", body))?;
            let parsed = items.iter().map(parse_expression).collect::<Result<Vec<_>, _>>()?;
            Ok(Expression::List(parsed))
        }
        "Environment" => Ok(Expression::Environment),
        "KernelApplication" => {
            let fields = decode_fields(body)?;
            expect_fields(&fields, &["name", "arg"], body)?;
            let name = string_from_value(&fields["name"])
                .map_err(|e| parse_err(format!("kernel name is not a string ({e})"), body))?;
            let id = KernelId::parse(&name).ok_or_else(|| ErrorKind::UnknownKernel { name: name.clone() })?;
            let arg = parse_expression(&fields["arg"])?;
            Ok(Expression::KernelApplication(id, Box::new(arg)))
        }
        "Conditional" => {
            let items = body.as_list().ok_or_else(|| parse_err("Conditional body must be a list", body))?;
            let [c, t, f] = items else {
                return Err(parse_err("Conditional body must have exactly 3 elements", body));
            };
            Ok(Expression::Conditional(
                Box::new(parse_expression(c)?),
                Box::new(parse_expression(t)?),
                Box::new(parse_expression(f)?),
            ))
        }
        "ParseAndEval" => {
            let fields = decode_fields(body)?;
            expect_fields(&fields, &["encoded", "env"], body)?;
            let encoded = parse_expression(&fields["encoded"])?;
            let env = parse_expression(&fields["env"])?;
            Ok(Expression::ParseAndEval(Box::new(encoded), Box::new(env)))
        }
        "StringTag" => {
            let items = body.as_list().ok_or_else(|| parse_err("StringTag body must be a list", body))?;
            let [tag_str_value, inner] = items else {
                return Err(parse_err("StringTag body must have exactly 2 elements", body));
            };
            let tag_str = string_from_value(tag_str_value)
                .map_err(|e| parse_err(format!("tag is not a string ({e})"), body))?;
            Ok(Expression::StringTag(tag_str, Box::new(parse_expression(inner)?)))
        }
        other => Err(parse_err(format!("unknown expression tag '{other}'"), value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_surface_variant() {
        let examples = vec![
            Expression::Literal(value_from_int(5)),
            Expression::List(vec![Expression::Literal(value_from_int(1)), Expression::Environment]),
            Expression::Environment,
            Expression::kernel(KernelId::Head, Expression::Environment),
            Expression::conditional(
                Expression::Literal(Value::from_bool(true)),
                Expression::Literal(value_from_int(1)),
                Expression::Literal(value_from_int(2)),
            ),
            Expression::parse_and_eval(Expression::Environment, Expression::Literal(Value::empty_list())),
            Expression::StringTag("diag".to_string(), Box::new(Expression::Environment)),
        ];
        for expr in examples {
            let encoded = encode_expression(&expr);
            assert_eq!(parse_expression(&encoded), Ok(expr));
        }
    }

    #[test]
    fn field_order_does_not_matter() {
        let manual = Value::list(vec![
            value_from_string("KernelApplication"),
            Value::list(vec![
                field("arg", encode_expression(&Expression::Environment)),
                field("name", value_from_string("length")),
            ]),
        ]);
        assert_eq!(
            parse_expression(&manual),
            Ok(Expression::kernel(KernelId::Length, Expression::Environment))
        );
    }

    #[test]
    fn rejects_unknown_tag_and_unknown_field() {
        let unknown_tag = Value::list(vec![value_from_string("Bogus"), Value::empty_list()]);
        assert!(parse_expression(&unknown_tag).is_err());

        let unknown_field = Value::list(vec![
            value_from_string("KernelApplication"),
            Value::list(vec![
                field("name", value_from_string("length")),
                field("arg", encode_expression(&Expression::Environment)),
                field("extra", Value::empty_list()),
            ]),
        ]);
        assert!(parse_expression(&unknown_field).is_err());
    }

    #[test]
    fn rejects_unknown_kernel_name_at_parse_time() {
        let encoded = Value::list(vec![
            value_from_string("KernelApplication"),
            Value::list(vec![
                field("name", value_from_string("does-not-exist")),
                field("arg", encode_expression(&Expression::Environment)),
            ]),
        ]);
        assert_eq!(
            parse_expression(&encoded),
            Err(ErrorKind::UnknownKernel { name: "does-not-exist".to_string() })
        );
    }

    #[test]
    fn internal_variants_never_parse_from_external_values() {
        let internal = Expression::StackReference(-1);
        let encoded = encode_expression(&internal);
        assert!(parse_expression(&encoded).is_err());
    }

    fn skip(n: i64, inner: Expression) -> Expression {
        Expression::kernel(KernelId::Skip, Expression::List(vec![Expression::Literal(value_from_int(n)), inner]))
    }

    #[test]
    fn environment_path_recognition() {
        assert_eq!(Expression::Environment.as_environment_path(), Some(vec![]));

        let single_skip = Expression::kernel(KernelId::Head, skip(1, Expression::Environment));
        assert_eq!(single_skip.as_environment_path(), Some(vec![1]));

        // Chained skips fold to a single flat offset: env[2+3].
        let chained_skip =
            Expression::kernel(KernelId::Head, skip(2, skip(3, Expression::Environment)));
        assert_eq!(chained_skip.as_environment_path(), Some(vec![5]));

        // A skip/head chain over another environment-path expression
        // contributes a genuine extra level of nesting: env[2][1].
        let nested = Expression::kernel(
            KernelId::Head,
            skip(1, Expression::kernel(KernelId::Head, skip(2, Expression::Environment))),
        );
        assert_eq!(nested.as_environment_path(), Some(vec![2, 1]));
    }
}
