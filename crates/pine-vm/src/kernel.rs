//! The fixed kernel function table (§4.2).
//!
//! Every kernel is total: it never raises, and a shape mismatch yields the
//! empty list (except `is_sorted_ascending_int`, which always yields a
//! boolean). Fused instruction forms (`SkipHeadPath`, `EqualTwo`) must
//! preserve these exact semantics.

use pine_core::{Value, int_from_value, value_from_int};
use std::fmt;

/// The closed set of kernel function names known to the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    Equal,
    Length,
    Head,
    Skip,
    Take,
    Concat,
    Reverse,
    Negate,
    AddInt,
    MulInt,
    IsSortedAscendingInt,
}

impl KernelId {
    pub const ALL: [KernelId; 11] = [
        KernelId::Equal,
        KernelId::Length,
        KernelId::Head,
        KernelId::Skip,
        KernelId::Take,
        KernelId::Concat,
        KernelId::Reverse,
        KernelId::Negate,
        KernelId::AddInt,
        KernelId::MulInt,
        KernelId::IsSortedAscendingInt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            KernelId::Equal => "equal",
            KernelId::Length => "length",
            KernelId::Head => "head",
            KernelId::Skip => "skip",
            KernelId::Take => "take",
            KernelId::Concat => "concat",
            KernelId::Reverse => "reverse",
            KernelId::Negate => "negate",
            KernelId::AddInt => "add_int",
            KernelId::MulInt => "mul_int",
            KernelId::IsSortedAscendingInt => "is_sorted_ascending_int",
        }
    }

    pub fn parse(name: &str) -> Option<KernelId> {
        KernelId::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Apply a kernel function to its (already evaluated) argument value.
pub fn apply(id: KernelId, arg: &Value) -> Value {
    match id {
        KernelId::Equal => equal(arg),
        KernelId::Length => length(arg),
        KernelId::Head => head(arg),
        KernelId::Skip => skip(arg),
        KernelId::Take => take(arg),
        KernelId::Concat => concat(arg),
        KernelId::Reverse => reverse(arg),
        KernelId::Negate => negate(arg),
        KernelId::AddInt => add_int(arg),
        KernelId::MulInt => mul_int(arg),
        KernelId::IsSortedAscendingInt => is_sorted_ascending_int(arg),
    }
}

fn all_equal_values(items: &[Value]) -> bool {
    items.windows(2).all(|w| w[0] == w[1])
}

fn all_equal_bytes(bytes: &[u8]) -> bool {
    bytes.windows(2).all(|w| w[0] == w[1])
}

fn equal(arg: &Value) -> Value {
    let result = match (arg.as_list(), arg.as_blob()) {
        (Some(items), _) => all_equal_values(items),
        (None, Some(bytes)) => all_equal_bytes(bytes),
        (None, None) => unreachable!("Value is always a List or a Blob"),
    };
    Value::from_bool(result)
}

fn length(arg: &Value) -> Value {
    let n = match (arg.as_list(), arg.as_blob()) {
        (Some(items), _) => items.len(),
        (None, Some(bytes)) => bytes.len(),
        (None, None) => unreachable!(),
    };
    value_from_int(n as i64)
}

fn head(arg: &Value) -> Value {
    match arg.as_list() {
        Some([first, ..]) => first.clone(),
        _ => Value::empty_list(),
    }
}

/// Shared `(n, coll)` argument decoding for `skip`/`take`.
fn decode_count_and_collection(arg: &Value) -> Option<(i64, &Value)> {
    let items = arg.as_list()?;
    let [n_value, coll] = items else { return None };
    let n = int_from_value(n_value).ok()?;
    Some((n, coll))
}

fn skip(arg: &Value) -> Value {
    let Some((n, coll)) = decode_count_and_collection(arg) else {
        return Value::empty_list();
    };
    let n = n.max(0) as usize;
    match (coll.as_list(), coll.as_blob()) {
        (Some(items), _) => Value::list(items.get(n.min(items.len())..).unwrap_or(&[]).to_vec()),
        (None, Some(bytes)) => Value::blob(bytes.get(n.min(bytes.len())..).unwrap_or(&[]).to_vec()),
        (None, None) => Value::empty_list(),
    }
}

fn take(arg: &Value) -> Value {
    let Some((n, coll)) = decode_count_and_collection(arg) else {
        return Value::empty_list();
    };
    if n < 0 {
        return match (coll.as_list(), coll.as_blob()) {
            (Some(_), _) => Value::empty_list(),
            (None, Some(_)) => Value::empty_blob(),
            (None, None) => Value::empty_list(),
        };
    }
    let n = n as usize;
    match (coll.as_list(), coll.as_blob()) {
        (Some(items), _) => Value::list(items[..n.min(items.len())].to_vec()),
        (None, Some(bytes)) => Value::blob(bytes[..n.min(bytes.len())].to_vec()),
        (None, None) => Value::empty_list(),
    }
}

fn concat(arg: &Value) -> Value {
    let Some(items) = arg.as_list() else {
        return Value::empty_list();
    };
    if items.is_empty() {
        return Value::empty_list();
    }
    if items.iter().all(|v| v.is_list()) {
        let mut flattened = Vec::new();
        for v in items {
            flattened.extend(v.as_list().unwrap().iter().cloned());
        }
        Value::list(flattened)
    } else if items.iter().all(|v| v.is_blob()) {
        let mut bytes = Vec::new();
        for v in items {
            bytes.extend_from_slice(v.as_blob().unwrap());
        }
        Value::blob(bytes)
    } else {
        Value::empty_list()
    }
}

fn reverse(arg: &Value) -> Value {
    match (arg.as_list(), arg.as_blob()) {
        (Some(items), _) => Value::list(items.iter().rev().cloned().collect::<Vec<_>>()),
        (None, Some(bytes)) => Value::blob(bytes.iter().rev().copied().collect::<Vec<_>>()),
        (None, None) => unreachable!(),
    }
}

fn negate(arg: &Value) -> Value {
    match arg.as_blob() {
        Some([sign @ (2 | 4), magnitude @ ..]) => {
            let flipped = if *sign == 4 { 2 } else { 4 };
            let mut bytes = vec![flipped];
            bytes.extend_from_slice(magnitude);
            Value::blob(bytes)
        }
        _ => Value::empty_list(),
    }
}

fn add_int(arg: &Value) -> Value {
    fold_ints(arg, 0, |acc, n| acc + i128::from(n))
}

fn mul_int(arg: &Value) -> Value {
    fold_ints(arg, 1, |acc, n| acc * i128::from(n))
}

fn fold_ints(arg: &Value, identity: i128, step: impl Fn(i128, i64) -> i128) -> Value {
    let Some(items) = arg.as_list() else {
        return Value::empty_list();
    };
    let mut acc = identity;
    for item in items {
        let Ok(n) = int_from_value(item) else {
            return Value::empty_list();
        };
        acc = step(acc, n);
    }
    match i64::try_from(acc) {
        Ok(n) => value_from_int(n),
        Err(_) => Value::empty_list(),
    }
}

fn is_sorted_ascending_int(arg: &Value) -> Value {
    let sorted = match (arg.as_list(), arg.as_blob()) {
        (Some(items), _) => {
            let mut decoded = Vec::with_capacity(items.len());
            for item in items {
                match int_from_value(item) {
                    Ok(n) => decoded.push(n),
                    Err(_) => return Value::from_bool(false),
                }
            }
            decoded.windows(2).all(|w| w[0] <= w[1])
        }
        (None, Some(bytes)) => bytes.windows(2).all(|w| w[0] <= w[1]),
        (None, None) => unreachable!(),
    };
    Value::from_bool(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(n: i64) -> Value {
        value_from_int(n)
    }

    #[test]
    fn kernel_names_round_trip() {
        for k in KernelId::ALL {
            assert_eq!(KernelId::parse(k.name()), Some(k));
        }
        assert_eq!(KernelId::parse("nope"), None);
    }

    #[test]
    fn equal_trivially_true_on_zero_or_one_elements() {
        assert!(apply(KernelId::Equal, &Value::empty_list()).is_true());
        assert!(apply(KernelId::Equal, &Value::list(vec![int(1)])).is_true());
        assert!(apply(KernelId::Equal, &Value::list(vec![int(1), int(1)])).is_true());
        assert!(apply(KernelId::Equal, &Value::list(vec![int(1), int(2)])).is_false());
    }

    #[test]
    fn length_counts_list_and_blob() {
        assert_eq!(apply(KernelId::Length, &Value::list(vec![int(1), int(2)])), int(2));
        assert_eq!(apply(KernelId::Length, &Value::blob(vec![1, 2, 3])), int(3));
    }

    #[test]
    fn head_of_empty_is_empty_list() {
        assert_eq!(apply(KernelId::Head, &Value::empty_list()), Value::empty_list());
        assert_eq!(apply(KernelId::Head, &Value::blob(vec![1])), Value::empty_list());
    }

    #[test]
    fn skip_clamps_negative_and_overshoot() {
        let env = Value::list(vec![int(10), int(20), int(30), int(40)]);
        assert_eq!(
            apply(KernelId::Skip, &Value::list(vec![int(2), env.clone()])),
            Value::list(vec![int(30), int(40)])
        );
        assert_eq!(
            apply(KernelId::Skip, &Value::list(vec![int(-5), env.clone()])),
            env
        );
        assert_eq!(
            apply(KernelId::Skip, &Value::list(vec![int(99), env.clone()])),
            Value::empty_list()
        );
    }

    #[test]
    fn take_clamps_negative_and_overshoot() {
        let env = Value::list(vec![int(10), int(20), int(30)]);
        assert_eq!(
            apply(KernelId::Take, &Value::list(vec![int(2), env.clone()])),
            Value::list(vec![int(10), int(20)])
        );
        assert_eq!(
            apply(KernelId::Take, &Value::list(vec![int(-1), env.clone()])),
            Value::empty_list()
        );
        assert_eq!(
            apply(KernelId::Take, &Value::list(vec![int(99), env.clone()])),
            env
        );
    }

    #[test]
    fn concat_flattens_lists_or_joins_blobs() {
        let lists = Value::list(vec![Value::list(vec![int(1)]), Value::list(vec![int(2), int(3)])]);
        assert_eq!(apply(KernelId::Concat, &lists), Value::list(vec![int(1), int(2), int(3)]));

        let blobs = Value::list(vec![Value::blob(vec![1, 2]), Value::blob(vec![3])]);
        assert_eq!(apply(KernelId::Concat, &blobs), Value::blob(vec![1, 2, 3]));

        let mixed = Value::list(vec![Value::blob(vec![1]), Value::list(vec![int(1)])]);
        assert_eq!(apply(KernelId::Concat, &mixed), Value::empty_list());
        assert_eq!(apply(KernelId::Concat, &Value::empty_list()), Value::empty_list());
    }

    #[test]
    fn reverse_reverses_both_shapes() {
        assert_eq!(
            apply(KernelId::Reverse, &Value::list(vec![int(1), int(2)])),
            Value::list(vec![int(2), int(1)])
        );
        assert_eq!(apply(KernelId::Reverse, &Value::blob(vec![1, 2, 3])), Value::blob(vec![3, 2, 1]));
    }

    #[test]
    fn negate_flips_sign_byte() {
        assert_eq!(apply(KernelId::Negate, &int(5)), int(-5));
        assert_eq!(apply(KernelId::Negate, &int(-5)), int(5));
        assert_eq!(apply(KernelId::Negate, &Value::empty_list()), Value::empty_list());
    }

    #[test]
    fn add_and_mul_int() {
        assert_eq!(apply(KernelId::AddInt, &Value::list(vec![int(2), int(3), int(-1)])), int(4));
        assert_eq!(apply(KernelId::MulInt, &Value::list(vec![int(2), int(3)])), int(6));
        assert_eq!(apply(KernelId::AddInt, &Value::empty_list()), int(0));
        assert_eq!(apply(KernelId::MulInt, &Value::empty_list()), int(1));
        assert_eq!(apply(KernelId::AddInt, &Value::list(vec![Value::empty_list()])), Value::empty_list());
    }

    #[test]
    fn is_sorted_ascending_int_on_list_and_blob() {
        assert!(apply(KernelId::IsSortedAscendingInt, &Value::list(vec![int(1), int(1), int(2)])).is_true());
        assert!(apply(KernelId::IsSortedAscendingInt, &Value::list(vec![int(2), int(1)])).is_false());
        assert!(apply(KernelId::IsSortedAscendingInt, &Value::blob(vec![1, 2, 2, 3])).is_true());
        assert!(apply(KernelId::IsSortedAscendingInt, &Value::list(vec![Value::empty_list()])).is_false());
    }
}
