//! Environment constraints: ordered sets of `(path, value)` facts used to
//! select a specialized lowering (§3, §4.3).

use pine_core::Value;
use std::fmt;

/// A single `(path, value)` fact: navigating the environment by `path`
/// must yield a `Value` structurally equal to `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvFact {
    pub path: Vec<usize>,
    pub value: Value,
}

impl EnvFact {
    pub fn new(path: Vec<usize>, value: Value) -> EnvFact {
        EnvFact { path, value }
    }

    fn matches(&self, env: &Value) -> bool {
        env.navigate(&self.path).is_some_and(|v| v == self.value)
    }
}

/// An ordered multiset of `(path, value)` facts identified by a stable
/// content hash over the facts in sorted order. Equal fact sets are equal
/// constraints regardless of construction order.
#[derive(Debug, Clone)]
pub struct EnvConstraintId {
    facts: Vec<EnvFact>,
}

impl EnvConstraintId {
    pub fn new(mut facts: Vec<EnvFact>) -> EnvConstraintId {
        facts.sort_by(|a, b| a.path.cmp(&b.path));
        EnvConstraintId { facts }
    }

    pub fn facts(&self) -> &[EnvFact] {
        &self.facts
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// `true` iff every fact in this constraint navigates `env` to an
    /// equal value.
    pub fn matches(&self, env: &Value) -> bool {
        self.facts.iter().all(|f| f.matches(env))
    }

    /// `true` iff `other`'s facts are a proper subset of this
    /// constraint's facts, i.e. this constraint is strictly more specific.
    pub fn is_more_specific_than(&self, other: &EnvConstraintId) -> bool {
        if self.facts.len() <= other.facts.len() {
            return false;
        }
        other.facts.iter().all(|f| self.facts.contains(f))
    }

    pub fn binding_for(&self, path: &[usize]) -> Option<&Value> {
        self.facts.iter().find(|f| f.path == path).map(|f| &f.value)
    }
}

impl PartialEq for EnvConstraintId {
    fn eq(&self, other: &Self) -> bool {
        self.facts.len() == other.facts.len() && self.facts.iter().all(|f| other.facts.contains(f))
    }
}

impl Eq for EnvConstraintId {}

impl fmt::Display for EnvConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, fact) in self.facts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}={}", fact.path, fact.value)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pine_core::value_from_int;

    #[test]
    fn equality_ignores_construction_order() {
        let a = EnvConstraintId::new(vec![
            EnvFact::new(vec![0], value_from_int(1)),
            EnvFact::new(vec![1], value_from_int(2)),
        ]);
        let b = EnvConstraintId::new(vec![
            EnvFact::new(vec![1], value_from_int(2)),
            EnvFact::new(vec![0], value_from_int(1)),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn matches_checks_every_fact() {
        let env = Value::list(vec![value_from_int(41), value_from_int(47)]);
        let c = EnvConstraintId::new(vec![EnvFact::new(vec![1], value_from_int(47))]);
        assert!(c.matches(&env));
        let c2 = EnvConstraintId::new(vec![EnvFact::new(vec![1], value_from_int(99))]);
        assert!(!c2.matches(&env));
    }

    #[test]
    fn specificity_is_proper_subset() {
        let a = EnvConstraintId::new(vec![EnvFact::new(vec![0], value_from_int(1))]);
        let b = EnvConstraintId::new(vec![
            EnvFact::new(vec![0], value_from_int(1)),
            EnvFact::new(vec![1], value_from_int(2)),
        ]);
        assert!(b.is_more_specific_than(&a));
        assert!(!a.is_more_specific_than(&b));
        assert!(!a.is_more_specific_than(&a));
    }
}
