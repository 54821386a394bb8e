//! The single datum type of the Pine VM: an immutable tree of bytes.
//!
//! A [`Value`] is either a `Blob` (a finite byte sequence) or a `List` (a
//! finite ordered sequence of `Value`s). Both variants are reference
//! counted so a `Value` can be shared as a child of many other `Value`s
//! without copying; the tree is acyclic and never mutated after
//! construction, so no cycle collector is needed.

use crate::hash::{self, ContentHash};
use std::fmt;
use std::sync::{Arc, OnceLock};

#[derive(Debug)]
enum ValueKind {
    Blob(Box<[u8]>),
    List(Box<[Value]>),
}

struct ValueNode {
    kind: ValueKind,
    hash: OnceLock<ContentHash>,
}

impl fmt::Debug for ValueNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

/// The sole user-visible datum: an immutable blob of bytes or an ordered
/// list of `Value`s. Cheap to clone (an `Arc` bump); equality and hashing
/// are structural.
#[derive(Clone, Debug)]
pub struct Value(Arc<ValueNode>);

impl Value {
    /// Build a `Blob` value from its bytes.
    pub fn blob(bytes: impl Into<Vec<u8>>) -> Value {
        Value(Arc::new(ValueNode {
            kind: ValueKind::Blob(bytes.into().into_boxed_slice()),
            hash: OnceLock::new(),
        }))
    }

    /// Build a `List` value from its elements.
    pub fn list(items: impl Into<Vec<Value>>) -> Value {
        Value(Arc::new(ValueNode {
            kind: ValueKind::List(items.into().into_boxed_slice()),
            hash: OnceLock::new(),
        }))
    }

    /// The canonical empty list.
    pub fn empty_list() -> Value {
        Value::list(Vec::new())
    }

    /// The canonical empty blob.
    pub fn empty_blob() -> Value {
        Value::blob(Vec::new())
    }

    /// The canonical `true` blob: `[4]`.
    pub fn bool_true() -> Value {
        Value::blob(vec![4])
    }

    /// The canonical `false` blob: `[2]`.
    pub fn bool_false() -> Value {
        Value::blob(vec![2])
    }

    /// Encode a boolean using the VM's two recognized blobs.
    pub fn from_bool(b: bool) -> Value {
        if b { Value::bool_true() } else { Value::bool_false() }
    }

    /// `true` iff this value is the canonical true-blob `[4]`.
    pub fn is_true(&self) -> bool {
        self.as_blob() == Some(&[4][..])
    }

    /// `true` iff this value is the canonical false-blob `[2]`.
    pub fn is_false(&self) -> bool {
        self.as_blob() == Some(&[2][..])
    }

    /// View this value as a blob's bytes, or `None` if it is a list.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match &self.0.kind {
            ValueKind::Blob(b) => Some(b),
            ValueKind::List(_) => None,
        }
    }

    /// View this value as a list's elements, or `None` if it is a blob.
    pub fn as_list(&self) -> Option<&[Value]> {
        match &self.0.kind {
            ValueKind::List(items) => Some(items),
            ValueKind::Blob(_) => None,
        }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self.0.kind, ValueKind::Blob(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self.0.kind, ValueKind::List(_))
    }

    /// Navigate this value by a path of list indices, returning `None`
    /// if any step navigates into or past a non-list or an out-of-range
    /// index.
    pub fn navigate(&self, path: &[usize]) -> Option<Value> {
        let mut cur = self.clone();
        for &index in path {
            let items = cur.as_list()?;
            cur = items.get(index)?.clone();
        }
        Some(cur)
    }

    /// The SHA-256 structural hash of this value's tree, memoized after
    /// first computation.
    pub fn structural_hash(&self) -> ContentHash {
        *self.0.hash.get_or_init(|| {
            let mut hasher = hash::new_hasher();
            self.hash_into(&mut hasher);
            hash::finalize(hasher)
        })
    }

    fn hash_into(&self, hasher: &mut sha2::Sha256) {
        match &self.0.kind {
            ValueKind::Blob(b) => hash::hash_blob(hasher, b),
            ValueKind::List(items) => {
                hash::hash_list_header(hasher, items.len());
                for item in items.iter() {
                    item.hash_into(hasher);
                }
            }
        }
    }

    /// `Arc` pointer identity; used by equality as a fast path and by the
    /// interner to detect already-canonical instances.
    fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (&self.0.kind, &other.0.kind) {
            (ValueKind::Blob(a), ValueKind::Blob(b)) => a == b,
            (ValueKind::List(a), ValueKind::List(b)) => a.len() == b.len() && a.iter().eq(b.iter()),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.structural_hash().0.hash(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            ValueKind::Blob(bytes) => {
                write!(f, "#[")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{b}")?;
                }
                write!(f, "]")
            }
            ValueKind::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_and_list_equality() {
        assert_eq!(Value::blob(vec![1, 2, 3]), Value::blob(vec![1, 2, 3]));
        assert_ne!(Value::blob(vec![1, 2]), Value::blob(vec![1, 2, 3]));
        assert_ne!(Value::empty_blob(), Value::empty_list());
    }

    #[test]
    fn list_respects_order() {
        let a = Value::list(vec![Value::blob(vec![1]), Value::blob(vec![2])]);
        let b = Value::list(vec![Value::blob(vec![2]), Value::blob(vec![1])]);
        assert_ne!(a, b);
    }

    #[test]
    fn structural_hash_is_deterministic_and_distinguishes_shape() {
        let a = Value::list(vec![Value::blob(vec![1]), Value::blob(vec![2])]);
        let b = Value::list(vec![Value::blob(vec![1]), Value::blob(vec![2])]);
        assert_eq!(a.structural_hash(), b.structural_hash());

        // A blob [1,2] must not hash the same as a list containing two
        // single-byte blobs: the tag+length framing must prevent this.
        let flat = Value::blob(vec![1, 2]);
        assert_ne!(a.structural_hash(), flat.structural_hash());
    }

    #[test]
    fn navigate_walks_list_indices() {
        let env = Value::list(vec![
            Value::blob(vec![10]),
            Value::list(vec![Value::blob(vec![20]), Value::blob(vec![30])]),
        ]);
        assert_eq!(env.navigate(&[1, 0]), Some(Value::blob(vec![20])));
        assert_eq!(env.navigate(&[1, 5]), None);
        assert_eq!(env.navigate(&[0, 0]), None);
    }

    #[test]
    fn booleans_use_fixed_blobs() {
        assert!(Value::from_bool(true).is_true());
        assert!(Value::from_bool(false).is_false());
        assert!(!Value::blob(vec![9]).is_true());
        assert!(!Value::blob(vec![9]).is_false());
    }
}
