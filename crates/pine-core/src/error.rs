//! Type-mismatch errors for the typed views over [`Value`](crate::Value).
//!
//! These are distinct from kernel functions (which never raise, per the
//! VM's design contract): `int_from_value`/`string_from_value` are typed
//! accessors used by the lowerer, kernel table, and expression decoder, all
//! of which *do* need to distinguish "not an integer" from "is the integer
//! zero".

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// The blob was not a valid integer encoding (wrong length or sign byte).
    NotAnInteger,
    /// The value was not a list of 1..4-byte blobs.
    NotAString,
    /// A string element decoded to a number that isn't a valid Unicode
    /// scalar value.
    InvalidCodePoint(u32),
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueError::NotAnInteger => write!(f, "value is not an integer encoding"),
            ValueError::NotAString => write!(f, "value is not a string encoding"),
            ValueError::InvalidCodePoint(cp) => write!(f, "{cp:#x} is not a valid Unicode scalar value"),
        }
    }
}

impl std::error::Error for ValueError {}
