//! Pine Core: the value model shared by every layer of the Pine VM.
//!
//! A `Value` is the only datum the VM's IR ever produces or consumes: an
//! immutable tree of bytes, either a `Blob` or a `List`. This crate owns
//! that type plus its canonical encodings (booleans, integers, strings),
//! structural hashing, and interning.
//!
//! # Modules
//!
//! - `value`: the `Value` type itself, navigation, equality, pretty-printing.
//! - `hash`: the SHA-256 structural hash used as a cache/interning key.
//! - `codec`: integer and string (de)serialization to/from `Value`.
//! - `intern`: the process-wide interning table (`ValueStore`).
//! - `error`: the `ValueError` type-mismatch error for typed views.

mod codec;
mod error;
mod hash;
mod intern;
mod value;

pub use codec::{int_from_value, string_from_value, value_from_int, value_from_string};
pub use error::ValueError;
pub use hash::ContentHash;
pub use intern::Interner;
pub use value::Value;
