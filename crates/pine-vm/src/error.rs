//! Error kinds surfaced by the core (§7).
//!
//! `InvalidInstruction` and `ReturnBeforeAssignment` signal a broken
//! invariant in lowered code — a programmer error in the lowerer, not a
//! recoverable condition — and should be treated as fatal in tests.
//! Kernel functions never raise; they are not part of this type.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A `Value` could not be decoded as an `Expression`.
    ParseExpressionError { reason: String, offending_value_summary: String },
    /// Raised at parse time when a `KernelApplication`'s name field names
    /// no known kernel.
    UnknownKernel { name: String },
    /// `parseAndEvalCount` exceeded the configured limit.
    LimitExceeded { limit: u64, observed: u64 },
    /// An internal invariant was violated in lowered code.
    InvalidInstruction { reason: String },
    /// A frame reached `Return` without any `Eval` having stored a value.
    ReturnBeforeAssignment,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ParseExpressionError { reason, offending_value_summary } => {
                write!(f, "failed to parse expression ({reason}): {offending_value_summary}")
            }
            ErrorKind::UnknownKernel { name } => write!(f, "unknown kernel function: {name}"),
            ErrorKind::LimitExceeded { limit, observed } => {
                write!(f, "parse_and_eval count limit exceeded: limit={limit}, observed={observed}")
            }
            ErrorKind::InvalidInstruction { reason } => write!(f, "invalid instruction: {reason}"),
            ErrorKind::ReturnBeforeAssignment => {
                write!(f, "frame returned before any instruction assigned a value")
            }
        }
    }
}

impl std::error::Error for ErrorKind {}

/// Summarize a value for inclusion in a parse error without dumping an
/// arbitrarily deep tree into the message.
pub fn summarize_value(value: &pine_core::Value) -> String {
    let full = value.to_string();
    const MAX: usize = 120;
    if full.len() > MAX {
        format!("{}...", &full[..MAX])
    } else {
        full
    }
}
