//! Explicit three-state sum for legitimately ternary verification signals.
//!
//! The source tolerates `achieved` appearing as either a boolean or a
//! string; callers at the agent boundary normalize into this type instead
//! of carrying the ambiguity downstream (see [`Tri::from_loose`]).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tri {
    Yes,
    No,
    Partial,
}

impl Tri {
    pub fn is_truthy(self) -> bool {
        matches!(self, Tri::Yes)
    }

    pub fn is_falsy(self) -> bool {
        matches!(self, Tri::No)
    }

    /// `PARTIAL` is inconclusive; so is anything we couldn't parse at all
    /// (see [`Tri::from_loose`], which maps unparseable input to `None` and
    /// leaves the inconclusive default to the caller).
    pub fn is_inconclusive(self) -> bool {
        matches!(self, Tri::Partial)
    }

    /// Parse a whitespace-padded string form (`"YES"`, `"no"`, `" Partial "`).
    pub fn parse_str(raw: &str) -> Option<Tri> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "YES" | "TRUE" => Some(Tri::Yes),
            "NO" | "FALSE" => Some(Tri::No),
            "PARTIAL" => Some(Tri::Partial),
            _ => None,
        }
    }

    /// Normalize the agent's `achieved` field, which the source allows to
    /// be either a JSON boolean or a string. Absence of a value, and any
    /// value that fails to parse, is treated as inconclusive.
    pub fn from_loose(value: &serde_json::Value) -> Tri {
        match value {
            serde_json::Value::Bool(true) => Tri::Yes,
            serde_json::Value::Bool(false) => Tri::No,
            serde_json::Value::String(s) => Tri::parse_str(s).unwrap_or(Tri::Partial),
            serde_json::Value::Null => Tri::Partial,
            _ => Tri::Partial,
        }
    }
}

/// Confidence a [`Tri`] verdict is accompanied by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
}
