use serde::{Deserialize, Serialize};

/// A formula over the bound signature, plus the negate flag passed through
/// to the engine. The formula text is opaque to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub formula: String,
    #[serde(default)]
    pub negate: bool,
}

impl Policy {
    pub fn new(formula: impl Into<String>, negate: bool) -> Self {
        Self {
            formula: formula.into(),
            negate,
        }
    }
}

/// Verdict of the engine's check mode. The diagnostic is the engine's
/// combined stderr/stdout text, reported to callers verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Monitorability {
    pub monitorable: bool,
    pub diagnostic: String,
}
