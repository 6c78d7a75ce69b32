use std::fmt;

/// The strategies module's result type.
pub type Result<T> = std::result::Result<T, StrategyError>;

/// Errors produced while building or running a pluggable strategy.
#[derive(Debug)]
pub enum StrategyError {
    /// No entry named `kind` in the given registry.
    UnknownKind {
        registry: &'static str,
        kind: String,
    },
    /// The strategy's JSON parameters could not be decoded.
    InvalidParams {
        kind: String,
        source: serde_json::Error,
    },
    /// An input is invalid for semantic or domain reasons.
    InvalidInput(String),
    /// A length invariant was violated.
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// The parameter server could not be reached or refused the call.
    Link(String),
}

impl fmt::Display for StrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKind { registry, kind } => write!(f, "unknown {registry} kind {kind:?}"),
            Self::InvalidParams { kind, source } => {
                write!(f, "invalid parameters for {kind:?}: {source}")
            }
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(f, "shape mismatch for {what}: got {got}, expected {expected}"),
            Self::Link(msg) => write!(f, "parameter server link failed: {msg}"),
        }
    }
}

impl std::error::Error for StrategyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidParams { source, .. } => Some(source),
            _ => None,
        }
    }
}
