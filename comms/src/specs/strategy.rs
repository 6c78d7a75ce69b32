use serde::{Deserialize, Serialize};

/// Selects and configures a pluggable strategy.
///
/// `kind` is an opaque registry key (e.g. "sgd", "noop") resolved on the callee side.
/// `params` carries arbitrary JSON configuration for that strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl StrategySpec {
    /// Creates a spec for `kind` with no extra parameters.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: serde_json::Value::Null,
        }
    }

    /// Creates a spec for `kind` with the given parameters.
    pub fn with_params(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}
