use comms::specs::StrategySpec;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Result, StrategyError};

/// Decodes a strategy's parameters, treating missing parameters as an empty object so
/// that field defaults apply.
pub(crate) fn parse<T: DeserializeOwned>(spec: &StrategySpec) -> Result<T> {
    let params = match &spec.params {
        Value::Null => Value::Object(Map::new()),
        params => params.clone(),
    };

    serde_json::from_value(params).map_err(|source| StrategyError::InvalidParams {
        kind: spec.kind.clone(),
        source,
    })
}

pub(crate) fn default_lr() -> f32 {
    0.01
}
