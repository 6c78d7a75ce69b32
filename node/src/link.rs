use std::{sync::Arc, time::Duration};

use comms::msg::{Call, Request};
use orchestrator::{Rank, Transport};
use strategies::{ParameterLink, StrategyError};

/// Reaches a trainer's bound server through the rank's transport.
pub struct ServerLink<T> {
    transport: Arc<T>,
    server: Rank,
    trainer: Rank,
    device_affinity: bool,
    timeout: Duration,
}

impl<T: Transport> ServerLink<T> {
    pub fn new(
        transport: Arc<T>,
        server: Rank,
        device_affinity: bool,
        timeout: Duration,
    ) -> Self {
        let trainer = transport.rank();
        Self {
            transport,
            server,
            trainer,
            device_affinity,
            timeout,
        }
    }

    async fn call(&self, call: Call) -> strategies::Result<Vec<f32>> {
        let request = Request {
            call,
            device_affinity: self.device_affinity,
        };

        let value = self
            .transport
            .call_sync(self.server, request, self.timeout)
            .await
            .map_err(|e| StrategyError::Link(e.to_string()))?;

        serde_json::from_value(value).map_err(|e| {
            StrategyError::Link(format!("server {} sent malformed params: {e}", self.server))
        })
    }
}

#[async_trait::async_trait]
impl<T: Transport> ParameterLink for ServerLink<T> {
    async fn init_params(&self, params: Vec<f32>) -> strategies::Result<Vec<f32>> {
        self.call(Call::InitParams {
            trainer: self.trainer,
            params,
        })
        .await
    }

    async fn push_gradient(&self, gradient: Vec<f32>) -> strategies::Result<Vec<f32>> {
        self.call(Call::PushGradient {
            trainer: self.trainer,
            gradient,
        })
        .await
    }
}
