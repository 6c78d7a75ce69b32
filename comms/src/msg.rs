use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::specs::{server::ServerSpec, trainer::TrainerJob};

/// A remote invocation, the body of a `Request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    /// Constructs the server strategy on the callee.
    CreateServer(ServerSpec),
    /// Runs a trainer over its shard and replies with its metrics.
    RunTrainer(Box<TrainerJob>),
    /// Clears the accumulated server state.
    ResetState,
    /// Replies with the callee's metrics blob.
    GetMetrics,
    /// Seeds the server parameters, ignored if already seeded.
    InitParams { trainer: usize, params: Vec<f32> },
    /// Applies a gradient on the server and replies with the updated parameters.
    PushGradient { trainer: usize, gradient: Vec<f32> },
    /// Stops the callee's serving loop.
    Shutdown,
}

impl Call {
    /// A stable name for the call kind, used for observability.
    pub fn kind(&self) -> &'static str {
        match self {
            Call::CreateServer(_) => "create_server",
            Call::RunTrainer(_) => "run_trainer",
            Call::ResetState => "reset_state",
            Call::GetMetrics => "get_metrics",
            Call::InitParams { .. } => "init_params",
            Call::PushGradient { .. } => "push_gradient",
            Call::Shutdown => "shutdown",
        }
    }
}

/// An inbound call together with its device-affinity hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub call: Call,
    pub device_affinity: bool,
}

/// The outcome of a `Request` as produced by the callee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Err(String),
}

impl Reply {
    /// An empty successful reply.
    pub fn done() -> Self {
        Self::Ok(Value::Null)
    }

    /// Turns the reply into a plain `Result`.
    pub fn into_result(self) -> Result<Value, String> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Err(e) => Err(e),
        }
    }
}

/// The application layer message for the entire system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Msg {
    Request(Request),
    Reply(Reply),
}

impl Msg {
    /// A stable name for the message kind, used for observability.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Request(request) => request.call.kind(),
            Msg::Reply(Reply::Ok(_)) => "reply/ok",
            Msg::Reply(Reply::Err(_)) => "reply/err",
        }
    }
}
