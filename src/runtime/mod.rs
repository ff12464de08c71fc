//! Agent runtime adapter — pluggable backends that execute one task
//! invocation and yield a live stream of execution events.
//!
//! Failure semantics: adapter errors never cross the stream boundary as
//! `Err` items. Backends map every internal failure into a terminal
//! [`AgentEvent::Result`] with [`ResultOutcome::Error`], so downstream
//! orchestration never handles backend-specific errors.

mod cli;
mod embedded;

pub use cli::{CliRuntime, parse_stream_line};
pub use embedded::{EmbeddedRuntime, ExecutionEngine};

use std::path::PathBuf;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classification of a finished invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOutcome {
    Success,
    MaxTurns,
    Error,
}

impl ResultOutcome {
    /// Map the wire-level `subtype` field of a result line.
    pub fn from_subtype(subtype: Option<&str>) -> Self {
        match subtype {
            Some("success") => Self::Success,
            Some("max_turns") => Self::MaxTurns,
            _ => Self::Error,
        }
    }
}

/// Terminal summary of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub output: String,
    pub cost_usd: f64,
    pub duration_ms: i64,
    pub num_turns: i64,
    pub outcome: ResultOutcome,
}

impl InvocationResult {
    /// Synthesize a failure result (adapter error, abrupt stream end).
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            output: reason.into(),
            cost_usd: 0.0,
            duration_ms: 0,
            num_turns: 0,
            outcome: ResultOutcome::Error,
        }
    }
}

/// An ordered item emitted during a single task invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Assistant narration.
    Message { content: String },
    /// A tool is being invoked.
    ToolUse {
        tool: String,
        input: serde_json::Value,
    },
    /// Output of a tool invocation.
    ToolResult { tool: String, output: String },
    /// Terminal event; exactly one per invocation.
    Result { result: InvocationResult },
}

/// Opaque handle to a tool-invocation server.
///
/// Forwarded to the backend without interpretation; the embedded engine
/// receives it directly, the CLI backend ignores it (the subprocess brings
/// its own tool wiring).
#[derive(Debug, Clone, Default)]
pub struct ToolServerHandle {
    pub endpoint: Option<String>,
}

/// Everything a backend needs to execute one task invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub agent: String,
    pub task_id: Uuid,
    pub prompt: String,
    pub system_prompt: String,
    /// The agent's private workspace; the backend runs inside it.
    pub cwd: PathBuf,
    pub tool_server: ToolServerHandle,
    /// Optional model hint; None lets the backend pick its default.
    pub model: Option<String>,
}

/// Live, ordered stream of execution events for one invocation.
pub type EventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// Pluggable execution backend.
pub trait AgentRuntime: Send + Sync {
    /// Execute one task invocation.
    ///
    /// The returned stream is terminated by exactly one
    /// [`AgentEvent::Result`]; an abrupt end without one is treated as a
    /// failure by the consumer.
    fn invoke(&self, inv: Invocation) -> EventStream;
}
