//! In-process runtime backend.
//!
//! Drives an embedded [`ExecutionEngine`] directly; events cross no
//! serialization boundary on their way to the consumer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::RuntimeError;

use super::{AgentEvent, AgentRuntime, EventStream, Invocation, InvocationResult};

/// An embedded execution engine: the thing that actually runs one agent
/// conversation. Implementations emit events through `events` as they are
/// produced and finish by emitting an [`AgentEvent::Result`].
///
/// A send failure means the consumer stopped listening; engines should
/// treat it as a stop request and return.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn run(
        &self,
        inv: &Invocation,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<(), RuntimeError>;
}

/// Runtime backend wrapping an in-process engine.
pub struct EmbeddedRuntime {
    engine: Arc<dyn ExecutionEngine>,
}

impl EmbeddedRuntime {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self { engine }
    }
}

/// Aborts the engine task when the consumer drops the stream mid-flight.
struct AbortOnDrop(JoinHandle<Result<(), RuntimeError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl AgentRuntime for EmbeddedRuntime {
    fn invoke(&self, inv: Invocation) -> EventStream {
        let engine = Arc::clone(&self.engine);
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
        let agent = inv.agent.clone();

        let handle = tokio::spawn(async move { engine.run(&inv, tx).await });

        Box::pin(async_stream::stream! {
            let mut guard = AbortOnDrop(handle);
            let mut saw_result = false;

            while let Some(event) = rx.recv().await {
                let is_result = matches!(event, AgentEvent::Result { .. });
                yield event;
                if is_result {
                    saw_result = true;
                    break;
                }
            }

            if saw_result {
                return;
            }

            // Channel closed without a terminal event — the engine either
            // errored or forgot to finish. Either way the invocation fails.
            let reason = match (&mut guard.0).await {
                Ok(Ok(())) => "engine finished without a result event".to_string(),
                Ok(Err(e)) => {
                    warn!(agent = %agent, error = %e, "Embedded engine failed");
                    format!("engine failed: {e}")
                }
                Err(e) => format!("engine task aborted: {e}"),
            };
            yield AgentEvent::Result {
                result: InvocationResult::failure(reason),
            };
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ResultOutcome, ToolServerHandle};
    use futures::StreamExt;
    use uuid::Uuid;

    fn invocation() -> Invocation {
        Invocation {
            agent: "sable".into(),
            task_id: Uuid::new_v4(),
            prompt: "do the thing".into(),
            system_prompt: "you are sable".into(),
            cwd: std::env::temp_dir(),
            tool_server: ToolServerHandle::default(),
            model: None,
        }
    }

    /// Engine that replays a fixed event script.
    struct ScriptedEngine(Vec<AgentEvent>);

    #[async_trait]
    impl ExecutionEngine for ScriptedEngine {
        async fn run(
            &self,
            _inv: &Invocation,
            events: mpsc::Sender<AgentEvent>,
        ) -> Result<(), RuntimeError> {
            for event in &self.0 {
                if events.send(event.clone()).await.is_err() {
                    return Ok(());
                }
            }
            Ok(())
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl ExecutionEngine for FailingEngine {
        async fn run(
            &self,
            _inv: &Invocation,
            _events: mpsc::Sender<AgentEvent>,
        ) -> Result<(), RuntimeError> {
            Err(RuntimeError::Engine("model unavailable".into()))
        }
    }

    #[tokio::test]
    async fn relays_events_in_order() {
        let runtime = EmbeddedRuntime::new(Arc::new(ScriptedEngine(vec![
            AgentEvent::Message {
                content: "thinking".into(),
            },
            AgentEvent::Result {
                result: InvocationResult {
                    output: "done".into(),
                    cost_usd: 0.01,
                    duration_ms: 10,
                    num_turns: 1,
                    outcome: ResultOutcome::Success,
                },
            },
        ])));

        let events: Vec<AgentEvent> = runtime.invoke(invocation()).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AgentEvent::Message { .. }));
        match &events[1] {
            AgentEvent::Result { result } => assert_eq!(result.outcome, ResultOutcome::Success),
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn engine_error_becomes_failure_result() {
        let runtime = EmbeddedRuntime::new(Arc::new(FailingEngine));
        let events: Vec<AgentEvent> = runtime.invoke(invocation()).collect().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            AgentEvent::Result { result } => {
                assert_eq!(result.outcome, ResultOutcome::Error);
                assert!(result.output.contains("model unavailable"));
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_result_is_synthesized() {
        let runtime = EmbeddedRuntime::new(Arc::new(ScriptedEngine(vec![AgentEvent::Message {
            content: "and then nothing".into(),
        }])));

        let events: Vec<AgentEvent> = runtime.invoke(invocation()).collect().await;
        assert_eq!(events.len(), 2);
        match &events[1] {
            AgentEvent::Result { result } => {
                assert_eq!(result.outcome, ResultOutcome::Error);
                assert!(result.output.contains("without a result event"));
            }
            other => panic!("expected synthesized result, got {other:?}"),
        }
    }
}
