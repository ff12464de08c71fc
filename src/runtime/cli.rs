//! External-process runtime backend.
//!
//! Spawns the configured CLI once per invocation, maps its newline-delimited
//! stream-json output to [`AgentEvent`]s, and guarantees the subprocess is
//! killed and reaped whether the consumer reads to completion or abandons
//! the stream early.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::RuntimeError;

use super::{AgentEvent, AgentRuntime, EventStream, Invocation, InvocationResult, ResultOutcome};

/// Runtime backend that shells out to an agent CLI.
pub struct CliRuntime {
    bin: String,
    default_model: Option<String>,
}

impl CliRuntime {
    pub fn new(bin: impl Into<String>, default_model: Option<String>) -> Self {
        Self {
            bin: bin.into(),
            default_model,
        }
    }
}

/// Parse one stream-json line into an event. Returns None for blank,
/// malformed, or unrecognized lines (they are skipped, not errors).
pub fn parse_stream_line(line: &str) -> Option<AgentEvent> {
    let parsed: serde_json::Value = serde_json::from_str(line).ok()?;
    let kind = parsed.get("type")?.as_str()?;

    match kind {
        "assistant" => {
            let content = parsed.get("message")?.as_str()?.to_string();
            Some(AgentEvent::Message { content })
        }
        "tool_use" => {
            let tool = parsed.get("name")?.as_str()?.to_string();
            let input = parsed.get("input").cloned().unwrap_or(serde_json::Value::Null);
            Some(AgentEvent::ToolUse { tool, input })
        }
        "tool_result" => {
            let tool = parsed.get("name")?.as_str()?.to_string();
            let output = stringify(parsed.get("output"));
            Some(AgentEvent::ToolResult { tool, output })
        }
        "result" => {
            let output = stringify(parsed.get("result"));
            let cost_usd = parsed
                .get("total_cost_usd")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let duration_ms = parsed
                .get("duration_ms")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let num_turns = parsed.get("num_turns").and_then(|v| v.as_i64()).unwrap_or(0);
            let outcome =
                ResultOutcome::from_subtype(parsed.get("subtype").and_then(|v| v.as_str()));

            Some(AgentEvent::Result {
                result: InvocationResult {
                    output,
                    cost_usd,
                    duration_ms,
                    num_turns,
                    outcome,
                },
            })
        }
        _ => None,
    }
}

fn stringify(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

impl AgentRuntime for CliRuntime {
    fn invoke(&self, inv: Invocation) -> EventStream {
        let bin = self.bin.clone();
        let model = inv.model.clone().or_else(|| self.default_model.clone());

        Box::pin(async_stream::stream! {
            let mut cmd = Command::new(&bin);
            cmd.arg("-p")
                .arg(&inv.prompt)
                .arg("--output-format")
                .arg("stream-json")
                .arg("--system-prompt")
                .arg(&inv.system_prompt)
                .current_dir(&inv.cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                // Early consumer abandonment drops the child mid-stream;
                // this makes that path kill the process too.
                .kill_on_drop(true);
            if let Some(m) = &model {
                cmd.arg("--model").arg(m);
            }

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    let err = RuntimeError::Spawn {
                        bin: bin.clone(),
                        reason: e.to_string(),
                    };
                    warn!(agent = %inv.agent, error = %err, "Runtime process did not start");
                    yield AgentEvent::Result {
                        result: InvocationResult::failure(err.to_string()),
                    };
                    return;
                }
            };

            // stderr is diagnostics only; drain it so the child never blocks
            if let Some(stderr) = child.stderr.take() {
                let agent = inv.agent.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        warn!(agent = %agent, "runtime stderr: {}", line.trim());
                    }
                });
            }

            let Some(stdout) = child.stdout.take() else {
                let _ = child.kill().await;
                yield AgentEvent::Result {
                    result: InvocationResult::failure("runtime process has no stdout"),
                };
                return;
            };

            let mut lines = BufReader::new(stdout).lines();
            let mut saw_result = false;

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let Some(event) = parse_stream_line(trimmed) else {
                            debug!(agent = %inv.agent, "Skipping unparseable runtime line");
                            continue;
                        };
                        let is_result = matches!(event, AgentEvent::Result { .. });
                        yield event;
                        if is_result {
                            saw_result = true;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(agent = %inv.agent, error = %e, "Error reading runtime stdout");
                        break;
                    }
                }
            }

            // Normal-path cleanup: kill then wait so no zombie is left.
            let _ = child.kill().await;
            let _ = child.wait().await;

            if !saw_result {
                yield AgentEvent::Result {
                    result: InvocationResult::failure(RuntimeError::NoResult.to_string()),
                };
            }
        })
    }
}
