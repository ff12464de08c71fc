//! Process hygiene tests for the CLI runtime backend.
//!
//! A fake agent CLI (shell script) records its PID, emits stream-json, and
//! then sleeps far longer than the test runs. The subprocess must be dead
//! after the stream is consumed to completion and after the consumer
//! abandons the stream early.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use uuid::Uuid;

use agency::runtime::{AgentEvent, AgentRuntime, CliRuntime, Invocation, ToolServerHandle};

/// Write an executable fake CLI into `dir`. It records its PID into
/// `child.pid` beside itself, prints `lines`, then sleeps.
fn write_fake_cli(dir: &Path, lines: &[&str]) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script_path = dir.join("fake-agent-cli");
    let mut script = String::from("#!/bin/sh\n");
    script.push_str("echo $$ > \"$(dirname \"$0\")/child.pid\"\n");
    for line in lines {
        script.push_str(&format!("echo '{line}'\n"));
    }
    script.push_str("sleep 600\n");
    std::fs::write(&script_path, script).unwrap();
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    script_path
}

fn invocation(cwd: PathBuf) -> Invocation {
    Invocation {
        agent: "sable".into(),
        task_id: Uuid::new_v4(),
        prompt: "do the thing".into(),
        system_prompt: "you are sable".into(),
        cwd,
        tool_server: ToolServerHandle::default(),
        model: None,
    }
}

async fn read_child_pid(dir: &Path) -> u32 {
    for _ in 0..200 {
        if let Ok(text) = std::fs::read_to_string(dir.join("child.pid")) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("fake CLI never wrote its pid");
}

/// Dead means gone from /proc, or a zombie awaiting its (async) reap.
fn process_is_dead(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => {
            // State is the first field after the parenthesized comm
            stat.rsplit(')')
                .next()
                .and_then(|rest| rest.trim().chars().next())
                .map(|state| state == 'Z' || state == 'X')
                .unwrap_or(true)
        }
    }
}

async fn assert_eventually_dead(pid: u32) {
    for _ in 0..300 {
        if process_is_dead(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("child process {pid} is still alive");
}

#[tokio::test]
async fn child_is_killed_after_stream_completes() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write_fake_cli(
        dir.path(),
        &[
            r#"{"type":"assistant","message":"working"}"#,
            r#"{"type":"result","subtype":"success","result":"done","num_turns":1}"#,
        ],
    );

    let runtime = CliRuntime::new(bin.to_string_lossy().to_string(), None);
    let events: Vec<AgentEvent> = runtime
        .invoke(invocation(dir.path().to_path_buf()))
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], AgentEvent::Result { .. }));

    let pid = read_child_pid(dir.path()).await;
    assert_eventually_dead(pid).await;
}

#[tokio::test]
async fn child_is_killed_when_consumer_abandons_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write_fake_cli(
        dir.path(),
        &[
            r#"{"type":"assistant","message":"one"}"#,
            r#"{"type":"assistant","message":"two"}"#,
        ],
    );

    let runtime = CliRuntime::new(bin.to_string_lossy().to_string(), None);
    {
        let mut stream = runtime.invoke(invocation(dir.path().to_path_buf()));
        let first = stream.next().await.unwrap();
        assert!(matches!(first, AgentEvent::Message { .. }));
        // Dropping the stream here abandons the child mid-output
    }

    let pid = read_child_pid(dir.path()).await;
    assert_eventually_dead(pid).await;
}

#[tokio::test]
async fn missing_binary_becomes_failure_result() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = CliRuntime::new("/nonexistent/agent-cli", None);
    let events: Vec<AgentEvent> = runtime
        .invoke(invocation(dir.path().to_path_buf()))
        .collect()
        .await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        AgentEvent::Result { result } => {
            assert!(result.output.contains("Failed to spawn"));
            assert!(result.output.contains("/nonexistent/agent-cli"));
        }
        other => panic!("expected failure result, got {other:?}"),
    }
}
