//! Process Runner: spawns the external assistant CLI and streams its
//! line-delimited JSON output back through an abstract chunk sink.
//!
//! The sink is a single-method trait rather than a direct reference to the
//! fan-out registry, keeping this module free of scheduling concerns and
//! cleanly testable with a recording sink.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::RunError;

/// Environment variables whose name begins with this prefix are stripped
/// from the child's environment. Without this the assistant detects it is
/// being invoked from within another session of itself and refuses to start.
pub const RESERVED_ENV_PREFIX: &str = "CLAUDE_";

#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn write_chunk(&self, text: String);
}

/// A sink that records every chunk it receives, for use in tests.
#[derive(Default, Clone)]
pub struct RecordingSink {
    chunks: std::sync::Arc<tokio::sync::Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn chunks(&self) -> Vec<String> {
        self.chunks.lock().await.clone()
    }
}

#[async_trait]
impl ChunkSink for RecordingSink {
    async fn write_chunk(&self, text: String) {
        self.chunks.lock().await.push(text);
    }
}

pub struct ProcessRunner {
    executable_path: String,
}

impl ProcessRunner {
    pub fn new(executable_path: impl Into<String>) -> Self {
        Self {
            executable_path: executable_path.into(),
        }
    }

    /// Spawn the assistant and drive it to completion or cancellation.
    ///
    /// `deadline` is the per-job timeout, if any; `deadline_minutes` is the
    /// same value in minutes, used only to format the timeout error message.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
        deadline_minutes: i64,
        model: &str,
        prompt: &str,
        effective_system_prompt: &str,
        chunk_sink: &dyn ChunkSink,
    ) -> Result<String, RunError> {
        let mut command = Command::new(&self.executable_path);
        command
            .arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--dangerously-skip-permissions")
            .arg("--model")
            .arg(model);

        if !effective_system_prompt.is_empty() {
            command.arg("--system-prompt").arg(effective_system_prompt);
        }

        command.arg(prompt);

        for (key, _) in std::env::vars() {
            if key.starts_with(RESERVED_ENV_PREFIX) {
                command.env_remove(key);
            }
        }

        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(RunError::Spawn)?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let read_loop = read_stream(stdout, chunk_sink);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(RunError::Cancelled);
            }
            result = run_with_optional_deadline(read_loop, deadline) => result,
        };

        let last_result = match outcome {
            DeadlineOutcome::TimedOut => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(RunError::TimedOut(deadline_minutes));
            }
            DeadlineOutcome::Completed(Err(e)) => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(e);
            }
            DeadlineOutcome::Completed(Ok(last_result)) => last_result,
        };

        let status = child.wait().await.map_err(RunError::Stream)?;

        if !status.success() {
            let stderr_buf = stderr_task.await.unwrap_or_default();
            let detail = if !stderr_buf.trim().is_empty() {
                stderr_buf
            } else {
                last_result.clone().unwrap_or_default()
            };
            return Err(RunError::Exit(detail));
        }

        Ok(last_result.unwrap_or_default())
    }
}

enum DeadlineOutcome {
    Completed(Result<Option<String>, RunError>),
    TimedOut,
}

async fn run_with_optional_deadline(
    fut: impl std::future::Future<Output = Result<Option<String>, RunError>>,
    deadline: Option<Duration>,
) -> DeadlineOutcome {
    match deadline {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(result) => DeadlineOutcome::Completed(result),
            Err(_) => DeadlineOutcome::TimedOut,
        },
        None => DeadlineOutcome::Completed(fut.await),
    }
}

/// Parse the child's line-delimited JSON stdout, forwarding `assistant` text
/// chunks through `chunk_sink` and capturing the final `result` payload.
/// Unknown kinds and malformed lines are silently skipped.
async fn read_stream(
    stdout: impl tokio::io::AsyncRead + Unpin,
    chunk_sink: &dyn ChunkSink,
) -> Result<Option<String>, RunError> {
    let mut lines = BufReader::new(stdout).lines();
    let mut last_result: Option<String> = None;

    loop {
        let line = lines.next_line().await.map_err(RunError::Stream)?;
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("assistant") => {
                if let Some(text) = extract_assistant_text(&value) {
                    chunk_sink.write_chunk(text).await;
                }
            }
            Some("result") => {
                if let Some(result) = value.get("result").and_then(|r| r.as_str()) {
                    last_result = Some(result.to_string());
                }
            }
            _ => {}
        }
    }

    Ok(last_result)
}

fn extract_assistant_text(value: &serde_json::Value) -> Option<String> {
    let content = value
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| value.get("content"))?
        .as_array()?;

    let mut text = String::new();
    for block in content {
        if block.get("type").and_then(|t| t.as_str()) == Some("text") {
            if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                text.push_str(t);
            }
        }
    }

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extract_assistant_text_concatenates_text_blocks() {
        let value = serde_json::json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "text", "text": "Hello, "},
                    {"type": "tool_use", "name": "ignored"},
                    {"type": "text", "text": "world"}
                ]
            }
        });
        assert_eq!(
            extract_assistant_text(&value),
            Some("Hello, world".to_string())
        );
    }

    #[tokio::test]
    async fn read_stream_forwards_assistant_chunks_and_captures_result() {
        let input = "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"Hi\"}]}}\n\
             not json at all\n\
             {\"type\":\"unknown_kind\"}\n\
             {\"type\":\"result\",\"result\":\"Hi\"}\n";
        let sink = RecordingSink::new();
        let result = read_stream(input.as_bytes(), &sink).await.unwrap();

        assert_eq!(result, Some("Hi".to_string()));
        assert_eq!(sink.chunks().await, vec!["Hi".to_string()]);
    }

    #[tokio::test]
    async fn read_stream_without_result_kind_returns_none() {
        let input = "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"Hi\"}]}}\n";
        let sink = RecordingSink::new();
        let result = read_stream(input.as_bytes(), &sink).await.unwrap();
        assert_eq!(result, None);
    }
}
