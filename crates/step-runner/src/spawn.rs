//! Local process spawning with output streaming

use async_process::Stdio;
use futures::stream::Stream;
use futures_lite::io::{AsyncBufReadExt, BufReader, Lines};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::event::{ProcessEvent, ProcessEventType};
use crate::process::ChildHandle;

/// Stream of process events from a spawned step
pub struct ProcessEventStream {
    stdout: Option<Lines<BufReader<async_process::ChildStdout>>>,
    stderr: Option<Lines<BufReader<async_process::ChildStderr>>>,
    started_sent: bool,
    child_id: u32,
}

/// Spawn a command with piped output, returning an event stream and a handle
pub fn spawn(command: &Command) -> Result<(ProcessEventStream, ChildHandle)> {
    let mut cmd = command.prepare();
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::spawn_failed(format!("failed to spawn process: {}", e)))?;

    let child_id = child.id();

    let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

    let events = ProcessEventStream {
        stdout,
        stderr,
        started_sent: false,
        child_id,
    };

    Ok((events, ChildHandle::new(child)))
}

impl Stream for ProcessEventStream {
    type Item = ProcessEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Send Started event first
        if !self.started_sent {
            self.started_sent = true;
            let event = ProcessEvent::new(ProcessEventType::Started { pid: self.child_id });
            return Poll::Ready(Some(event));
        }

        // Try to read from stdout
        if let Some(stdout) = &mut self.stdout {
            match Pin::new(stdout).poll_next(cx) {
                Poll::Ready(Some(Ok(line))) => {
                    let event = ProcessEvent::new_with_data(ProcessEventType::Stdout, line);
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                    self.stdout = None;
                }
                Poll::Pending => {}
            }
        }

        // Try to read from stderr
        if let Some(stderr) = &mut self.stderr {
            match Pin::new(stderr).poll_next(cx) {
                Poll::Ready(Some(Ok(line))) => {
                    let event = ProcessEvent::new_with_data(ProcessEventType::Stderr, line);
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                    self.stderr = None;
                }
                Poll::Pending => {}
            }
        }

        // If both streams are closed, the stream is exhausted
        if self.stdout.is_none() && self.stderr.is_none() {
            return Poll::Ready(None);
        }

        // One or both streams are still pending
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessHandle;
    use futures::StreamExt;

    #[smol_potat::test]
    async fn test_spawn_and_wait() {
        let cmd = Command::shell("exit 0");
        let (_events, mut handle) = spawn(&cmd).unwrap();
        let status = handle.wait().await.unwrap();
        assert!(status.success());
    }

    #[smol_potat::test]
    async fn test_spawn_nonzero_exit() {
        let cmd = Command::shell("exit 3");
        let (_events, mut handle) = spawn(&cmd).unwrap();
        let status = handle.wait().await.unwrap();
        assert_eq!(status.code, Some(3));
        assert!(!status.success());
    }

    #[smol_potat::test]
    async fn test_event_stream_carries_output() {
        let cmd = Command::shell("echo out; echo err >&2");
        let (events, mut handle) = spawn(&cmd).unwrap();
        handle.wait().await.unwrap();

        let collected: Vec<ProcessEvent> = events.collect().await;
        assert!(matches!(
            collected[0].event_type,
            ProcessEventType::Started { .. }
        ));
        assert!(collected
            .iter()
            .any(|e| e.event_type == ProcessEventType::Stdout
                && e.data.as_deref() == Some("out")));
        assert!(collected
            .iter()
            .any(|e| e.event_type == ProcessEventType::Stderr
                && e.data.as_deref() == Some("err")));
    }

    #[smol_potat::test]
    async fn test_terminate() {
        let cmd = Command::shell("sleep 30");
        let (_events, mut handle) = spawn(&cmd).unwrap();
        handle.terminate().await.unwrap();
        let status = handle.wait().await.unwrap();
        assert!(status.terminated_by_signal());
    }
}
