//! Continuous pane capture over a read-only control-mode client.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tmux::parse_output_line;
use crate::transport::StreamProcess;

use super::CaptureChunk;

/// A running capture. Stopping it (or dropping it) kills the client process.
#[derive(Debug)]
pub struct CaptureHandle {
    pub id: String,
    pub session_id: String,
    pub pane_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Kill the client and wait for the reader task to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(capture = %self.id, error = %e, "capture reader ended abnormally");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Forward `%output` payloads for `pane_id` from `stream` into `sink`.
/// `on_exit` runs once the reader stops, however it stopped.
pub(crate) fn spawn_capture<F>(
    stream: StreamProcess,
    id: String,
    session_id: String,
    pane_id: String,
    sink: mpsc::UnboundedSender<CaptureChunk>,
    on_exit: F,
) -> CaptureHandle
where
    F: FnOnce() + Send + 'static,
{
    let cancel = stream.cancel_token();
    let reader = read_output(
        stream,
        cancel.clone(),
        id.clone(),
        session_id.clone(),
        pane_id.clone(),
        sink,
    );
    let task = tokio::spawn(async move {
        reader.await;
        on_exit();
    });
    CaptureHandle {
        id,
        session_id,
        pane_id,
        cancel,
        task: Some(task),
    }
}

async fn read_output(
    mut stream: StreamProcess,
    cancel: CancellationToken,
    id: String,
    session_id: String,
    pane_id: String,
    sink: mpsc::UnboundedSender<CaptureChunk>,
) {
    let mut forwarded = 0u64;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = stream.lines.recv() => line,
        };
        let Some(line) = line else {
            break;
        };
        let Some((pane, data)) = parse_output_line(&line) else {
            continue;
        };
        if pane != pane_id {
            continue;
        }
        let chunk = CaptureChunk {
            capture_id: id.clone(),
            session_id: session_id.clone(),
            pane_id: pane_id.clone(),
            data,
        };
        if sink.send(chunk).is_err() {
            break;
        }
        forwarded += 1;
    }
    stream.kill();
    debug!(capture = %id, forwarded, "capture reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_only_the_requested_pane() {
        let (line_tx, line_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let stream = StreamProcess::new(line_rx, Some(42), cancel.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle =
            spawn_capture(stream, "cap-1".into(), "s1-1".into(), "%1".into(), tx, || {});

        line_tx.send("%begin 1 1 0".to_string()).await.unwrap();
        line_tx.send("%output %2 other".to_string()).await.unwrap();
        line_tx.send("%output %1 hi\\015\\012".to_string()).await.unwrap();

        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.data, "hi\r\n");
        assert_eq!(chunk.pane_id, "%1");
        assert!(handle.is_running());

        handle.stop().await;
        assert!(cancel.is_cancelled());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn ends_when_stream_closes() {
        let (line_tx, line_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let stream = StreamProcess::new(line_rx, None, cancel.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        let handle = spawn_capture(stream, "cap-2".into(), "s".into(), "%0".into(), tx, move || {
            let _ = exit_tx.send(());
        });
        drop(line_tx);
        assert!(rx.recv().await.is_none());
        assert!(cancel.is_cancelled());
        exit_rx.await.unwrap();
        assert!(!handle.is_running());
    }
}
