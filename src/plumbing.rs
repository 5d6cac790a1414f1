//! Concurrent byte plumbing between the HTTP side and a running unit.
//!
//! Each copy runs as its own task. Failures are logged per task and never
//! abort the siblings; the owner only learns whether everything finished
//! before the deadline.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Longest stderr line buffered before it is logged anyway.
const MAX_LOG_LINE: usize = 8 * 1024;

/// Why [`Plumbing::wait`] gave up before every task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlumbingError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// Copy `input` into `output` until EOF, then shut `output` down so the
/// reader on the other end sees EOF too.
pub async fn copy_stream<R, W>(label: &'static str, mut input: R, mut output: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut input, &mut output).await?;
    output.shutdown().await?;
    debug!(pipe = label, length = copied, "pipe finished");
    Ok(copied)
}

/// A set of copy tasks joined at a single point.
#[derive(Default)]
pub struct Plumbing {
    tasks: JoinSet<()>,
}

impl Plumbing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start copying `input` into `output` in the background.
    ///
    /// The returned handle stays valid after [`Plumbing::wait`] detached the
    /// task, so a caller can still stop copies whose resource it tore down.
    pub fn spawn_pipe<R, W>(&mut self, label: &'static str, input: R, output: W) -> AbortHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.tasks.spawn(async move {
            if let Err(e) = copy_stream(label, input, output).await {
                error!(pipe = label, error = %e, "pipe error");
            }
        })
    }

    /// Number of tasks still owned by this set.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task, the deadline, or cancellation, whichever comes
    /// first.
    ///
    /// Tasks still running when the deadline or cancellation fires are
    /// detached rather than aborted; they end once the caller tears down the
    /// streams they are copying.
    pub async fn wait(
        mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), PlumbingError> {
        let interrupted = tokio::select! {
            () = async {
                while let Some(joined) = self.tasks.join_next().await {
                    if let Err(e) = joined {
                        warn!(error = %e, "pipe task failed");
                    }
                }
            } => None,
            () = deadline(timeout) => timeout.map(PlumbingError::TimedOut),
            () = cancel.cancelled() => Some(PlumbingError::Cancelled),
        };

        match interrupted {
            None => Ok(()),
            Some(err) => {
                warn!(pending = self.tasks.len(), error = %err, "pipes interrupted");
                self.tasks.detach_all();
                Err(err)
            }
        }
    }
}

/// Resolves after `timeout`, or never when there is none.
pub(crate) async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Diagnostic sink: every line a unit writes to stderr becomes a log event.
pub struct LogWriter {
    unit: String,
    buf: Vec<u8>,
}

impl LogWriter {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            buf: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        warn!(unit = %self.unit, stderr = %line, "unit stderr");
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit(&line[..pos]);
        }
        if self.buf.len() >= MAX_LOG_LINE {
            let line = std::mem::take(&mut self.buf);
            self.emit(&line);
        }
    }
}

impl AsyncWrite for LogWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.buf.extend_from_slice(data);
        this.drain_lines();
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buf.is_empty() {
            let rest = std::mem::take(&mut this.buf);
            this.emit(&rest);
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn copy_closes_writer() {
        let (mut rd, wr) = tokio::io::duplex(64);
        let copied = copy_stream("test", &b"hello"[..], wr).await.unwrap();
        assert_eq!(copied, 5);

        let mut out = Vec::new();
        rd.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn copy_of_empty_input() {
        let (_rd, wr) = tokio::io::duplex(64);
        let copied = copy_stream("test", tokio::io::empty(), wr).await.unwrap();
        assert_eq!(copied, 0);
    }

    #[tokio::test]
    async fn copy_reports_read_error() {
        let input = tokio_test::io::Builder::new()
            .read(b"partial")
            .read_error(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            .build();
        let result = copy_stream("test", input, tokio::io::sink()).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn wait_joins_all_tasks() {
        let mut plumbing = Plumbing::new();
        let (mut rd1, wr1) = tokio::io::duplex(64);
        let (mut rd2, wr2) = tokio::io::duplex(64);
        let _ = plumbing.spawn_pipe("one", &b"abc"[..], wr1);
        let _ = plumbing.spawn_pipe("two", &b"defg"[..], wr2);
        assert_eq!(plumbing.len(), 2);

        plumbing
            .wait(Some(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap();

        let mut out = String::new();
        rd1.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "abc");
        out.clear();
        rd2.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "defg");
    }

    #[tokio::test]
    async fn failing_task_does_not_abort_siblings() {
        let mut plumbing = Plumbing::new();
        let broken = tokio_test::io::Builder::new()
            .read_error(io::Error::other("boom"))
            .build();
        let (mut rd, wr) = tokio::io::duplex(64);
        let _ = plumbing.spawn_pipe("broken", broken, tokio::io::sink());
        let _ = plumbing.spawn_pipe("ok", &b"fine"[..], wr);

        plumbing.wait(None, &CancellationToken::new()).await.unwrap();

        let mut out = String::new();
        rd.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "fine");
    }

    #[tokio::test]
    async fn wait_times_out_on_stuck_task() {
        let mut plumbing = Plumbing::new();
        // writer kept alive: the reader never sees EOF
        let (rd, _wr) = tokio::io::duplex(64);
        let _ = plumbing.spawn_pipe("stuck", rd, tokio::io::sink());

        let started = std::time::Instant::now();
        let err = plumbing
            .wait(Some(Duration::from_millis(100)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, PlumbingError::TimedOut(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn wait_observes_cancellation() {
        let mut plumbing = Plumbing::new();
        let (rd, _wr) = tokio::io::duplex(64);
        let _ = plumbing.spawn_pipe("stuck", rd, tokio::io::sink());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = plumbing.wait(None, &cancel).await.unwrap_err();
        assert_eq!(err, PlumbingError::Cancelled);
    }

    #[tokio::test]
    async fn abort_handle_outlives_detach() {
        let mut plumbing = Plumbing::new();
        let (rd, _wr) = tokio::io::duplex(64);
        let (mut out_rd, out_wr) = tokio::io::duplex(64);
        let handle = plumbing.spawn_pipe("stuck", rd, out_wr);

        let err = plumbing
            .wait(Some(Duration::from_millis(10)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PlumbingError::TimedOut(_)));

        // aborting drops the task's writer, so the reader sees EOF
        handle.abort();
        let mut out = Vec::new();
        out_rd.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn log_writer_splits_lines() {
        let mut writer = LogWriter::new("unit");
        writer.write_all(b"first\nsec").await.unwrap();
        assert_eq!(writer.buf, b"sec");
        writer.write_all(b"ond\r\n").await.unwrap();
        assert!(writer.buf.is_empty());
        writer.write_all(b"tail").await.unwrap();
        writer.shutdown().await.unwrap();
        assert!(writer.buf.is_empty());
    }

    #[tokio::test]
    async fn log_writer_bounds_unterminated_lines() {
        let mut writer = LogWriter::new("unit");
        writer.write_all(&vec![b'x'; MAX_LOG_LINE + 1]).await.unwrap();
        assert!(writer.buf.is_empty());
    }
}
