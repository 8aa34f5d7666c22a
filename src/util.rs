//! Data-plane helpers: bounded bidirectional copies and a prebuffering
//! reader used to parse a response head before streaming the rest.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;
use tracing::trace;

const INITIAL_CAPACITY: usize = 4 * 1024;
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Bidirectionally forward data between two reader/writer pairs.
///
/// Each direction shuts down its write side when its copy finishes so the
/// peer observes EOF; both directions are awaited before returning.
pub(crate) async fn forward_bidi(
    downstream_recv: &mut (impl AsyncRead + Send + Unpin),
    downstream_send: &mut (impl AsyncWrite + Send + Unpin),
    upstream_recv: &mut (impl AsyncRead + Send + Unpin),
    upstream_send: &mut (impl AsyncWrite + Send + Unpin),
) -> (u64, u64) {
    let (down_to_up, up_to_down) = tokio::join!(
        async {
            let res = tokio::io::copy(downstream_recv, upstream_send).await;
            upstream_send.shutdown().await.ok();
            trace!(?res, "forward down-to-up finished");
            res.unwrap_or(0)
        },
        async {
            let res = tokio::io::copy(upstream_recv, downstream_send).await;
            downstream_send.shutdown().await.ok();
            trace!(?res, "forward up-to-down finished");
            res.unwrap_or(0)
        }
    );
    (down_to_up, up_to_down)
}

/// Copies `src` to `dst` with a total byte cap and a per-read idle timeout.
///
/// Returns the bytes written alongside the terminating condition, so callers
/// can report transfer totals even when the cap fired mid-stream.
pub(crate) async fn copy_with_limits(
    src: &mut (impl AsyncRead + Send + Unpin),
    dst: &mut (impl AsyncWrite + Send + Unpin),
    max_bytes: u64,
    idle_timeout: Duration,
) -> (u64, io::Result<()>) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written: u64 = 0;
    loop {
        let n = match timeout(idle_timeout, src.read(&mut buf)).await {
            Err(_) => {
                return (
                    written,
                    Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
                );
            }
            Ok(Err(err)) => return (written, Err(err)),
            Ok(Ok(0)) => return (written, Ok(())),
            Ok(Ok(n)) => n,
        };
        written += n as u64;
        if written > max_bytes {
            return (
                written,
                Err(io::Error::other("transfer limit exceeded")),
            );
        }
        if let Err(err) = dst.write_all(&buf[..n]).await {
            return (written, Err(err));
        }
    }
}

/// An `AsyncRead` wrapper that accumulates input for inspection before
/// falling through to the inner reader.
///
/// Used to parse an HTTP head off a raw stream without losing the bytes
/// that arrived behind it.
pub(crate) struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    pub(crate) fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_len,
        }
    }

    /// The unconsumed buffered bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() == self.max_len
    }

    /// Drops `n` bytes from the front of the buffer.
    pub(crate) fn discard(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// Reads more data from the inner reader into the buffer, up to the
    /// configured limit. Returns the number of bytes added.
    pub(crate) async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        let n = (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prebuffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}
