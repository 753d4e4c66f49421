//! Idle guard for dialed connections.

use std::io;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Fails any read or write that makes no progress for a whole idle window,
/// so a quiet fronted connection is torn down instead of lingering, even
/// when its holder never gets around to closing it. Dropping the wrapper
/// closes the underlying socket.
pub(crate) struct IdleTimeout<S> {
    inner: S,
    window: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, window: Duration) -> Self {
        Self {
            inner,
            window,
            deadline: Box::pin(tokio::time::sleep(window)),
        }
    }

    fn record_activity(&mut self) {
        let next = Instant::now() + self.window;
        self.deadline.as_mut().reset(next);
    }

    fn idle_expired(&mut self, cx: &mut Context<'_>) -> bool {
        self.deadline.as_mut().poll(cx).is_ready()
    }
}

fn idle_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout")
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.record_activity();
                Poll::Ready(result)
            }
            Poll::Pending if this.idle_expired(cx) => Poll::Ready(Err(idle_error())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.record_activity();
                Poll::Ready(result)
            }
            Poll::Pending if this.idle_expired(cx) => Poll::Ready(Err(idle_error())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending if this.idle_expired(cx) => Poll::Ready(Err(idle_error())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn read_fails_once_the_window_passes() {
        let (a, b) = tokio::io::duplex(64);
        let mut guarded = IdleTimeout::new(a, Duration::from_secs(70));

        let started = Instant::now();
        let mut buf = [0u8; 8];
        let err = guarded.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(70));
        drop(b);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_the_window() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut guarded = IdleTimeout::new(a, Duration::from_secs(70));

        tokio::time::sleep(Duration::from_secs(40)).await;
        b.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        guarded.read_exact(&mut buf).await.unwrap();

        // The clock restarts at the read; the next timeout lands a full
        // window later, not 30 seconds from now.
        let after_read = Instant::now();
        let err = guarded.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(after_read.elapsed() >= Duration::from_secs(70));
        drop(b);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_pass_through_while_active() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut guarded = IdleTimeout::new(a, Duration::from_secs(70));

        guarded.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
