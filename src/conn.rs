//! Transport wrapper owned by a session.
//!
//! A [`Conn`] erases the concrete byte stream (TCP, TLS, in-memory pipe) and
//! remembers whether it was already secured when handed over, which is how
//! the session constructor learns to set the `SECURE` state bit without
//! negotiating the upgrade itself.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A connected bidirectional byte stream usable as a session transport.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// The transport a session reads from and writes to.
///
/// Negotiation features that change the wire (a TLS upgrade, say) hand the
/// session a replacement `Conn`; the session discards its XML state and
/// rebuilds on the new bytes.
pub struct Conn {
    io: Box<dyn Transport>,
    secure: bool,
}

impl Conn {
    /// Wraps a plaintext transport.
    pub fn new(io: impl Transport + 'static) -> Conn {
        Conn {
            io: Box::new(io),
            secure: false,
        }
    }

    /// Wraps a transport that is already secured (TLS, or an equivalent
    /// pre-secured channel such as WebSockets over HTTPS).
    pub fn secure(io: impl Transport + 'static) -> Conn {
        Conn {
            io: Box::new(io),
            secure: true,
        }
    }

    /// True if the transport was marked secure at construction.
    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").field("secure", &self.secure).finish()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_conn_passes_bytes_through() {
        let (a, b) = tokio::io::duplex(64);
        let mut conn = Conn::new(a);
        let mut peer = Conn::secure(b);
        assert!(!conn.is_secure());
        assert!(peer.is_secure());

        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();
        let mut read = [0u8; 4];
        peer.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"ping");
    }
}
