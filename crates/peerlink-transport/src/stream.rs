//! Stream that replays sniffed bytes.
//!
//! The preamble selector consumes the first bytes of a connection before the
//! TLS layer exists. When the connection turns out not to be a probe those
//! bytes are replayed to the TLS acceptor ahead of the socket.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// `inner` preceded by a fixed prefix on the read side.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    /// Read `prefix` first, then `inner`.
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn prefix_is_read_before_inner() {
        let (local, mut remote) = duplex(64);
        remote.write_all(b" world").await.unwrap();
        drop(remote);

        let mut stream = PrefixedStream::new(Bytes::from_static(b"hello"), local);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn small_reads_split_the_prefix() {
        let (local, _remote) = duplex(64);
        let mut stream = PrefixedStream::new(Bytes::from_static(b"abc"), local);
        let mut byte = [0u8; 1];
        for expected in b"abc" {
            stream.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte[0], *expected);
        }
    }

    #[tokio::test]
    async fn writes_go_to_inner() {
        let (local, mut remote) = duplex(64);
        let mut stream = PrefixedStream::new(Bytes::from_static(b"ignored"), local);
        stream.write_all(b"out").await.unwrap();
        let mut buf = [0u8; 3];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"out");
    }
}
