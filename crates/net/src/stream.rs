//! Virtual TCP connection handles.
//!
//! The stack loop services smoltcp sockets and bridges their buffers to a
//! channel pair; [`VirtualStream`] presents that pair as a standard
//! `AsyncRead + AsyncWrite` stream so forwarders can splice it against a
//! host socket. An empty chunk is the in-band EOF marker in both
//! directions; dropping the stream without `shutdown` tells the stack to
//! abort the connection instead of finishing it.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;

/// Capacity (in chunks) of each per-flow channel.
pub(crate) const FLOW_CHANNEL_DEPTH: usize = 32;

pub struct VirtualStream {
    rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_closed: bool,
    shutdown_sent: bool,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl VirtualStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<Vec<u8>>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            rx,
            tx,
            read_buf: Vec::new(),
            read_pos: 0,
            read_closed: false,
            shutdown_sent: false,
            local_addr,
            remote_addr,
        }
    }

    /// Address of this end of the virtual connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the peer inside the guest network.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl tokio::io::AsyncRead for VirtualStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Drain buffered data first.
        if self.read_pos < self.read_buf.len() {
            let remaining = &self.read_buf[self.read_pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.read_pos += to_copy;
            if self.read_pos >= self.read_buf.len() {
                self.read_buf.clear();
                self.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        if self.read_closed {
            return Poll::Ready(Ok(())); // EOF
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                if data.is_empty() {
                    self.read_closed = true;
                    return Poll::Ready(Ok(())); // EOF marker
                }
                let to_copy = data.len().min(buf.remaining());
                buf.put_slice(&data[..to_copy]);
                if to_copy < data.len() {
                    self.read_buf = data;
                    self.read_pos = to_copy;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                self.read_closed = true;
                Poll::Ready(Ok(())) // channel closed = EOF
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl tokio::io::AsyncWrite for VirtualStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let data = buf.to_vec();
        let len = data.len();
        match self.tx.try_send(data) {
            Ok(()) => Poll::Ready(Ok(len)),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The stack loop drains this channel on its next pass.
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "virtual connection closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shutdown_sent {
            return Poll::Ready(Ok(()));
        }
        match self.tx.try_send(Vec::new()) {
            Ok(()) => {
                self.shutdown_sent = true;
                Poll::Ready(Ok(()))
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // The stack side is already gone; nothing left to close.
                self.shutdown_sent = true;
                Poll::Ready(Ok(()))
            }
        }
    }
}
