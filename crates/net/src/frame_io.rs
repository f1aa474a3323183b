use std::io;
use std::task::{Context, Poll};

/// Abstraction for frame transport between the link and the stack.
///
/// This trait decouples the stack's device adapter from the actual
/// transport: the datagram descriptor pair shared with the VM in
/// production, or an in-memory channel pair in tests.
pub trait FrameIO: Send + 'static {
    /// Maximum transmission unit (payload bytes, excluding any Ethernet
    /// header).
    fn mtu(&self) -> usize {
        1500
    }

    /// Poll for an incoming frame.
    ///
    /// Returns the number of bytes read into `buf` when a frame is
    /// available. An error means the transport is gone for good.
    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>>;

    /// Send a frame. Implementations may drop frames under backpressure but
    /// must never split one.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}
