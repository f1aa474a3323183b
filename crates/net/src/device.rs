use crate::FrameIO;
use smoltcp::phy::{Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::task::{Context, Poll};

/// Wraps a [`FrameIO`] to implement smoltcp's `Device` trait.
///
/// Checksum-offload flags advertised by the link are translated into the
/// device capabilities so the stack neither re-validates inbound checksums
/// nor computes outbound ones when the link claims to handle them.
pub struct LinkDevice<F: FrameIO> {
    frame_io: F,
    rx_buffer: Vec<u8>,
    rx_len: Option<usize>,
    injected: VecDeque<Vec<u8>>,
    tx_buffer: Vec<u8>,
    medium: Medium,
    checksum: ChecksumCapabilities,
    closed: bool,
}

impl<F: FrameIO> LinkDevice<F> {
    pub fn new(
        frame_io: F,
        ethernet_header: bool,
        rx_checksum_offload: bool,
        tx_checksum_offload: bool,
    ) -> Self {
        let mtu = frame_io.mtu();
        let capacity = mtu + if ethernet_header { 14 } else { 0 };
        Self {
            frame_io,
            rx_buffer: vec![0u8; capacity],
            rx_len: None,
            injected: VecDeque::new(),
            tx_buffer: vec![0u8; capacity],
            medium: if ethernet_header {
                Medium::Ethernet
            } else {
                Medium::Ip
            },
            checksum: checksum_capabilities(rx_checksum_offload, tx_checksum_offload),
            closed: false,
        }
    }

    /// Poll for an incoming frame. Call this before each smoltcp poll.
    /// Returns `false` once the underlying transport is gone.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> bool {
        if self.closed {
            return false;
        }
        if self.rx_len.is_some() {
            return true;
        }

        match self.frame_io.poll_recv(cx, &mut self.rx_buffer) {
            Poll::Ready(Ok(len)) => {
                self.rx_len = Some(len);
                true
            }
            Poll::Ready(Err(e)) => {
                tracing::warn!(error = %e, "frame transport closed");
                self.closed = true;
                false
            }
            Poll::Pending => true,
        }
    }

    /// Check if there's a pending frame to process.
    pub fn has_pending_rx(&self) -> bool {
        self.rx_len.is_some()
    }

    /// Peek at the pending received frame without consuming it.
    pub fn peek_rx(&self) -> Option<&[u8]> {
        self.rx_len.map(|len| &self.rx_buffer[..len])
    }

    /// Discard the pending received frame without processing it.
    /// Use this after handling a frame externally (e.g. a forwarder took it).
    pub fn discard_rx(&mut self) {
        self.rx_len = None;
    }

    /// Queue a frame for delivery to the stack ahead of link traffic.
    /// Used to feed back a deferred SYN once its host dial has resolved.
    pub fn inject_rx(&mut self, frame: Vec<u8>) {
        self.injected.push_back(frame);
    }

}

/// Translate link offload flags into the stack's checksum strategy. Also
/// used by the forwarders so crafted frames match what the stack would
/// emit.
///
/// Offload covers transport checksums only. The IPv4 header checksum is
/// always computed and verified: the datagram link carries no offload
/// metadata, so a frame with a zero header checksum is just a bad frame.
pub(crate) fn checksum_capabilities(rx_offload: bool, tx_offload: bool) -> ChecksumCapabilities {
    let strategy = match (rx_offload, tx_offload) {
        (true, true) => Checksum::None,
        // RX offloaded: inbound frames arrive pre-validated.
        (true, false) => Checksum::Tx,
        // TX offloaded: the link fills in outbound checksums.
        (false, true) => Checksum::Rx,
        (false, false) => Checksum::Both,
    };
    let mut caps = ChecksumCapabilities::default();
    caps.ipv4 = Checksum::Both;
    caps.tcp = strategy;
    caps.udp = strategy;
    caps.icmpv4 = strategy;
    caps.icmpv6 = strategy;
    caps
}

impl<F: FrameIO> Device for LinkDevice<F> {
    type RxToken<'a>
        = LinkRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = LinkTxToken<'a, F>
    where
        Self: 'a;

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.frame_io.mtu();
        caps.medium = self.medium;
        caps.checksum = self.checksum.clone();
        caps
    }

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = if let Some(frame) = self.injected.pop_front() {
            frame
        } else {
            let len = self.rx_len.take()?;
            self.rx_buffer[..len].to_vec()
        };

        let rx_token = LinkRxToken { frame };
        let tx_token = LinkTxToken { device: self };
        Some((rx_token, tx_token))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(LinkTxToken { device: self })
    }
}

/// Receive token for smoltcp.
pub struct LinkRxToken {
    frame: Vec<u8>,
}

impl RxToken for LinkRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.frame)
    }
}

/// Transmit token for smoltcp.
pub struct LinkTxToken<'a, F: FrameIO> {
    device: &'a mut LinkDevice<F>,
}

impl<F: FrameIO> TxToken for LinkTxToken<'_, F> {
    fn consume<R, Func>(self, len: usize, f: Func) -> R
    where
        Func: FnOnce(&mut [u8]) -> R,
    {
        let buf = &mut self.device.tx_buffer[..len];
        let result = f(buf);
        if let Err(e) = self.device.frame_io.send(buf) {
            tracing::warn!(error = %e, "frame send failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offload_maps_to_checksum_strategy() {
        assert!(matches!(checksum_capabilities(true, true).udp, Checksum::None));
        assert!(matches!(checksum_capabilities(true, false).udp, Checksum::Tx));
        assert!(matches!(checksum_capabilities(false, true).udp, Checksum::Rx));
        assert!(matches!(checksum_capabilities(false, false).udp, Checksum::Both));
    }

    #[test]
    fn ipv4_header_checksum_is_never_offloaded() {
        for (rx, tx) in [(true, true), (true, false), (false, true), (false, false)] {
            assert!(matches!(checksum_capabilities(rx, tx).ipv4, Checksum::Both));
        }
    }
}
