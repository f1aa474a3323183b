//! Guest-to-host TCP forwarding.
//!
//! A new guest SYN never reaches the stack directly: the classifier hands
//! it here, the host dial runs first, and only a successful dial feeds the
//! SYN into a listening stack socket. The guest therefore sees no SYN-ACK
//! for a connection the host refused — a refused dial answers with a
//! crafted RST, anything else stays silent and the guest's own
//! retransmission drives the retry.
//!
//! Established connections are spliced bidirectionally with half-close
//! propagation: EOF on one side closes the peer's write half and lets the
//! other direction drain.

use crate::craft;
use crate::link::FrameSender;
use crate::nat::NatTable;
use crate::stack::StackCommand;
use crate::stream::VirtualStream;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{EthernetAddress, TcpSeqNumber};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Identity of one forwarded TCP flow, from the guest's point of view.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FlowTuple {
    /// Guest source tuple.
    pub client: SocketAddr,
    /// Guest-visible destination tuple.
    pub dest: SocketAddr,
}

/// A deferred SYN waiting on its host dial.
pub(crate) struct SynPacket {
    pub tuple: FlowTuple,
    pub isn: TcpSeqNumber,
    pub guest_mac: EthernetAddress,
    pub frame: Vec<u8>,
}

/// Outcome of a host dial, reported back to the stack loop.
pub(crate) enum DialResult {
    /// The host accepted; feed the deferred SYN and splice once the
    /// handshake completes.
    Connected { host: TcpStream, syn: SynPacket },
    /// The dial failed and any guest-visible signalling already happened.
    Failed,
}

pub struct TcpForwarder {
    nat: Arc<NatTable>,
    frames: FrameSender,
    gateway_mac: EthernetAddress,
    caps: ChecksumCapabilities,
    dial_timeout: Option<Duration>,
}

impl TcpForwarder {
    pub fn new(
        nat: Arc<NatTable>,
        frames: FrameSender,
        gateway_mac: EthernetAddress,
        caps: ChecksumCapabilities,
        dial_timeout: Option<Duration>,
    ) -> Self {
        Self {
            nat,
            frames,
            gateway_mac,
            caps,
            dial_timeout,
        }
    }

    /// Dial the host counterpart of a new guest connection in the
    /// background and report the outcome to the stack loop.
    pub(crate) fn spawn_dial(&self, syn: SynPacket, events: mpsc::Sender<StackCommand>) {
        let nat = self.nat.clone();
        let frames = self.frames.clone();
        let gateway_mac = self.gateway_mac;
        let caps = self.caps.clone();
        let dial_timeout = self.dial_timeout;

        tokio::spawn(async move {
            let tuple = syn.tuple;
            let target = SocketAddr::new(nat.resolve(tuple.dest.ip()), tuple.dest.port());

            let connect = TcpStream::connect(target);
            let dialed = match dial_timeout {
                Some(limit) => match tokio::time::timeout(limit, connect).await {
                    Ok(result) => result,
                    Err(_) => Err(io::ErrorKind::TimedOut.into()),
                },
                None => connect.await,
            };

            let result = match dialed {
                Ok(host) => {
                    let _ = host.set_nodelay(true);
                    trace!(client = %tuple.client, %target, "host dial succeeded");
                    DialResult::Connected { host, syn }
                }
                Err(e) if is_refusal(&e) => {
                    debug!(client = %tuple.client, %target, error = %e, "host refused, sending RST");
                    if let Some(rst) = craft::tcp_rst_frame(
                        tuple.dest,
                        tuple.client,
                        syn.isn,
                        gateway_mac,
                        syn.guest_mac,
                        &caps,
                    ) {
                        let _ = frames.send(rst).await;
                    }
                    DialResult::Failed
                }
                Err(e) => {
                    // Unreachable / timed out / anything else: stay silent,
                    // the guest's SYN retransmit will try again.
                    debug!(client = %tuple.client, %target, error = %e, "host dial failed");
                    DialResult::Failed
                }
            };

            let _ = events
                .send(StackCommand::DialFinished { tuple, result })
                .await;
        });
    }
}

/// Whether a dial error maps to an RST for the guest (as opposed to a
/// silent drop).
fn is_refusal(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Splice a virtual connection against a host socket until both directions
/// are finished.
///
/// Clean EOF on one side write-half-closes the other and keeps the reverse
/// direction alive; a hard error tears both down immediately. Returns the
/// byte counts (guest→host, host→guest).
pub(crate) async fn splice(
    virt: VirtualStream,
    host: TcpStream,
    buffer: usize,
) -> io::Result<(u64, u64)> {
    let peer = virt.remote_addr();
    let (virt_read, mut virt_write) = tokio::io::split(virt);
    let (host_read, mut host_write) = host.into_split();

    let guest_to_host = async move {
        let mut reader = BufReader::with_capacity(buffer, virt_read);
        let copied = tokio::io::copy_buf(&mut reader, &mut host_write).await?;
        host_write.shutdown().await?;
        Ok::<u64, io::Error>(copied)
    };

    let host_to_guest = async move {
        let mut reader = BufReader::with_capacity(buffer, host_read);
        let copied = tokio::io::copy_buf(&mut reader, &mut virt_write).await?;
        virt_write.shutdown().await?;
        Ok::<u64, io::Error>(copied)
    };

    match tokio::try_join!(guest_to_host, host_to_guest) {
        Ok((up, down)) => {
            trace!(%peer, up, down, "splice finished");
            Ok((up, down))
        }
        Err(e) => {
            warn!(%peer, error = %e, "splice aborted");
            Err(e)
        }
    }
}

/// Run a splice in the background, discarding its outcome (it logs for
/// itself).
pub(crate) fn spawn_splice(virt: VirtualStream, host: TcpStream, buffer: usize) {
    tokio::spawn(async move {
        let _ = splice(virt, host, buffer).await;
    });
}
