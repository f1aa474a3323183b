//! UDP forwarding with connection tracking.
//!
//! Datagrams from the guest to non-gateway destinations are bridged onto
//! per-flow host sockets. Each tracked flow owns one connected kernel UDP
//! socket and one reply task; replies are crafted back to the guest's
//! original source tuple with the pre-NAT destination as their source. The
//! reverse index keyed by the host socket's local endpoint lets the ICMP
//! relay attribute "time exceeded" errors to the right guest flow.

use crate::conntrack::{ActivityClock, ExternalEntry, ExternalIndex, UdpFlowKey, next_generation};
use crate::craft;
use crate::link::FrameSender;
use crate::nat::NatTable;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::EthernetAddress;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const UDP_MAX_DATAGRAM: usize = 65535;

/// One guest datagram headed out of the virtual network, as parsed by the
/// frame classifier.
#[derive(Clone, Debug)]
pub(crate) struct UdpDatagram {
    /// Guest source tuple.
    pub client: SocketAddr,
    /// Guest-visible destination tuple.
    pub dest: SocketAddr,
    /// TTL / hop limit the datagram arrived with.
    pub ttl: u8,
    pub guest_mac: EthernetAddress,
    pub payload: Vec<u8>,
}

#[derive(Clone)]
pub struct UdpForwarder {
    inner: Arc<Inner>,
}

struct Inner {
    nat: Arc<NatTable>,
    frames: FrameSender,
    external: Arc<ExternalIndex>,
    conntrack: Mutex<HashMap<UdpFlowKey, UdpEntry>>,
    gateway_mac: EthernetAddress,
    caps: ChecksumCapabilities,
    idle_timeout: Duration,
    propagate_ttl: bool,
}

struct UdpEntry {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    generation: u64,
    last_ttl: u8,
    activity: Arc<ActivityClock>,
    task: JoinHandle<()>,
}

impl UdpForwarder {
    pub fn new(
        nat: Arc<NatTable>,
        frames: FrameSender,
        external: Arc<ExternalIndex>,
        gateway_mac: EthernetAddress,
        caps: ChecksumCapabilities,
        idle_timeout: Duration,
        propagate_ttl: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                nat,
                frames,
                external,
                conntrack: Mutex::new(HashMap::new()),
                gateway_mac,
                caps,
                idle_timeout,
                propagate_ttl,
            }),
        }
    }

    /// Forward one guest datagram, creating flow state on first sight.
    ///
    /// Dial failures are logged and the datagram is dropped without
    /// retaining state.
    pub(crate) async fn handle_outbound(&self, dgram: UdpDatagram) {
        let inner = &self.inner;
        let key = UdpFlowKey::new(dgram.client, dgram.dest);

        let socket = {
            let mut conntrack = inner.conntrack.lock().unwrap();
            match conntrack.get_mut(&key) {
                Some(entry) => {
                    entry.activity.touch();
                    if inner.propagate_ttl && entry.last_ttl != dgram.ttl {
                        entry.last_ttl = dgram.ttl;
                        if let Err(e) = set_hop_limit(&entry.socket, dgram.dest, dgram.ttl) {
                            debug!(error = %e, "TTL propagation failed");
                        }
                    }
                    Some(entry.socket.clone())
                }
                None => None,
            }
        };

        let socket = match socket {
            Some(socket) => socket,
            None => match self.create_flow(key, &dgram).await {
                Some(socket) => socket,
                None => return,
            },
        };

        match socket.send(&dgram.payload).await {
            Ok(_) => {
                trace!(
                    client = %dgram.client,
                    dest = %dgram.dest,
                    len = dgram.payload.len(),
                    "UDP forwarded"
                );
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                debug!(dest = %dgram.dest, "UDP send hit ENOBUFS, dropping datagram");
            }
            Err(e) => {
                warn!(error = %e, dest = %dgram.dest, "UDP send failed, terminating flow");
                self.reap(key);
            }
        }
    }

    async fn create_flow(&self, key: UdpFlowKey, dgram: &UdpDatagram) -> Option<Arc<UdpSocket>> {
        let inner = &self.inner;
        let resolved = inner.nat.resolve(dgram.dest.ip());
        let target = SocketAddr::new(resolved, dgram.dest.port());
        let bind_addr: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(error = %e, "UDP bind failed");
                return None;
            }
        };
        if let Err(e) = socket.connect(target).await {
            warn!(error = %e, dest = %target, "UDP connect failed");
            return None;
        }
        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(e) => {
                warn!(error = %e, "UDP local_addr failed");
                return None;
            }
        };

        let mut last_ttl = 0;
        if inner.propagate_ttl {
            last_ttl = dgram.ttl;
            if let Err(e) = set_hop_limit(&socket, target, dgram.ttl) {
                debug!(error = %e, "TTL propagation failed");
            }
        }

        let generation = next_generation();
        let activity = Arc::new(ActivityClock::new());
        activity.touch();

        inner.external.insert(
            local,
            ExternalEntry {
                client: dgram.client,
                client_mac: dgram.guest_mac,
                generation,
            },
        );

        let task = tokio::spawn(reply_loop(ReplyLoop {
            inner: inner.clone(),
            socket: socket.clone(),
            key,
            local,
            generation,
            client: dgram.client,
            dest: dgram.dest,
            guest_mac: dgram.guest_mac,
            activity: activity.clone(),
        }));

        debug!(client = %dgram.client, dest = %dgram.dest, %local, "UDP flow created");

        let mut conntrack = inner.conntrack.lock().unwrap();
        conntrack.insert(
            key,
            UdpEntry {
                socket: socket.clone(),
                local,
                generation,
                last_ttl,
                activity,
                task,
            },
        );
        Some(socket)
    }

    /// Tear a flow down immediately and schedule the reverse-index entry for
    /// delayed removal.
    fn reap(&self, key: UdpFlowKey) {
        let inner = &self.inner;
        let removed = {
            let mut conntrack = inner.conntrack.lock().unwrap();
            conntrack.remove(&key)
        };
        if let Some(entry) = removed {
            entry.task.abort();
            schedule_external_removal(inner, entry.local, entry.generation);
        }
    }

    /// Abort every reply task and drop all flow state.
    pub fn shutdown(&self) {
        let mut conntrack = self.inner.conntrack.lock().unwrap();
        for (_, entry) in conntrack.drain() {
            entry.task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_flows(&self) -> usize {
        self.inner.conntrack.lock().unwrap().len()
    }
}

struct ReplyLoop {
    inner: Arc<Inner>,
    socket: Arc<UdpSocket>,
    key: UdpFlowKey,
    local: SocketAddr,
    generation: u64,
    client: SocketAddr,
    dest: SocketAddr,
    guest_mac: EthernetAddress,
    activity: Arc<ActivityClock>,
}

/// Read replies from the host socket until the flow goes idle or fails,
/// then reap the conntrack entry.
async fn reply_loop(ctx: ReplyLoop) {
    let mut buf = vec![0u8; UDP_MAX_DATAGRAM];
    loop {
        let deadline = ctx.activity.deadline(ctx.inner.idle_timeout);
        match tokio::time::timeout_at(deadline, ctx.socket.recv(&mut buf)).await {
            Err(_elapsed) => {
                // Guest traffic may have moved the deadline while we waited.
                if ctx.activity.deadline(ctx.inner.idle_timeout) > tokio::time::Instant::now() {
                    continue;
                }
                debug!(client = %ctx.client, dest = %ctx.dest, "UDP flow idle, reaping");
                break;
            }
            Ok(Ok(len)) => {
                ctx.activity.touch();
                let frame = craft::udp_frame(
                    ctx.dest,
                    ctx.client,
                    &buf[..len],
                    ctx.inner.gateway_mac,
                    ctx.guest_mac,
                    &ctx.inner.caps,
                );
                match frame {
                    Some(frame) => {
                        if ctx.inner.frames.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            // The previous send found no listener; keep reading until the
            // idle timeout reaps the flow.
            Ok(Err(e)) if e.raw_os_error() == Some(libc::ECONNREFUSED) => continue,
            Ok(Err(e)) => {
                debug!(error = %e, client = %ctx.client, "UDP reply read failed");
                break;
            }
        }
    }

    {
        let mut conntrack = ctx.inner.conntrack.lock().unwrap();
        if conntrack
            .get(&ctx.key)
            .is_some_and(|e| e.generation == ctx.generation)
        {
            conntrack.remove(&ctx.key);
        }
    }
    schedule_external_removal(&ctx.inner, ctx.local, ctx.generation);
}

fn schedule_external_removal(inner: &Arc<Inner>, local: SocketAddr, generation: u64) {
    let external = inner.external.clone();
    let delay = inner.idle_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        external.remove_if(local, generation);
    });
}

fn set_hop_limit(socket: &UdpSocket, target: SocketAddr, ttl: u8) -> std::io::Result<()> {
    match target {
        SocketAddr::V4(_) => socket.set_ttl(ttl as u32),
        SocketAddr::V6(_) => {
            let sock = socket2::SockRef::from(socket);
            sock.set_unicast_hops_v6(ttl as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::{EthernetFrame, Ipv4Packet, UdpPacket};
    use std::net::IpAddr;
    use tokio::sync::mpsc;

    const GW_MAC: EthernetAddress = EthernetAddress([0x24, 0xd2, 0xf4, 0x58, 0x34, 0xd7]);
    const GUEST_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

    fn forwarder(idle: Duration) -> (UdpForwarder, mpsc::Receiver<Vec<u8>>, Arc<ExternalIndex>) {
        let (tx, rx) = mpsc::channel(64);
        let external = Arc::new(ExternalIndex::new());
        let fwd = UdpForwarder::new(
            Arc::new(NatTable::new([])),
            tx,
            external.clone(),
            GW_MAC,
            ChecksumCapabilities::default(),
            idle,
            true,
        );
        (fwd, rx, external)
    }

    async fn spawn_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..len], peer).await;
            }
        });
        addr
    }

    fn datagram(dest: SocketAddr, payload: &[u8]) -> UdpDatagram {
        UdpDatagram {
            client: "198.19.248.2:40000".parse().unwrap(),
            dest,
            ttl: 64,
            guest_mac: GUEST_MAC,
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn echo_reply_reaches_the_guest_tuple() {
        let echo = spawn_echo().await;
        let (fwd, mut frames, external) = forwarder(Duration::from_secs(90));

        fwd.handle_outbound(datagram(echo, b"ping")).await;

        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .expect("reply frame")
            .unwrap();

        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.dst_addr(), GUEST_MAC);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(IpAddr::V4(ip.src_addr()), echo.ip());
        assert_eq!(ip.dst_addr(), Ipv4Addr::new(198, 19, 248, 2));
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), echo.port());
        assert_eq!(udp.dst_port(), 40000);
        assert_eq!(udp.payload(), b"ping");

        // The reverse index points the host-local endpoint back at the guest.
        assert_eq!(fwd.tracked_flows(), 1);
        let entry = {
            let conntrack = fwd.inner.conntrack.lock().unwrap();
            conntrack.values().next().unwrap().local
        };
        let found = external.lookup(entry.ip(), entry.port()).unwrap();
        assert_eq!(found.client, "198.19.248.2:40000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn same_flow_reuses_the_socket() {
        let echo = spawn_echo().await;
        let (fwd, mut frames, _) = forwarder(Duration::from_secs(90));

        fwd.handle_outbound(datagram(echo, b"one")).await;
        fwd.handle_outbound(datagram(echo, b"two")).await;
        assert_eq!(fwd.tracked_flows(), 1);

        // Both replies come back.
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(2), frames.recv())
                .await
                .expect("reply frame")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn idle_timeout_reaps_conntrack_then_external() {
        // A destination that never answers.
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = sink.local_addr().unwrap();

        let (fwd, _frames, external) = forwarder(Duration::from_millis(50));
        fwd.handle_outbound(datagram(dest, b"probe")).await;
        assert_eq!(fwd.tracked_flows(), 1);
        assert_eq!(external.len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fwd.tracked_flows(), 0);

        // The reverse index survives one extra idle period, then goes too.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(external.len(), 0);
    }

    #[tokio::test]
    async fn new_datagram_after_reap_creates_fresh_flow() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = sink.local_addr().unwrap();

        let (fwd, _frames, _) = forwarder(Duration::from_millis(50));
        fwd.handle_outbound(datagram(dest, b"first")).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fwd.tracked_flows(), 0);

        fwd.handle_outbound(datagram(dest, b"second")).await;
        assert_eq!(fwd.tracked_flows(), 1);
    }
}
