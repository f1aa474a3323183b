//! ICMP relay.
//!
//! Guest-originated ICMP is intercepted by the frame classifier before the
//! stack sees it, handed to this module over a channel, and re-emitted
//! through unprivileged `SOCK_DGRAM` ICMP sockets. Replies are read back,
//! their headers fixed up (outer destination, lengths, and for
//! time-exceeded errors the embedded offending packet), and re-injected
//! into the guest as complete frames.
//!
//! Source attribution: the kernel renumbers echo identifiers on ping
//! sockets, so replies cannot be matched by identifier. The cache is
//! instead keyed by the probed remote address per family, with a last-seen
//! fallback for anything unmatched. Concurrent guests pinging the same
//! destination remain ambiguous.

use crate::conntrack::ExternalIndex;
use crate::craft::{self, internet_checksum};
use crate::error::Result;
use crate::link::FrameSender;

use smoltcp::wire::{EthernetAddress, EthernetProtocol, IpProtocol, Ipv6Packet, Ipv6Repr};

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::{Arc, RwLock};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV4_DST_UNREACHABLE: u8 = 3;
const ICMPV4_TIME_EXCEEDED: u8 = 11;

const ICMPV6_DST_UNREACHABLE: u8 = 1;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Depth of the capture channels feeding the relay.
const CAPTURE_DEPTH: usize = 64;
/// Bound on cached probe targets before the cache is flushed.
const SOURCE_CACHE_LIMIT: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IcmpFamily {
    V4,
    V6,
}

/// A guest ICMP packet cloned out of the delivery path.
#[derive(Clone, Debug)]
pub(crate) struct CapturedIcmp {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub hop_limit: u8,
    pub guest_mac: EthernetAddress,
    /// The ICMP message, without the IP header.
    pub message: Vec<u8>,
}

/// Classifier-side handle: hands cloned packets to the relay.
#[derive(Clone)]
pub(crate) struct IcmpTap {
    v4: mpsc::Sender<CapturedIcmp>,
    v6: mpsc::Sender<CapturedIcmp>,
}

impl IcmpTap {
    #[cfg(test)]
    pub(crate) fn from_parts(
        v4: mpsc::Sender<CapturedIcmp>,
        v6: mpsc::Sender<CapturedIcmp>,
    ) -> Self {
        Self { v4, v6 }
    }

    pub(crate) fn capture(&self, family: IcmpFamily, captured: CapturedIcmp) {
        let tx = match family {
            IcmpFamily::V4 => &self.v4,
            IcmpFamily::V6 => &self.v6,
        };
        if tx.try_send(captured).is_err() {
            trace!("ICMP capture queue full, dropping packet");
        }
    }
}

/// Per-family cache of "which guest probed this remote".
pub(crate) struct SourceCache {
    v4: RwLock<HashMap<Ipv4Addr, (Ipv4Addr, EthernetAddress)>>,
    v6: RwLock<HashMap<Ipv6Addr, (Ipv6Addr, EthernetAddress)>>,
    last_v4: RwLock<Option<(Ipv4Addr, EthernetAddress)>>,
    last_v6: RwLock<Option<(Ipv6Addr, EthernetAddress)>>,
}

impl SourceCache {
    pub(crate) fn new() -> Self {
        Self {
            v4: RwLock::new(HashMap::new()),
            v6: RwLock::new(HashMap::new()),
            last_v4: RwLock::new(None),
            last_v6: RwLock::new(None),
        }
    }

    fn note(&self, captured: &CapturedIcmp) {
        match (captured.src, captured.dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let mut map = self.v4.write().unwrap();
                if map.len() >= SOURCE_CACHE_LIMIT && !map.contains_key(&dst) {
                    map.clear();
                }
                map.insert(dst, (src, captured.guest_mac));
                *self.last_v4.write().unwrap() = Some((src, captured.guest_mac));
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                let mut map = self.v6.write().unwrap();
                if map.len() >= SOURCE_CACHE_LIMIT && !map.contains_key(&dst) {
                    map.clear();
                }
                map.insert(dst, (src, captured.guest_mac));
                *self.last_v6.write().unwrap() = Some((src, captured.guest_mac));
            }
            _ => {}
        }
    }

    fn lookup_v4(&self, target: Ipv4Addr) -> Option<(Ipv4Addr, EthernetAddress)> {
        self.v4
            .read()
            .unwrap()
            .get(&target)
            .copied()
            .or(*self.last_v4.read().unwrap())
    }

    fn lookup_v6(&self, target: Ipv6Addr) -> Option<(Ipv6Addr, EthernetAddress)> {
        self.v6
            .read()
            .unwrap()
            .get(&target)
            .copied()
            .or(*self.last_v6.read().unwrap())
    }
}

/// The relay itself: two host sockets, a consumer task and a reply monitor
/// per family.
pub struct IcmpForwarder {
    tasks: Vec<JoinHandle<()>>,
}

impl IcmpForwarder {
    pub(crate) fn start(
        frames: FrameSender,
        external: Arc<ExternalIndex>,
        gateway_mac: EthernetAddress,
    ) -> Result<(Self, IcmpTap)> {
        let v4_socket = Arc::new(open_icmp_socket(
            Domain::IPV4,
            Protocol::ICMPV4,
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        )?);
        let v6_socket = Arc::new(open_icmp_socket(
            Domain::IPV6,
            Protocol::ICMPV6,
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        )?);

        let sources = Arc::new(SourceCache::new());

        let (v4_tx, v4_rx) = mpsc::channel(CAPTURE_DEPTH);
        let (v6_tx, v6_rx) = mpsc::channel(CAPTURE_DEPTH);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(consume(
            IcmpFamily::V4,
            v4_socket.clone(),
            v4_rx,
            sources.clone(),
        )));
        tasks.push(tokio::spawn(consume(
            IcmpFamily::V6,
            v6_socket.clone(),
            v6_rx,
            sources.clone(),
        )));
        tasks.push(tokio::spawn(monitor_v4(
            v4_socket,
            frames.clone(),
            sources.clone(),
            external.clone(),
            gateway_mac,
        )));
        tasks.push(tokio::spawn(monitor_v6(
            v6_socket,
            frames,
            sources,
            external,
            gateway_mac,
        )));

        Ok((Self { tasks }, IcmpTap { v4: v4_tx, v6: v6_tx }))
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for IcmpForwarder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_icmp_socket(
    domain: Domain,
    protocol: Protocol,
    bind: SocketAddr,
) -> io::Result<AsyncFd<Socket>> {
    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(bind))?;
    AsyncFd::new(socket)
}

/// Drain captured guest packets and push them out through the host socket.
async fn consume(
    family: IcmpFamily,
    socket: Arc<AsyncFd<Socket>>,
    mut captured: mpsc::Receiver<CapturedIcmp>,
    sources: Arc<SourceCache>,
) {
    while let Some(packet) = captured.recv().await {
        sources.note(&packet);

        let hop_limit = packet.hop_limit as u32;
        let result = match family {
            IcmpFamily::V4 => socket.get_ref().set_ttl(hop_limit),
            IcmpFamily::V6 => socket.get_ref().set_unicast_hops_v6(hop_limit),
        };
        if let Err(e) = result {
            debug!(error = %e, "hop-limit propagation failed");
        }

        // Best effort; ping sockets refuse anything but echo requests.
        if let Err(e) = send_to(&socket, &packet.message, SocketAddr::new(packet.dst, 0)).await {
            debug!(error = %e, dst = %packet.dst, "ICMP relay send failed");
        }
    }
}

async fn send_to(fd: &AsyncFd<Socket>, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    let target = SockAddr::from(addr);
    loop {
        let mut guard = fd.writable().await?;
        match guard.try_io(|inner| inner.get_ref().send_to(buf, &target)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn recv_raw(fd: &AsyncFd<Socket>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| {
            let raw = inner.as_raw_fd();
            let n = unsafe { libc::recv(raw, buf.as_mut_ptr() as *mut _, buf.len(), 0) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn recvfrom_v6(fd: &AsyncFd<Socket>, buf: &mut [u8]) -> io::Result<(usize, Ipv6Addr)> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| {
            let raw = inner.as_raw_fd();
            let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    raw,
                    buf.as_mut_ptr() as *mut _,
                    buf.len(),
                    0,
                    &mut addr as *mut _ as *mut libc::sockaddr,
                    &mut addr_len,
                )
            };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok((n as usize, Ipv6Addr::from(addr.sin6_addr.s6_addr)))
            }
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

/// Read IPv4 replies (full IP packets on these sockets), fix them up and
/// re-inject. All errors are per-packet; a closed socket ends the monitor.
async fn monitor_v4(
    socket: Arc<AsyncFd<Socket>>,
    frames: FrameSender,
    sources: Arc<SourceCache>,
    external: Arc<ExternalIndex>,
    gateway_mac: EthernetAddress,
) {
    let mut buf = vec![0u8; 65535];
    loop {
        let len = match recv_raw(&socket, &mut buf).await {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "ICMPv4 monitor closed");
                return;
            }
        };
        let mut packet = buf[..len].to_vec();
        let Some(guest_mac) = rewrite_v4_reply(&mut packet, &sources, &external) else {
            continue;
        };
        let frame = craft::ethernet_wrap(&packet, EthernetProtocol::Ipv4, gateway_mac, guest_mac);
        if frames.send(frame).await.is_err() {
            return;
        }
    }
}

/// Read ICMPv6 replies (message only), fix them up, wrap them in a fresh
/// IPv6 header and re-inject.
async fn monitor_v6(
    socket: Arc<AsyncFd<Socket>>,
    frames: FrameSender,
    sources: Arc<SourceCache>,
    external: Arc<ExternalIndex>,
    gateway_mac: EthernetAddress,
) {
    let mut buf = vec![0u8; 65535];
    loop {
        let (len, from) = match recvfrom_v6(&socket, &mut buf).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "ICMPv6 monitor closed");
                return;
            }
        };
        let mut message = buf[..len].to_vec();
        let Some((guest, guest_mac)) = rewrite_v6_reply(&mut message, from, &sources, &external)
        else {
            continue;
        };

        let mut packet = vec![0u8; craft::IPV6_HEADER_LEN + message.len()];
        let repr = Ipv6Repr {
            src_addr: from,
            dst_addr: guest,
            next_header: IpProtocol::Icmpv6,
            payload_len: message.len(),
            hop_limit: 64,
        };
        repr.emit(&mut Ipv6Packet::new_unchecked(&mut packet[..]));
        packet[craft::IPV6_HEADER_LEN..].copy_from_slice(&message);
        {
            let mut icmp =
                smoltcp::wire::Icmpv6Packet::new_unchecked(&mut packet[craft::IPV6_HEADER_LEN..]);
            icmp.fill_checksum(&from.into(), &guest.into());
        }

        let frame = craft::ethernet_wrap(&packet, EthernetProtocol::Ipv6, gateway_mac, guest_mac);
        if frames.send(frame).await.is_err() {
            return;
        }
    }
}

/// Fix up a received IPv4 ICMP packet in place for re-injection.
///
/// Returns the guest MAC to address the frame to, or `None` when the packet
/// should be dropped.
pub(crate) fn rewrite_v4_reply(
    packet: &mut [u8],
    sources: &SourceCache,
    external: &ExternalIndex,
) -> Option<EthernetAddress> {
    let len = packet.len();
    if len < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    let header_len = ((packet[0] & 0x0f) as usize) * 4;
    if header_len < 20 || len < header_len + 8 {
        return None;
    }

    // Some OSes report bogus total lengths; the receive size is
    // authoritative.
    packet[2..4].copy_from_slice(&(len as u16).to_be_bytes());

    let icmp_type = packet[header_len];
    let (guest, guest_mac) = match icmp_type {
        ICMPV4_ECHO_REPLY => {
            let remote = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
            sources.lookup_v4(remote)?
        }
        ICMPV4_TIME_EXCEEDED | ICMPV4_DST_UNREACHABLE => {
            rewrite_v4_embedded(packet, header_len, sources, external)?
        }
        _ => return None,
    };

    // Outer destination, then both checksums (innermost first).
    packet[16..20].copy_from_slice(&guest.octets());

    packet[header_len + 2..header_len + 4].copy_from_slice(&[0, 0]);
    let icmp_checksum = internet_checksum(&packet[header_len..]);
    packet[header_len + 2..header_len + 4].copy_from_slice(&icmp_checksum.to_be_bytes());

    packet[10..12].copy_from_slice(&[0, 0]);
    let ip_checksum = internet_checksum(&packet[..header_len]);
    packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    Some(guest_mac)
}

/// Rewrite the offending packet embedded in an ICMPv4 error so the guest
/// recognizes its own probe.
fn rewrite_v4_embedded(
    packet: &mut [u8],
    header_len: usize,
    sources: &SourceCache,
    external: &ExternalIndex,
) -> Option<(Ipv4Addr, EthernetAddress)> {
    let base = header_len + 8;
    let len = packet.len();
    // Embedded IP header plus at least 8 bytes of its transport header.
    if len < base + 20 + 8 {
        return None;
    }
    if packet[base] >> 4 != 4 {
        return None;
    }
    let emb_header_len = ((packet[base] & 0x0f) as usize) * 4;
    if emb_header_len < 20 || len < base + emb_header_len + 8 {
        return None;
    }

    let emb_total = (len - base) as u16;
    packet[base + 2..base + 4].copy_from_slice(&emb_total.to_be_bytes());

    let protocol = packet[base + 9];
    let result = match protocol {
        libc_proto::ICMP => {
            // The guest's own echo probe: restore its source address.
            let target = Ipv4Addr::new(
                packet[base + 16],
                packet[base + 17],
                packet[base + 18],
                packet[base + 19],
            );
            let (guest, mac) = sources.lookup_v4(target)?;
            packet[base + 12..base + 16].copy_from_slice(&guest.octets());
            (guest, mac)
        }
        libc_proto::UDP => {
            let l4 = base + emb_header_len;
            let emb_src = Ipv4Addr::new(
                packet[base + 12],
                packet[base + 13],
                packet[base + 14],
                packet[base + 15],
            );
            let emb_src_port = u16::from_be_bytes([packet[l4], packet[l4 + 1]]);
            let entry = external.lookup(IpAddr::V4(emb_src), emb_src_port)?;
            let SocketAddr::V4(client) = entry.client else {
                return None;
            };

            let mut old = [0u8; 6];
            old[..4].copy_from_slice(&packet[base + 12..base + 16]);
            old[4..].copy_from_slice(&packet[l4..l4 + 2]);
            let mut new = [0u8; 6];
            new[..4].copy_from_slice(&client.ip().octets());
            new[4..].copy_from_slice(&client.port().to_be_bytes());

            packet[base + 12..base + 16].copy_from_slice(&client.ip().octets());
            packet[l4..l4 + 2].copy_from_slice(&client.port().to_be_bytes());

            // Pseudo-header correction, only when a checksum was present.
            let udp_checksum = u16::from_be_bytes([packet[l4 + 6], packet[l4 + 7]]);
            if udp_checksum != 0 {
                let adjusted = craft::checksum_adjust(udp_checksum, &old, &new);
                packet[l4 + 6..l4 + 8].copy_from_slice(&adjusted.to_be_bytes());
            }
            (*client.ip(), entry.client_mac)
        }
        // TCP errors use the TCP path's own signalling; anything else is
        // undecodable here.
        _ => return None,
    };

    packet[base + 10..base + 12].copy_from_slice(&[0, 0]);
    let emb_checksum = internet_checksum(&packet[base..base + emb_header_len]);
    packet[base + 10..base + 12].copy_from_slice(&emb_checksum.to_be_bytes());

    Some(result)
}

/// Fix up a received ICMPv6 message in place. `from` is the reply's source
/// address as reported by the socket. Returns the guest address to send it
/// to and the MAC to frame it with.
pub(crate) fn rewrite_v6_reply(
    message: &mut [u8],
    from: Ipv6Addr,
    sources: &SourceCache,
    external: &ExternalIndex,
) -> Option<(Ipv6Addr, EthernetAddress)> {
    if message.len() < 8 {
        return None;
    }
    match message[0] {
        // An echo reply's source is the probed target, so attribution uses
        // the same keying as the v4 path.
        ICMPV6_ECHO_REPLY => {
            let (guest, mac) = sources.lookup_v6(from)?;
            Some((guest, mac))
        }
        ICMPV6_TIME_EXCEEDED | ICMPV6_DST_UNREACHABLE => {
            rewrite_v6_embedded(message, sources, external)
        }
        _ => None,
    }
}

fn rewrite_v6_embedded(
    message: &mut [u8],
    sources: &SourceCache,
    external: &ExternalIndex,
) -> Option<(Ipv6Addr, EthernetAddress)> {
    const EMB: usize = 8;
    let len = message.len();
    if len < EMB + 40 + 8 {
        return None;
    }
    if message[EMB] >> 4 != 6 {
        return None;
    }

    let emb_payload = (len - EMB - 40) as u16;
    message[EMB + 4..EMB + 6].copy_from_slice(&emb_payload.to_be_bytes());

    let next_header = message[EMB + 6];
    let l4 = EMB + 40;
    match next_header {
        libc_proto::ICMPV6 => {
            let target = Ipv6Addr::from(
                <[u8; 16]>::try_from(&message[EMB + 24..EMB + 40]).ok()?,
            );
            let (guest, mac) = sources.lookup_v6(target)?;

            let old = message[EMB + 8..EMB + 24].to_vec();
            message[EMB + 8..EMB + 24].copy_from_slice(&guest.octets());
            // The embedded ICMPv6 checksum covers the pseudo-header.
            let checksum = u16::from_be_bytes([message[l4 + 2], message[l4 + 3]]);
            let adjusted = craft::checksum_adjust(checksum, &old, &guest.octets());
            message[l4 + 2..l4 + 4].copy_from_slice(&adjusted.to_be_bytes());

            Some((guest, mac))
        }
        libc_proto::UDP => {
            let emb_src =
                Ipv6Addr::from(<[u8; 16]>::try_from(&message[EMB + 8..EMB + 24]).ok()?);
            let emb_src_port = u16::from_be_bytes([message[l4], message[l4 + 1]]);
            let entry = external.lookup(IpAddr::V6(emb_src), emb_src_port)?;
            let SocketAddr::V6(client) = entry.client else {
                return None;
            };

            let mut old = [0u8; 18];
            old[..16].copy_from_slice(&message[EMB + 8..EMB + 24]);
            old[16..].copy_from_slice(&message[l4..l4 + 2]);
            let mut new = [0u8; 18];
            new[..16].copy_from_slice(&client.ip().octets());
            new[16..].copy_from_slice(&client.port().to_be_bytes());

            message[EMB + 8..EMB + 24].copy_from_slice(&client.ip().octets());
            message[l4..l4 + 2].copy_from_slice(&client.port().to_be_bytes());

            // UDP over IPv6 always carries a checksum.
            let checksum = u16::from_be_bytes([message[l4 + 6], message[l4 + 7]]);
            if checksum != 0 {
                let adjusted = craft::checksum_adjust(checksum, &old, &new);
                message[l4 + 6..l4 + 8].copy_from_slice(&adjusted.to_be_bytes());
            }

            Some((*client.ip(), entry.client_mac))
        }
        _ => None,
    }
}

/// IP protocol numbers used in embedded-packet dispatch.
mod libc_proto {
    pub const ICMP: u8 = 1;
    pub const UDP: u8 = 17;
    pub const ICMPV6: u8 = 58;
}
