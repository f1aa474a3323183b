//! Stack adapter and dispatch loop.
//!
//! Owns the smoltcp interface, its socket set and the link device. One task
//! runs the whole loop: ingest frames from the link, intercept forwarder
//! traffic (UDP, ICMP, new TCP SYNs) before the interface sees it, poll the
//! interface, and bridge established TCP sockets to their splice tasks.
//!
//! The interface is configured the way the gateway needs it: both gateway
//! addresses assigned, `any_ip` enabled so connections terminate on
//! arbitrary destination IPs and egress may use source addresses the NIC
//! does not own, default routes for both families, and cubic congestion
//! control on every TCP socket.

use crate::config::GatewayConfig;
use crate::device::LinkDevice;
use crate::error::{GatewayError, Result};
use crate::frame_io::FrameIO;
use crate::icmp_forward::{CapturedIcmp, IcmpFamily, IcmpTap};
use crate::stream::{FLOW_CHANNEL_DEPTH, VirtualStream};
use crate::tcp_forward::{self, DialResult, FlowTuple, SynPacket, TcpForwarder};
use crate::udp_forward::{UdpDatagram, UdpForwarder};

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, HardwareAddress, IpAddress, IpCidr,
    IpEndpoint, IpListenEndpoint, IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket,
};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Per-socket buffer for terminated TCP connections.
const TCP_SOCKET_BUFFER: usize = 256 * 1024;
/// Largest chunk moved between a socket and its splice channel at once.
const MAX_CHUNK: usize = 16 * 1024;
/// How long a completed dial may wait for the guest to finish the
/// handshake before its state is swept.
const ACCEPT_GRACE: Duration = Duration::from_secs(60);
/// Safety net for dial entries whose task never reported back.
const DIAL_GRACE: Duration = Duration::from_secs(300);

/// Commands handled by the stack loop.
pub(crate) enum StackCommand {
    /// A guest-to-host dial resolved.
    DialFinished {
        tuple: FlowTuple,
        result: DialResult,
    },
    /// Open a connection into the guest with a spoofed local address.
    DialGuest {
        local: SocketAddr,
        remote: SocketAddr,
        reply: oneshot::Sender<Result<VirtualStream>>,
    },
    Shutdown,
}

enum FlowState {
    /// SYN deferred, host dial in flight.
    Dialing { since: Instant },
    /// Host accepted; the SYN was fed to a listening socket.
    Accepting { handle: SocketHandle, since: Instant },
    /// Handshake complete, splice running.
    Active { handle: SocketHandle, io: FlowIo },
}

/// Channel plumbing between one smoltcp socket and its splice task.
struct FlowIo {
    to_splice: mpsc::Sender<Vec<u8>>,
    from_splice: mpsc::Receiver<Vec<u8>>,
    /// Partially written chunk headed into the socket.
    pending: Option<(Vec<u8>, usize)>,
    /// Guest FIN relayed to the splice.
    eof_sent: bool,
    /// Splice asked for a write-half close.
    fin_requested: bool,
    splice_gone: bool,
}

impl FlowIo {
    fn new(to_splice: mpsc::Sender<Vec<u8>>, from_splice: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            to_splice,
            from_splice,
            pending: None,
            eof_sent: false,
            fin_requested: false,
            splice_gone: false,
        }
    }
}

struct PendingOutbound {
    reply: oneshot::Sender<Result<VirtualStream>>,
    local: SocketAddr,
    remote: SocketAddr,
}

struct StackParams {
    gateway_ip4: std::net::Ipv4Addr,
    gateway_ip6: std::net::Ipv6Addr,
    splice_buffer: usize,
}

/// The gateway's user-space stack instance.
pub struct GatewayStack<F: FrameIO> {
    device: LinkDevice<F>,
    iface: Interface,
    sockets: SocketSet<'static>,
    start_time: std::time::Instant,
    params: StackParams,
    tcp: TcpForwarder,
    udp: UdpForwarder,
    icmp: IcmpTap,
    flows: HashMap<FlowTuple, FlowState>,
    pending_hosts: HashMap<FlowTuple, tokio::net::TcpStream>,
    outbound: HashMap<SocketHandle, PendingOutbound>,
    outbound_active: HashMap<SocketHandle, FlowIo>,
    commands: mpsc::Receiver<StackCommand>,
    events: mpsc::Sender<StackCommand>,
}

impl<F: FrameIO> GatewayStack<F> {
    pub(crate) fn new(
        frame_io: F,
        config: &GatewayConfig,
        tcp: TcpForwarder,
        udp: UdpForwarder,
        icmp: IcmpTap,
        commands: mpsc::Receiver<StackCommand>,
        events: mpsc::Sender<StackCommand>,
    ) -> Self {
        let mut device = LinkDevice::new(
            frame_io,
            config.ethernet_header,
            config.rx_checksum_offload,
            config.tx_checksum_offload,
        );
        let start_time = std::time::Instant::now();

        let hw_addr = HardwareAddress::Ethernet(EthernetAddress(config.gateway_mac));
        let iface_config = Config::new(hw_addr);
        let mut iface = Interface::new(iface_config, &mut device, smoltcp_now(start_time));

        // Accept packets for any destination IP and allow spoofed sources.
        iface.set_any_ip(true);

        iface.update_ip_addrs(|addrs| {
            addrs
                .push(IpCidr::new(
                    IpAddress::Ipv4(config.gateway_ip4),
                    config.prefix4,
                ))
                .ok();
            addrs
                .push(IpCidr::new(
                    IpAddress::Ipv6(config.gateway_ip6),
                    config.prefix6,
                ))
                .ok();
        });

        iface
            .routes_mut()
            .add_default_ipv4_route(config.gateway_ip4)
            .ok();
        iface
            .routes_mut()
            .add_default_ipv6_route(config.gateway_ip6)
            .ok();

        Self {
            device,
            iface,
            sockets: SocketSet::new(vec![]),
            start_time,
            params: StackParams {
                gateway_ip4: config.gateway_ip4,
                gateway_ip6: config.gateway_ip6,
                splice_buffer: config.splice_buffer,
            },
            tcp,
            udp,
            icmp,
            flows: HashMap::new(),
            pending_hosts: HashMap::new(),
            outbound: HashMap::new(),
            outbound_active: HashMap::new(),
            commands,
            events,
        }
    }

    /// Run the stack until shutdown or a fatal link error.
    pub async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                command = self.commands.recv() => match command {
                    None | Some(StackCommand::Shutdown) => break,
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                }
            }

            // Drain whatever else queued up without blocking.
            loop {
                match self.commands.try_recv() {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            return Ok(());
                        }
                    }
                    Err(_) => break,
                }
            }

            if !self.pump().await {
                return Err(GatewayError::Stack("datagram link closed".into()));
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: StackCommand) -> bool {
        match command {
            StackCommand::Shutdown => return false,
            StackCommand::DialFinished { tuple, result } => self.on_dial_finished(tuple, result),
            StackCommand::DialGuest {
                local,
                remote,
                reply,
            } => self.on_dial_guest(local, remote, reply),
        }
        true
    }

    /// One pass of the loop body. Returns `false` when the link is gone.
    async fn pump(&mut self) -> bool {
        loop {
            let poll_result = {
                let waker = futures::task::noop_waker();
                let mut cx = std::task::Context::from_waker(&waker);
                self.device.poll_recv(&mut cx)
            };
            if !poll_result {
                return false;
            }
            if !self.device.has_pending_rx() {
                break;
            }

            let action = {
                let frame = self.device.peek_rx().expect("pending frame");
                classify_frame(frame, &self.params, &self.flows)
            };
            match action {
                FrameAction::Deliver => {
                    let timestamp = smoltcp_now(self.start_time);
                    let _ = self
                        .iface
                        .poll(timestamp, &mut self.device, &mut self.sockets);
                }
                FrameAction::Discard => self.device.discard_rx(),
                FrameAction::Udp(datagram) => {
                    self.device.discard_rx();
                    self.udp.handle_outbound(datagram).await;
                }
                FrameAction::Icmp(family, captured) => {
                    self.device.discard_rx();
                    self.icmp.capture(family, captured);
                }
                FrameAction::TcpDial(syn) => {
                    self.device.discard_rx();
                    trace!(client = %syn.tuple.client, dest = %syn.tuple.dest, "new TCP flow");
                    self.flows.insert(
                        syn.tuple,
                        FlowState::Dialing {
                            since: Instant::now(),
                        },
                    );
                    self.tcp.spawn_dial(syn, self.events.clone());
                }
            }
        }

        // Timers, retransmissions, and frames queued by command handling.
        let timestamp = smoltcp_now(self.start_time);
        let _ = self
            .iface
            .poll(timestamp, &mut self.device, &mut self.sockets);

        self.service_flows();
        self.service_outbound();
        self.sweep_stale();
        true
    }

    fn on_dial_finished(&mut self, tuple: FlowTuple, result: DialResult) {
        match self.flows.get(&tuple) {
            Some(FlowState::Dialing { .. }) => {}
            _ => {
                debug!(client = %tuple.client, "stale dial result");
                return;
            }
        }

        match result {
            DialResult::Failed => {
                // Any guest-visible signalling (RST) already happened; the
                // next SYN retransmit restarts the flow.
                self.flows.remove(&tuple);
            }
            DialResult::Connected { host, syn } => {
                let mut socket = new_tcp_socket();
                let listen = IpListenEndpoint {
                    addr: Some(tuple.dest.ip().into()),
                    port: tuple.dest.port(),
                };
                if let Err(e) = socket.listen(listen) {
                    warn!(error = %e, dest = %tuple.dest, "listen failed");
                    self.flows.remove(&tuple);
                    return;
                }
                let handle = self.sockets.add(socket);
                self.pending_hosts.insert(tuple, host);
                self.flows.insert(
                    tuple,
                    FlowState::Accepting {
                        handle,
                        since: Instant::now(),
                    },
                );

                // Feed the deferred SYN; the handshake completes in-line.
                self.device.inject_rx(syn.frame);
                let timestamp = smoltcp_now(self.start_time);
                let _ = self
                    .iface
                    .poll(timestamp, &mut self.device, &mut self.sockets);
            }
        }
    }

    fn on_dial_guest(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        reply: oneshot::Sender<Result<VirtualStream>>,
    ) {
        let socket = new_tcp_socket();
        let handle = self.sockets.add(socket);

        let remote_ep = IpEndpoint::from(remote);
        let local_ep = IpListenEndpoint {
            addr: Some(local.ip().into()),
            port: local.port(),
        };

        let context = self.iface.context();
        let socket = self.sockets.get_mut::<tcp::Socket>(handle);
        match socket.connect(context, remote_ep, local_ep) {
            Ok(()) => {
                self.outbound.insert(
                    handle,
                    PendingOutbound {
                        reply,
                        local,
                        remote,
                    },
                );
                let timestamp = smoltcp_now(self.start_time);
                let _ = self
                    .iface
                    .poll(timestamp, &mut self.device, &mut self.sockets);
            }
            Err(e) => {
                let _ = reply.send(Err(GatewayError::Connection(format!(
                    "dial into guest {remote} failed: {e}"
                ))));
                self.sockets.remove(handle);
            }
        }
    }

    fn service_flows(&mut self) {
        enum Check {
            Accepting(SocketHandle),
            Active(SocketHandle),
        }

        let tuples: Vec<FlowTuple> = self.flows.keys().copied().collect();
        for tuple in tuples {
            let check = match self.flows.get(&tuple) {
                Some(FlowState::Accepting { handle, .. }) => Check::Accepting(*handle),
                Some(FlowState::Active { handle, .. }) => Check::Active(*handle),
                _ => continue,
            };

            match check {
                Check::Accepting(handle) => {
                    let state = self.sockets.get_mut::<tcp::Socket>(handle).state();
                    match state {
                        tcp::State::Established | tcp::State::CloseWait => {
                            self.promote(tuple, handle);
                        }
                        tcp::State::Closed => {
                            self.sockets.remove(handle);
                            self.flows.remove(&tuple);
                            self.pending_hosts.remove(&tuple);
                        }
                        _ => {}
                    }
                }
                Check::Active(handle) => {
                    let Some(FlowState::Active { io, .. }) = self.flows.get_mut(&tuple) else {
                        continue;
                    };
                    let socket = self.sockets.get_mut::<tcp::Socket>(handle);
                    if service_socket(socket, io) {
                        self.sockets.remove(handle);
                        self.flows.remove(&tuple);
                        trace!(client = %tuple.client, "TCP flow closed");
                    }
                }
            }
        }
    }

    /// Handshake finished: wire the socket to a fresh splice.
    fn promote(&mut self, tuple: FlowTuple, handle: SocketHandle) {
        let Some(host) = self.pending_hosts.remove(&tuple) else {
            self.sockets.remove(handle);
            self.flows.remove(&tuple);
            return;
        };

        let (to_splice_tx, to_splice_rx) = mpsc::channel(FLOW_CHANNEL_DEPTH);
        let (from_splice_tx, from_splice_rx) = mpsc::channel(FLOW_CHANNEL_DEPTH);
        let virt = VirtualStream::new(to_splice_rx, from_splice_tx, tuple.dest, tuple.client);
        tcp_forward::spawn_splice(virt, host, self.params.splice_buffer);

        debug!(client = %tuple.client, dest = %tuple.dest, "TCP flow spliced");
        self.flows.insert(
            tuple,
            FlowState::Active {
                handle,
                io: FlowIo::new(to_splice_tx, from_splice_rx),
            },
        );
    }

    fn service_outbound(&mut self) {
        let handles: Vec<SocketHandle> = self.outbound.keys().copied().collect();
        for handle in handles {
            let state = self.sockets.get_mut::<tcp::Socket>(handle).state();
            match state {
                tcp::State::Established => {
                    let pending = self.outbound.remove(&handle).expect("pending outbound");
                    let (to_splice_tx, to_splice_rx) = mpsc::channel(FLOW_CHANNEL_DEPTH);
                    let (from_splice_tx, from_splice_rx) = mpsc::channel(FLOW_CHANNEL_DEPTH);
                    let virt = VirtualStream::new(
                        to_splice_rx,
                        from_splice_tx,
                        pending.local,
                        pending.remote,
                    );
                    if pending.reply.send(Ok(virt)).is_err() {
                        // The dialer's deadline expired.
                        self.sockets.get_mut::<tcp::Socket>(handle).abort();
                        self.sockets.remove(handle);
                        continue;
                    }
                    debug!(local = %pending.local, remote = %pending.remote, "guest dial established");
                    self.outbound_active
                        .insert(handle, FlowIo::new(to_splice_tx, from_splice_rx));
                }
                tcp::State::Closed => {
                    let pending = self.outbound.remove(&handle).expect("pending outbound");
                    let _ = pending.reply.send(Err(GatewayError::Connection(format!(
                        "guest refused {}",
                        pending.remote
                    ))));
                    self.sockets.remove(handle);
                }
                _ => {
                    if self.outbound[&handle].reply.is_closed() {
                        self.outbound.remove(&handle);
                        self.sockets.get_mut::<tcp::Socket>(handle).abort();
                        self.sockets.remove(handle);
                    }
                }
            }
        }

        let actives: Vec<SocketHandle> = self.outbound_active.keys().copied().collect();
        for handle in actives {
            let Some(io) = self.outbound_active.get_mut(&handle) else {
                continue;
            };
            let socket = self.sockets.get_mut::<tcp::Socket>(handle);
            if service_socket(socket, io) {
                self.sockets.remove(handle);
                self.outbound_active.remove(&handle);
            }
        }
    }

    fn sweep_stale(&mut self) {
        let now = Instant::now();
        let stale: Vec<(FlowTuple, Option<SocketHandle>)> = self
            .flows
            .iter()
            .filter_map(|(tuple, state)| match state {
                FlowState::Accepting { handle, since } if now - *since > ACCEPT_GRACE => {
                    Some((*tuple, Some(*handle)))
                }
                FlowState::Dialing { since } if now - *since > DIAL_GRACE => Some((*tuple, None)),
                _ => None,
            })
            .collect();
        for (tuple, handle) in stale {
            debug!(client = %tuple.client, "sweeping stale flow");
            if let Some(handle) = handle {
                self.sockets.remove(handle);
            }
            self.pending_hosts.remove(&tuple);
            self.flows.remove(&tuple);
        }
    }
}

fn new_tcp_socket() -> tcp::Socket<'static> {
    let mut socket = tcp::Socket::new(
        tcp::SocketBuffer::new(vec![0u8; TCP_SOCKET_BUFFER]),
        tcp::SocketBuffer::new(vec![0u8; TCP_SOCKET_BUFFER]),
    );
    socket.set_congestion_control(tcp::CongestionControl::Cubic);
    socket.set_nagle_enabled(false);
    socket
}

/// Bridge one socket to its splice channels. Returns `true` once the flow
/// is finished and its socket can be dropped.
fn service_socket(socket: &mut tcp::Socket, io: &mut FlowIo) -> bool {
    // Guest → splice. Backpressure: when the channel is full the data stays
    // in the socket buffer and the receive window closes by itself.
    while socket.can_recv() {
        match io.to_splice.try_reserve() {
            Ok(permit) => {
                let chunk = socket
                    .recv(|buf| {
                        let n = buf.len().min(MAX_CHUNK);
                        (n, buf[..n].to_vec())
                    })
                    .unwrap_or_default();
                if chunk.is_empty() {
                    break;
                }
                permit.send(chunk);
            }
            Err(_) => break,
        }
    }

    // Guest FIN, once all buffered data is drained.
    if !io.eof_sent && !socket.may_recv() && !socket.can_recv() {
        match io.to_splice.try_send(Vec::new()) {
            Ok(()) => io.eof_sent = true,
            Err(mpsc::error::TrySendError::Closed(_)) => io.eof_sent = true,
            Err(mpsc::error::TrySendError::Full(_)) => {}
        }
    }

    // Splice → guest.
    while !io.splice_gone {
        if let Some((chunk, offset)) = io.pending.as_mut() {
            if !socket.can_send() {
                break;
            }
            match socket.send_slice(&chunk[*offset..]) {
                Ok(n) => {
                    *offset += n;
                    if *offset >= chunk.len() {
                        io.pending = None;
                    } else {
                        break;
                    }
                }
                Err(_) => {
                    io.pending = None;
                    break;
                }
            }
        } else {
            match io.from_splice.try_recv() {
                Ok(chunk) if chunk.is_empty() => {
                    // Write-half close requested by the splice.
                    io.fin_requested = true;
                    socket.close();
                    break;
                }
                Ok(chunk) => io.pending = Some((chunk, 0)),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !io.fin_requested {
                        // The splice died without a clean close.
                        socket.abort();
                    }
                    io.splice_gone = true;
                }
            }
        }
    }

    matches!(socket.state(), tcp::State::Closed) && io.pending.is_none()
}

pub(crate) enum FrameAction {
    /// Hand the frame to the interface.
    Deliver,
    /// Drop it (a forwarder owns the flow).
    Discard,
    Udp(UdpDatagram),
    Icmp(IcmpFamily, CapturedIcmp),
    TcpDial(SynPacket),
}

/// Decide what to do with one inbound frame before the interface sees it.
fn classify_frame(
    frame: &[u8],
    params: &StackParams,
    flows: &HashMap<FlowTuple, FlowState>,
) -> FrameAction {
    let Ok(eth) = EthernetFrame::new_checked(frame) else {
        return FrameAction::Discard;
    };
    let guest_mac = eth.src_addr();

    match eth.ethertype() {
        EthernetProtocol::Ipv4 => {
            let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
                return FrameAction::Deliver;
            };
            // Fragments, broadcast and multicast go to the interface.
            if ip.more_frags() || ip.frag_offset() != 0 {
                return FrameAction::Deliver;
            }
            let dst = ip.dst_addr();
            if dst.is_multicast() || dst.is_broadcast() {
                return FrameAction::Deliver;
            }
            let src_ip = IpAddr::V4(ip.src_addr());
            let dst_ip = IpAddr::V4(dst);
            let to_gateway = dst == params.gateway_ip4;

            match ip.next_header() {
                IpProtocol::Tcp => classify_tcp(frame, guest_mac, src_ip, dst_ip, ip.payload(), flows),
                IpProtocol::Udp if !to_gateway => {
                    classify_udp(guest_mac, src_ip, dst_ip, ip.hop_limit(), ip.payload())
                }
                IpProtocol::Icmp if !to_gateway => FrameAction::Icmp(
                    IcmpFamily::V4,
                    CapturedIcmp {
                        src: src_ip,
                        dst: dst_ip,
                        hop_limit: ip.hop_limit(),
                        guest_mac,
                        message: ip.payload().to_vec(),
                    },
                ),
                _ => FrameAction::Deliver,
            }
        }
        EthernetProtocol::Ipv6 => {
            let Ok(ip) = Ipv6Packet::new_checked(eth.payload()) else {
                return FrameAction::Deliver;
            };
            let dst = ip.dst_addr();
            if dst.is_multicast() {
                return FrameAction::Deliver;
            }
            let src_ip = IpAddr::V6(ip.src_addr());
            let dst_ip = IpAddr::V6(dst);
            let to_gateway = dst == params.gateway_ip6;

            match ip.next_header() {
                IpProtocol::Tcp => classify_tcp(frame, guest_mac, src_ip, dst_ip, ip.payload(), flows),
                IpProtocol::Udp if !to_gateway => {
                    classify_udp(guest_mac, src_ip, dst_ip, ip.hop_limit(), ip.payload())
                }
                IpProtocol::Icmpv6 if !to_gateway => {
                    let payload = ip.payload();
                    // Neighbor discovery stays with the interface.
                    if payload.first().is_some_and(|ty| (133..=137).contains(ty)) {
                        return FrameAction::Deliver;
                    }
                    FrameAction::Icmp(
                        IcmpFamily::V6,
                        CapturedIcmp {
                            src: src_ip,
                            dst: dst_ip,
                            hop_limit: ip.hop_limit(),
                            guest_mac,
                            message: payload.to_vec(),
                        },
                    )
                }
                _ => FrameAction::Deliver,
            }
        }
        // ARP and anything else belongs to the interface.
        _ => FrameAction::Deliver,
    }
}

fn classify_tcp(
    frame: &[u8],
    guest_mac: EthernetAddress,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    payload: &[u8],
    flows: &HashMap<FlowTuple, FlowState>,
) -> FrameAction {
    let Ok(tcp) = TcpPacket::new_checked(payload) else {
        return FrameAction::Deliver;
    };
    let tuple = FlowTuple {
        client: SocketAddr::new(src_ip, tcp.src_port()),
        dest: SocketAddr::new(dst_ip, tcp.dst_port()),
    };

    match flows.get(&tuple) {
        // Retransmits of a deferred SYN are swallowed until the dial
        // resolves.
        Some(FlowState::Dialing { .. }) => FrameAction::Discard,
        Some(_) => FrameAction::Deliver,
        None => {
            if tcp.syn() && !tcp.ack() && !tcp.rst() {
                FrameAction::TcpDial(SynPacket {
                    tuple,
                    isn: tcp.seq_number(),
                    guest_mac,
                    frame: frame.to_vec(),
                })
            } else {
                // Stale segments draw an RST from the interface; SYN-ACKs
                // for outbound dials match their own socket.
                FrameAction::Deliver
            }
        }
    }
}

fn classify_udp(
    guest_mac: EthernetAddress,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    ttl: u8,
    payload: &[u8],
) -> FrameAction {
    let Ok(udp) = smoltcp::wire::UdpPacket::new_checked(payload) else {
        return FrameAction::Deliver;
    };
    if udp.dst_port() == 0 {
        return FrameAction::Deliver;
    }
    FrameAction::Udp(UdpDatagram {
        client: SocketAddr::new(src_ip, udp.src_port()),
        dest: SocketAddr::new(dst_ip, udp.dst_port()),
        ttl,
        guest_mac,
        payload: udp.payload().to_vec(),
    })
}

/// Convert system time to a smoltcp instant.
fn smoltcp_now(start: std::time::Instant) -> SmolInstant {
    let elapsed = start.elapsed();
    SmolInstant::from_millis(elapsed.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::ExternalIndex;
    use crate::craft;
    use crate::link::FrameSender;
    use crate::nat::NatTable;
    use smoltcp::phy::ChecksumCapabilities;
    use smoltcp::wire::{
        ArpOperation, ArpPacket, ArpRepr, Icmpv4Message, Icmpv4Packet, Icmpv4Repr, Ipv4Repr,
        TcpControl, TcpRepr, TcpSeqNumber,
    };
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::task::Poll;

    const GW_MAC: EthernetAddress = EthernetAddress([0x24, 0xd2, 0xf4, 0x58, 0x34, 0xd7]);
    const GUEST_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
    const GW_IP: Ipv4Addr = Ipv4Addr::new(198, 19, 248, 1);
    const GUEST_IP: Ipv4Addr = Ipv4Addr::new(198, 19, 248, 2);
    const NAT_IP: Ipv4Addr = Ipv4Addr::new(198, 19, 248, 254);

    fn params() -> StackParams {
        StackParams {
            gateway_ip4: GW_IP,
            gateway_ip6: "fd00:96dc:7096:1df0::1".parse().unwrap(),
            splice_buffer: 256 * 1024,
        }
    }

    fn tcp_syn_frame(dst: Ipv4Addr, dst_port: u16) -> Vec<u8> {
        let caps = ChecksumCapabilities::default();
        let tcp_repr = TcpRepr {
            src_port: 40000,
            dst_port,
            control: TcpControl::Syn,
            seq_number: TcpSeqNumber(100),
            ack_number: None,
            window_len: 65535,
            window_scale: None,
            max_seg_size: Some(1460),
            sack_permitted: false,
            sack_ranges: [None, None, None],
            timestamp: None,
            payload: &[],
        };
        let ip_repr = Ipv4Repr {
            src_addr: GUEST_IP,
            dst_addr: dst,
            next_header: IpProtocol::Tcp,
            payload_len: tcp_repr.header_len(),
            hop_limit: 64,
        };
        let mut packet = vec![0u8; 20 + tcp_repr.header_len()];
        ip_repr.emit(&mut Ipv4Packet::new_unchecked(&mut packet[..]), &caps);
        tcp_repr.emit(
            &mut TcpPacket::new_unchecked(&mut packet[20..]),
            &GUEST_IP.into(),
            &dst.into(),
            &caps,
        );
        craft::ethernet_wrap(&packet, EthernetProtocol::Ipv4, GUEST_MAC, GW_MAC)
    }

    fn icmp_echo_frame(dst: Ipv4Addr) -> Vec<u8> {
        let caps = ChecksumCapabilities::default();
        let icmp_repr = Icmpv4Repr::EchoRequest {
            ident: 0x55,
            seq_no: 1,
            data: b"ping",
        };
        let ip_repr = Ipv4Repr {
            src_addr: GUEST_IP,
            dst_addr: dst,
            next_header: IpProtocol::Icmp,
            payload_len: icmp_repr.buffer_len(),
            hop_limit: 64,
        };
        let mut packet = vec![0u8; 20 + icmp_repr.buffer_len()];
        ip_repr.emit(&mut Ipv4Packet::new_unchecked(&mut packet[..]), &caps);
        icmp_repr.emit(&mut Icmpv4Packet::new_unchecked(&mut packet[20..]), &caps);
        craft::ethernet_wrap(&packet, EthernetProtocol::Ipv4, GUEST_MAC, GW_MAC)
    }

    fn udp_test_frame(dst: Ipv4Addr, dst_port: u16) -> Vec<u8> {
        craft::udp_frame(
            SocketAddr::new(IpAddr::V4(GUEST_IP), 40000),
            SocketAddr::new(IpAddr::V4(dst), dst_port),
            b"data",
            GUEST_MAC,
            GW_MAC,
            &ChecksumCapabilities::default(),
        )
        .unwrap()
    }

    #[test]
    fn udp_to_the_world_is_intercepted() {
        let flows = HashMap::new();
        let frame = udp_test_frame(NAT_IP, 7);
        match classify_frame(&frame, &params(), &flows) {
            FrameAction::Udp(datagram) => {
                assert_eq!(datagram.dest.port(), 7);
                assert_eq!(datagram.client.port(), 40000);
                assert_eq!(datagram.payload, b"data");
            }
            _ => panic!("expected UDP interception"),
        }
    }

    #[test]
    fn udp_to_gateway_is_delivered() {
        let flows = HashMap::new();
        let frame = udp_test_frame(GW_IP, 67);
        assert!(matches!(
            classify_frame(&frame, &params(), &flows),
            FrameAction::Deliver
        ));
    }

    #[test]
    fn icmp_to_the_world_is_intercepted() {
        let flows = HashMap::new();
        let frame = icmp_echo_frame(Ipv4Addr::new(1, 1, 1, 1));
        match classify_frame(&frame, &params(), &flows) {
            FrameAction::Icmp(IcmpFamily::V4, captured) => {
                assert_eq!(captured.dst, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
                assert_eq!(captured.src, IpAddr::V4(GUEST_IP));
            }
            _ => panic!("expected ICMP interception"),
        }
    }

    #[test]
    fn icmp_to_gateway_stays_in_stack() {
        let flows = HashMap::new();
        let frame = icmp_echo_frame(GW_IP);
        assert!(matches!(
            classify_frame(&frame, &params(), &flows),
            FrameAction::Deliver
        ));
    }

    #[test]
    fn fresh_syn_defers_to_dial() {
        let flows = HashMap::new();
        let frame = tcp_syn_frame(NAT_IP, 2222);
        match classify_frame(&frame, &params(), &flows) {
            FrameAction::TcpDial(syn) => {
                assert_eq!(syn.tuple.dest.port(), 2222);
                assert_eq!(syn.isn, TcpSeqNumber(100));
                assert_eq!(syn.frame, frame);
            }
            _ => panic!("expected a dial"),
        }
    }

    #[test]
    fn syn_retransmit_while_dialing_is_swallowed() {
        let mut flows = HashMap::new();
        let frame = tcp_syn_frame(NAT_IP, 2222);
        flows.insert(
            FlowTuple {
                client: SocketAddr::new(IpAddr::V4(GUEST_IP), 40000),
                dest: SocketAddr::new(IpAddr::V4(NAT_IP), 2222),
            },
            FlowState::Dialing {
                since: Instant::now(),
            },
        );
        assert!(matches!(
            classify_frame(&frame, &params(), &flows),
            FrameAction::Discard
        ));
    }

    #[test]
    fn non_syn_for_unknown_flow_is_delivered() {
        let flows = HashMap::new();
        // Reuse the RST crafter to get a non-SYN segment.
        let frame = craft::tcp_rst_frame(
            SocketAddr::new(IpAddr::V4(GUEST_IP), 40000),
            SocketAddr::new(IpAddr::V4(NAT_IP), 2222),
            TcpSeqNumber(1),
            GUEST_MAC,
            GW_MAC,
            &ChecksumCapabilities::default(),
        )
        .unwrap();
        assert!(matches!(
            classify_frame(&frame, &params(), &flows),
            FrameAction::Deliver
        ));
    }

    // In-memory transport for exercising the full loop.
    struct ChannelIo {
        rx: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<Vec<u8>>,
    }

    impl FrameIO for ChannelIo {
        fn mtu(&self) -> usize {
            1500
        }
        fn poll_recv(
            &mut self,
            cx: &mut std::task::Context<'_>,
            buf: &mut [u8],
        ) -> Poll<std::io::Result<usize>> {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(frame)) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Poll::Ready(Ok(frame.len()))
                }
                Poll::Ready(None) => {
                    Poll::Ready(Err(std::io::ErrorKind::UnexpectedEof.into()))
                }
                Poll::Pending => Poll::Pending,
            }
        }
        fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.tx
                .try_send(frame.to_vec())
                .map_err(|_| std::io::ErrorKind::BrokenPipe.into())
        }
    }

    struct TestStack {
        to_stack: mpsc::Sender<Vec<u8>>,
        from_stack: mpsc::Receiver<Vec<u8>>,
        commands: mpsc::Sender<StackCommand>,
    }

    fn start_stack() -> TestStack {
        let (to_stack, stack_rx) = mpsc::channel::<Vec<u8>>(64);
        let (stack_tx, from_stack) = mpsc::channel::<Vec<u8>>(64);
        let io = ChannelIo {
            rx: stack_rx,
            tx: stack_tx.clone(),
        };

        let config = GatewayConfig::default();
        let frames: FrameSender = stack_tx;
        let nat = Arc::new(NatTable::new(config.nat.clone()));
        let external = Arc::new(ExternalIndex::new());
        let caps = ChecksumCapabilities::default();

        let tcp = TcpForwarder::new(
            nat.clone(),
            frames.clone(),
            GW_MAC,
            caps.clone(),
            Some(Duration::from_secs(5)),
        );
        let udp = UdpForwarder::new(
            nat,
            frames.clone(),
            external,
            GW_MAC,
            caps,
            Duration::from_secs(90),
            true,
        );
        // A tap with no relay behind it: captures just queue up.
        let (v4_tx, _v4_rx) = mpsc::channel(16);
        let (v6_tx, _v6_rx) = mpsc::channel(16);
        let icmp = test_tap(v4_tx, v6_tx);

        let (commands, command_rx) = mpsc::channel(16);
        let stack = GatewayStack::new(io, &config, tcp, udp, icmp, command_rx, commands.clone());
        tokio::spawn(stack.run());

        TestStack {
            to_stack,
            from_stack,
            commands,
        }
    }

    fn test_tap(
        v4: mpsc::Sender<CapturedIcmp>,
        v6: mpsc::Sender<CapturedIcmp>,
    ) -> IcmpTap {
        IcmpTap::from_parts(v4, v6)
    }

    fn arp_request_for(ip: Ipv4Addr) -> Vec<u8> {
        let repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: GUEST_MAC,
            source_protocol_addr: GUEST_IP,
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: ip,
        };
        let mut packet = vec![0u8; repr.buffer_len()];
        repr.emit(&mut ArpPacket::new_unchecked(&mut packet[..]));
        craft::ethernet_wrap(&packet, EthernetProtocol::Arp, GUEST_MAC, GW_MAC)
    }

    #[tokio::test]
    async fn stack_answers_arp_for_the_gateway() {
        let mut stack = start_stack();
        stack
            .to_stack
            .send(arp_request_for(GW_IP))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), stack.from_stack.recv())
            .await
            .expect("ARP reply")
            .unwrap();
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.ethertype(), EthernetProtocol::Arp);
        let arp = ArpPacket::new_checked(eth.payload()).unwrap();
        assert_eq!(arp.operation(), ArpOperation::Reply);
        assert_eq!(arp.source_hardware_addr(), GW_MAC.as_bytes());
    }

    #[tokio::test]
    async fn stack_answers_ping_to_the_gateway() {
        let mut stack = start_stack();
        stack
            .to_stack
            .send(icmp_echo_frame(GW_IP))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), stack.from_stack.recv())
            .await
            .expect("echo reply")
            .unwrap();
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.src_addr(), GW_IP);
        assert_eq!(ip.dst_addr(), GUEST_IP);
        let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
        assert_eq!(icmp.msg_type(), Icmpv4Message::EchoReply);
    }

    #[tokio::test]
    async fn shutdown_command_stops_the_loop() {
        let stack = start_stack();
        stack.commands.send(StackCommand::Shutdown).await.unwrap();
        // The loop is gone: the next frame is never consumed once the
        // channel fills, but more importantly the send side stays open
        // without panicking.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stack.to_stack.send(arp_request_for(GW_IP)).await.is_ok());
    }
}
