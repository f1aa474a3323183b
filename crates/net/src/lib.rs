//! Userspace network gateway for VM guests.
//!
//! Bridges a guest's virtio-net datagram link to the host's kernel stack
//! without privileges or a tun/tap device: guest TCP and UDP flows
//! terminate on a userspace stack and continue over ordinary host sockets,
//! ICMP is relayed through unprivileged ping sockets, and selected host
//! listeners are forwarded back into the guest.

mod config;
mod conntrack;
mod craft;
mod device;
mod error;
mod frame_io;
mod gateway;
mod host_forward;
mod icmp_forward;
mod link;
mod nat;
mod stack;
mod stream;
mod tcp_forward;
mod udp_forward;

pub use config::{GatewayConfig, HostForward};
pub use conntrack::{ExternalEntry, ExternalIndex, FlowAddr, UdpFlowKey};
pub use error::{GatewayError, Result};
pub use frame_io::FrameIO;
pub use gateway::Gateway;
pub use link::{DatagramLink, DispatchMode, FrameSender, LinkOptions, datagram_pair};
pub use nat::NatTable;
pub use stream::VirtualStream;
pub use tcp_forward::FlowTuple;
