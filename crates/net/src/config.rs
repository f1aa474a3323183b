//! Gateway configuration.
//!
//! The gateway takes no CLI and loads no files: the embedder constructs a
//! [`GatewayConfig`] carrying the address plan, the NAT pairs, the host
//! forward table and the link tunables, and passes it to
//! [`Gateway::start`](crate::Gateway::start) together with the datagram
//! descriptors shared with the VM.

use crate::error::{GatewayError, Result};
use crate::link::DispatchMode;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// A single host-to-guest TCP forward: accept on `listen`, dial `connect`
/// inside the guest network.
#[derive(Clone, Copy, Debug)]
pub struct HostForward {
    pub listen: SocketAddr,
    pub connect: SocketAddr,
}

/// Configuration for the userspace gateway.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Maximum frame payload carried over the datagram link.
    pub mtu: usize,
    /// MAC address of the gateway side of the link.
    pub gateway_mac: [u8; 6],
    /// Whether frames on the link carry an Ethernet header. The gateway
    /// requires this; the link layer itself also supports raw IP framing.
    pub ethernet_header: bool,

    /// Gateway IPv4 address (our IP) and subnet prefix.
    pub gateway_ip4: Ipv4Addr,
    pub prefix4: u8,
    /// Gateway IPv6 address and subnet prefix.
    pub gateway_ip6: Ipv6Addr,
    pub prefix6: u8,

    /// Static NAT pairs: guest-visible address → host-visible address.
    pub nat: Vec<(IpAddr, IpAddr)>,
    /// Host listeners forwarded into the guest.
    pub host_forwards: Vec<HostForward>,

    /// Idle timeout for UDP connection-tracking entries.
    pub udp_idle_timeout: Duration,
    /// Deadline for guest-initiated host dials. `None` relies on the kernel's
    /// SYN retransmission.
    pub guest_dial_timeout: Option<Duration>,
    /// Deadline for host-to-guest dials into the stack.
    pub host_dial_timeout: Duration,
    /// Copy the guest's IP TTL / hop limit onto host UDP sockets.
    pub propagate_ttl: bool,

    /// Advertise RX checksum offload: inbound frames are trusted as verified.
    pub rx_checksum_offload: bool,
    /// Advertise TX checksum offload: outbound frames are emitted without
    /// transport checksums.
    pub tx_checksum_offload: bool,
    /// Link receive strategy.
    pub dispatch: DispatchMode,

    /// Per-direction buffer for the TCP splice.
    pub splice_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mtu: 65520,
            gateway_mac: [0x24, 0xd2, 0xf4, 0x58, 0x34, 0xd7],
            ethernet_header: true,
            gateway_ip4: Ipv4Addr::new(198, 19, 248, 1),
            prefix4: 24,
            gateway_ip6: Ipv6Addr::new(0xfd00, 0x96dc, 0x7096, 0x1df0, 0, 0, 0, 1),
            prefix6: 64,
            nat: vec![
                (
                    IpAddr::V4(Ipv4Addr::new(198, 19, 248, 254)),
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                ),
                (
                    IpAddr::V6(Ipv6Addr::new(0xfd00, 0x96dc, 0x7096, 0x1df0, 0, 0, 0, 0x254)),
                    IpAddr::V6(Ipv6Addr::LOCALHOST),
                ),
            ],
            host_forwards: Vec::new(),
            udp_idle_timeout: Duration::from_secs(90),
            guest_dial_timeout: None,
            host_dial_timeout: Duration::from_secs(30),
            propagate_ttl: true,
            rx_checksum_offload: true,
            tx_checksum_offload: true,
            dispatch: DispatchMode::Batched,
            splice_buffer: 256 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Validate the configuration. Errors here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if !self.ethernet_header {
            return Err(GatewayError::Configuration(
                "the gateway requires Ethernet framing on the datagram link".into(),
            ));
        }
        if self.mtu < 1280 || self.mtu > 65520 {
            return Err(GatewayError::Configuration(format!(
                "MTU {} outside supported range 1280..=65520",
                self.mtu
            )));
        }
        if self.prefix4 == 0 || self.prefix4 > 30 {
            return Err(GatewayError::Configuration(format!(
                "invalid IPv4 prefix length {}",
                self.prefix4
            )));
        }
        if self.prefix6 == 0 || self.prefix6 > 126 {
            return Err(GatewayError::Configuration(format!(
                "invalid IPv6 prefix length {}",
                self.prefix6
            )));
        }
        for (from, to) in &self.nat {
            if from.is_ipv4() != to.is_ipv4() {
                return Err(GatewayError::Configuration(format!(
                    "NAT pair {from} -> {to} mixes address families"
                )));
            }
        }
        for fwd in &self.host_forwards {
            if fwd.connect.port() == 0 {
                return Err(GatewayError::Configuration(format!(
                    "host forward {} has no guest port",
                    fwd.listen
                )));
            }
        }
        if self.splice_buffer == 0 {
            return Err(GatewayError::Configuration(
                "splice buffer size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_address_plan() {
        let config = GatewayConfig::default();
        assert_eq!(config.gateway_ip4, Ipv4Addr::new(198, 19, 248, 1));
        assert_eq!(config.prefix4, 24);
        assert_eq!(config.mtu, 65520);
        assert_eq!(config.udp_idle_timeout, Duration::from_secs(90));
        assert!(config.guest_dial_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_nat_maps_virtual_host_to_loopback() {
        let config = GatewayConfig::default();
        let v4 = config
            .nat
            .iter()
            .find(|(from, _)| *from == IpAddr::V4(Ipv4Addr::new(198, 19, 248, 254)))
            .expect("IPv4 NAT pair");
        assert_eq!(v4.1, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn rejects_mixed_family_nat_pair() {
        let config = GatewayConfig {
            nat: vec![(
                IpAddr::V4(Ipv4Addr::new(198, 19, 248, 254)),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            )],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(GatewayError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_raw_ip_framing() {
        let config = GatewayConfig {
            ethernet_header: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_mtu() {
        let config = GatewayConfig {
            mtu: 70000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
