//! Gateway assembly.
//!
//! [`Gateway::start`] wires the datagram link, the stack loop and the
//! forwarders together from a [`GatewayConfig`] and the descriptor set
//! shared with the VM. Everything runs on the caller's tokio runtime;
//! [`Gateway::shutdown`] stops every task and releases the descriptors.

use crate::config::GatewayConfig;
use crate::conntrack::ExternalIndex;
use crate::device::checksum_capabilities;
use crate::error::Result;
use crate::host_forward::HostTcpForwarder;
use crate::icmp_forward::IcmpForwarder;
use crate::link::{DatagramLink, LinkOptions};
use crate::nat::NatTable;
use crate::stack::{GatewayStack, StackCommand};
use crate::tcp_forward::TcpForwarder;
use crate::udp_forward::UdpForwarder;

use smoltcp::wire::EthernetAddress;

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Gateway {
    commands: mpsc::Sender<StackCommand>,
    stack_task: JoinHandle<Result<()>>,
    host: HostTcpForwarder,
    icmp: IcmpForwarder,
    udp: UdpForwarder,
}

impl Gateway {
    /// Start the gateway over the given datagram descriptors.
    pub async fn start(fds: Vec<OwnedFd>, config: GatewayConfig) -> Result<Gateway> {
        config.validate()?;

        let link = DatagramLink::open(
            fds,
            LinkOptions {
                mtu: config.mtu,
                ethernet_header: config.ethernet_header,
                rx_checksum_offload: config.rx_checksum_offload,
                tx_checksum_offload: config.tx_checksum_offload,
                dispatch: config.dispatch,
            },
        )?;
        let frames = link.frame_sender();
        let gateway_mac = EthernetAddress(config.gateway_mac);
        // The forwarders craft frames with the same checksum strategy the
        // stack advertises for the link.
        let caps = checksum_capabilities(config.rx_checksum_offload, config.tx_checksum_offload);

        let nat = Arc::new(NatTable::new(config.nat.clone()));
        let external = Arc::new(ExternalIndex::new());

        let (icmp, icmp_tap) = IcmpForwarder::start(frames.clone(), external.clone(), gateway_mac)?;

        let udp = UdpForwarder::new(
            nat.clone(),
            frames.clone(),
            external,
            gateway_mac,
            caps.clone(),
            config.udp_idle_timeout,
            config.propagate_ttl,
        );

        let tcp = TcpForwarder::new(
            nat,
            frames,
            gateway_mac,
            caps,
            config.guest_dial_timeout,
        );

        let (commands, command_rx) = mpsc::channel(64);

        let host = HostTcpForwarder::start(
            &config.host_forwards,
            commands.clone(),
            config.gateway_ip4,
            config.gateway_ip6,
            config.host_dial_timeout,
            config.splice_buffer,
        )
        .await?;

        let stack = GatewayStack::new(
            link,
            &config,
            tcp,
            udp.clone(),
            icmp_tap,
            command_rx,
            commands.clone(),
        );
        let stack_task = tokio::spawn(stack.run());

        info!(
            ip4 = %config.gateway_ip4,
            ip6 = %config.gateway_ip6,
            mtu = config.mtu,
            "gateway started"
        );

        Ok(Gateway {
            commands,
            stack_task,
            host,
            icmp,
            udp,
        })
    }

    /// Stop every component and release all descriptors.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(StackCommand::Shutdown).await;
        self.host.shutdown();
        self.icmp.shutdown();
        self.udp.shutdown();

        match tokio::time::timeout(Duration::from_secs(1), &mut self.stack_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "stack loop exited with error"),
            Ok(Err(e)) => warn!(error = %e, "stack task panicked"),
            Err(_) => {
                self.stack_task.abort();
            }
        }
        info!("gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::datagram_pair;

    #[tokio::test]
    async fn starts_and_shuts_down_over_a_socketpair() {
        let (near, _far) = datagram_pair().unwrap();
        let gateway = match Gateway::start(vec![near], GatewayConfig::default()).await {
            Ok(gateway) => gateway,
            // ICMP sockets need net.ipv4.ping_group_range to cover the
            // test's GID; skip quietly where the sandbox forbids them.
            Err(crate::error::GatewayError::Io(e)) => {
                eprintln!("skipping: ICMP sockets unavailable ({e})");
                return;
            }
            Err(e) => panic!("unexpected startup failure: {e}"),
        };
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_fails_fast() {
        let (near, _far) = datagram_pair().unwrap();
        let config = GatewayConfig {
            mtu: 100,
            ..Default::default()
        };
        assert!(Gateway::start(vec![near], config).await.is_err());
    }
}
