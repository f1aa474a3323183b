//! Host-to-guest TCP forwarding.
//!
//! Each configured forward owns a host listener. Accepted connections dial
//! *into* the stack towards a fixed guest address, with a spoofed source:
//! the gateway IP carrying the host client's ephemeral port. The guest
//! therefore sees each host client as a distinct peer behind the gateway.

use crate::config::HostForward;
use crate::error::{GatewayError, Result};
use crate::stack::StackCommand;
use crate::stream::VirtualStream;
use crate::tcp_forward;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct HostTcpForwarder {
    tasks: Vec<JoinHandle<()>>,
}

impl HostTcpForwarder {
    /// Bind every configured listener. A listener that cannot bind is a
    /// fatal configuration problem.
    pub(crate) async fn start(
        forwards: &[HostForward],
        commands: mpsc::Sender<StackCommand>,
        gateway_ip4: Ipv4Addr,
        gateway_ip6: Ipv6Addr,
        dial_timeout: Duration,
        splice_buffer: usize,
    ) -> Result<Self> {
        let mut tasks = Vec::new();
        for forward in forwards {
            let listener = TcpListener::bind(forward.listen).await.map_err(|e| {
                GatewayError::Configuration(format!(
                    "cannot listen on {}: {e}",
                    forward.listen
                ))
            })?;
            info!(listen = %forward.listen, connect = %forward.connect, "host forward active");

            let forward = *forward;
            let commands = commands.clone();
            tasks.push(tokio::spawn(accept_loop(
                listener,
                forward,
                commands,
                gateway_ip4,
                gateway_ip6,
                dial_timeout,
                splice_buffer,
            )));
        }
        Ok(Self { tasks })
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for HostTcpForwarder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    forward: HostForward,
    commands: mpsc::Sender<StackCommand>,
    gateway_ip4: Ipv4Addr,
    gateway_ip6: Ipv6Addr,
    dial_timeout: Duration,
    splice_buffer: usize,
) {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, listen = %forward.listen, "accept failed");
                continue;
            }
        };

        // Spoof the guest-visible source: gateway IP, host client's port.
        let source_ip: IpAddr = match forward.connect {
            SocketAddr::V4(_) => gateway_ip4.into(),
            SocketAddr::V6(_) => gateway_ip6.into(),
        };
        let source = SocketAddr::new(source_ip, peer.port());

        let commands = commands.clone();
        tokio::spawn(async move {
            if let Err(e) =
                handle_conn(conn, source, forward.connect, commands, dial_timeout, splice_buffer)
                    .await
            {
                debug!(error = %e, %peer, connect = %forward.connect, "host forward failed");
            }
        });
    }
}

async fn handle_conn(
    conn: TcpStream,
    source: SocketAddr,
    connect: SocketAddr,
    commands: mpsc::Sender<StackCommand>,
    dial_timeout: Duration,
    splice_buffer: usize,
) -> Result<()> {
    let virt = dial_guest(source, connect, commands, dial_timeout).await?;
    let _ = conn.set_nodelay(true);
    tcp_forward::splice(virt, conn, splice_buffer).await?;
    Ok(())
}

/// Dial into the stack with a bound (spoofed) local address and a deadline.
async fn dial_guest(
    local: SocketAddr,
    remote: SocketAddr,
    commands: mpsc::Sender<StackCommand>,
    deadline: Duration,
) -> Result<VirtualStream> {
    let (reply_tx, reply_rx) = oneshot::channel();
    commands
        .send(StackCommand::DialGuest {
            local,
            remote,
            reply: reply_tx,
        })
        .await
        .map_err(|_| GatewayError::Stack("stack loop is gone".into()))?;

    match tokio::time::timeout(deadline, reply_rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(GatewayError::Stack("stack dropped the dial".into())),
        Err(_) => Err(GatewayError::Connection(format!(
            "dial into guest {remote} timed out"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostForward;

    #[tokio::test]
    async fn accepted_connection_requests_a_spoofed_dial() {
        let (commands, mut command_rx) = mpsc::channel(8);
        let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let connect: SocketAddr = "198.19.248.2:22".parse().unwrap();

        // Bind manually first to learn the port.
        let listener = TcpListener::bind(listen).await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let mut forwarder = HostTcpForwarder::start(
            &[HostForward {
                listen: bound,
                connect,
            }],
            commands,
            Ipv4Addr::new(198, 19, 248, 1),
            "fd00:96dc:7096:1df0::1".parse().unwrap(),
            Duration::from_secs(1),
            64 * 1024,
        )
        .await
        .unwrap();

        let client = TcpStream::connect(bound).await.unwrap();
        let client_port = client.local_addr().unwrap().port();

        let command = tokio::time::timeout(Duration::from_secs(2), command_rx.recv())
            .await
            .expect("dial command")
            .unwrap();
        match command {
            StackCommand::DialGuest { local, remote, .. } => {
                assert_eq!(remote, connect);
                assert_eq!(local.ip(), "198.19.248.1".parse::<IpAddr>().unwrap());
                assert_eq!(local.port(), client_port);
            }
            _ => panic!("expected a guest dial"),
        }

        forwarder.shutdown();
    }

    #[tokio::test]
    async fn unbindable_listener_is_a_configuration_error() {
        let (commands, _command_rx) = mpsc::channel(8);
        // Port 1 is privileged; binding fails for unprivileged test runs.
        let result = HostTcpForwarder::start(
            &[HostForward {
                listen: "127.0.0.1:1".parse().unwrap(),
                connect: "198.19.248.2:22".parse().unwrap(),
            }],
            commands,
            Ipv4Addr::new(198, 19, 248, 1),
            "fd00:96dc:7096:1df0::1".parse().unwrap(),
            Duration::from_secs(1),
            64 * 1024,
        )
        .await;
        assert!(matches!(result, Err(GatewayError::Configuration(_))));
    }
}
