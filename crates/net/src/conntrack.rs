//! Connection-tracking helpers: flow keys, idle timers and the
//! external-address reverse index shared between the UDP forwarder and the
//! ICMP relay.

use smoltcp::wire::EthernetAddress;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One endpoint of a tracked flow. Addresses are stored as 128-bit values
/// with IPv4 zero-extended into the low 32 bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FlowAddr {
    ip: u128,
    port: u16,
}

impl FlowAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => u32::from(v4) as u128,
            IpAddr::V6(v6) => u128::from(v6),
        };
        Self { ip, port }
    }
}

impl From<SocketAddr> for FlowAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

/// Key for one tracked UDP flow: the guest's source tuple plus the
/// destination it addressed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct UdpFlowKey {
    pub client: FlowAddr,
    pub dest: FlowAddr,
}

impl UdpFlowKey {
    pub fn new(client: SocketAddr, dest: SocketAddr) -> Self {
        Self {
            client: client.into(),
            dest: dest.into(),
        }
    }
}

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// Monotonic generation stamp, used for compare-and-swap deletion so a
/// delayed reaper never removes an entry that was re-created in the
/// meantime.
pub fn next_generation() -> u64 {
    GENERATION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug)]
pub struct ExternalEntry {
    pub client: SocketAddr,
    pub client_mac: EthernetAddress,
    pub generation: u64,
}

/// Reverse index from a host socket's local endpoint to the guest flow it
/// serves. Entries outlive their conntrack entry by one idle timeout so
/// in-flight ICMP errors can still be attributed.
pub struct ExternalIndex {
    map: RwLock<HashMap<FlowAddr, ExternalEntry>>,
}

impl ExternalIndex {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, local: SocketAddr, entry: ExternalEntry) {
        let mut map = self.map.write().unwrap();
        map.insert(local.into(), entry);
    }

    pub fn lookup(&self, ip: IpAddr, port: u16) -> Option<ExternalEntry> {
        let map = self.map.read().unwrap();
        map.get(&FlowAddr::new(ip, port)).copied()
    }

    /// Remove the entry only if it still carries `generation`.
    pub fn remove_if(&self, local: SocketAddr, generation: u64) {
        let mut map = self.map.write().unwrap();
        let key = FlowAddr::from(local);
        if map.get(&key).is_some_and(|e| e.generation == generation) {
            map.remove(&key);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }
}

impl Default for ExternalIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared last-activity clock for a tracked flow.
///
/// The forward path touches it on every guest datagram; the reply loop
/// derives its rolling read deadline from it.
pub struct ActivityClock {
    epoch: tokio::time::Instant,
    offset_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.offset_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Instant at which the flow becomes idle.
    pub fn deadline(&self, idle: Duration) -> tokio::time::Instant {
        let offset = Duration::from_millis(self.offset_ms.load(Ordering::Relaxed));
        self.epoch + offset + idle
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn ipv4_is_zero_extended() {
        let v4 = FlowAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 53);
        assert_eq!(v4.ip, 0x0a000001);
        assert_eq!(v4.port, 53);
    }

    #[test]
    fn families_with_same_low_bits_are_distinct_keys() {
        let v4 = FlowAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 1)), 53);
        let v6 = FlowAddr::new(IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)), 53);
        assert_ne!(v4, v6);
    }

    #[test]
    fn generations_are_monotonic() {
        let a = next_generation();
        let b = next_generation();
        assert!(b > a);
    }

    #[test]
    fn remove_if_respects_generation() {
        let index = ExternalIndex::new();
        let local: SocketAddr = "127.0.0.1:34567".parse().unwrap();
        let client: SocketAddr = "198.19.248.2:40000".parse().unwrap();
        let mac = EthernetAddress([0x52, 0x54, 0, 0, 0, 2]);

        let old_gen = next_generation();
        index.insert(
            local,
            ExternalEntry {
                client,
                client_mac: mac,
                generation: old_gen,
            },
        );

        // A fresh entry for the same tuple supersedes the old generation.
        let new_gen = next_generation();
        index.insert(
            local,
            ExternalEntry {
                client,
                client_mac: mac,
                generation: new_gen,
            },
        );

        index.remove_if(local, old_gen);
        assert!(index.lookup(local.ip(), local.port()).is_some());

        index.remove_if(local, new_gen);
        assert!(index.lookup(local.ip(), local.port()).is_none());
        assert_eq!(index.len(), 0);
    }

    #[tokio::test]
    async fn activity_touch_extends_deadline() {
        let clock = ActivityClock::new();
        let idle = Duration::from_secs(90);
        let first = clock.deadline(idle);
        tokio::time::sleep(Duration::from_millis(5)).await;
        clock.touch();
        assert!(clock.deadline(idle) >= first);
    }
}
