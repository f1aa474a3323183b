//! Static NAT table.
//!
//! Maps guest-visible "virtual host" addresses (e.g. `198.19.248.254`) to
//! host-visible ones (loopback). The table is populated at construction and
//! read-mostly afterwards; lookups always produce an address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

pub struct NatTable {
    map: RwLock<HashMap<IpAddr, IpAddr>>,
}

impl NatTable {
    pub fn new(pairs: impl IntoIterator<Item = (IpAddr, IpAddr)>) -> Self {
        Self {
            map: RwLock::new(pairs.into_iter().collect()),
        }
    }

    /// Resolve a guest-visible address to the host-visible one, or return
    /// the input unchanged when no mapping exists.
    pub fn resolve(&self, addr: IpAddr) -> IpAddr {
        let map = self.map.read().unwrap();
        map.get(&addr).copied().unwrap_or(addr)
    }
}
