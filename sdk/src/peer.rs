//! Client-side datagram peer table.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::RwLock;

/// What the client knows about one remote node's datagram endpoint.
///
/// `Unknown → Advertised → Reachable`, or `Unknown/Advertised →
/// TriedUnreachable` when the lookup fails or the probe times out. A
/// direct datagram send is permitted only while `reachable` holds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub addr: Option<SocketAddr>,
    /// A probe or lookup has been attempted; until `reachable` flips,
    /// anon sends fall back to broker relay.
    pub tried: bool,
    /// A PONG has been observed from `addr`.
    pub reachable: bool,
}

impl Peer {
    fn advertised(addr: SocketAddr) -> Self {
        Self {
            addr: Some(addr),
            tried: false,
            reachable: false,
        }
    }
}

/// Peer entries persist for the client's lifetime; there is no eviction.
#[derive(Debug, Default)]
pub struct Peers(RwLock<HashMap<String, Peer>>);

impl Peers {
    pub fn get(&self, node: &str) -> Option<Peer> {
        self.0.read().get(node).copied()
    }

    /// Records an endpoint report. The same endpoint keeps its flags so a
    /// confirmed fast path survives a redundant lookup; a changed one
    /// starts over unprobed.
    pub fn advertise(&self, node: &str, addr: SocketAddr) {
        let mut peers = self.0.write();
        let entry = peers.entry(node.to_owned()).or_default();

        if entry.addr != Some(addr) {
            *entry = Peer::advertised(addr);
        }
    }

    /// Records a failed lookup or a lost endpoint: relay from now on.
    pub fn mark_unreachable(&self, node: &str) {
        let mut peers = self.0.write();
        let entry = peers.entry(node.to_owned()).or_default();
        entry.tried = true;
        entry.reachable = false;
    }

    /// Marks a probe as sent, before its outcome is known.
    pub fn mark_tried(&self, node: &str) {
        if let Some(entry) = self.0.write().get_mut(node) {
            entry.tried = true;
        }
    }

    /// Confirms whichever entry advertised `addr`, returning its name.
    pub fn confirm(&self, addr: SocketAddr) -> Option<String> {
        let mut peers = self.0.write();
        for (name, peer) in peers.iter_mut() {
            if peer.addr == Some(addr) {
                peer.reachable = true;
                peer.tried = true;
                return Some(name.clone());
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::{Peer, Peers};

    #[test]
    fn pong_confirms_by_address() {
        let peers = Peers::default();
        let addr = "127.0.0.1:40001".parse().unwrap();

        peers.advertise("y", addr);
        assert_eq!(peers.get("y"), Some(Peer { addr: Some(addr), tried: false, reachable: false }));

        // A pong from an unrelated address confirms nothing.
        assert_eq!(peers.confirm("127.0.0.1:40002".parse().unwrap()), None);

        peers.mark_tried("y");
        assert_eq!(peers.confirm(addr).as_deref(), Some("y"));
        assert!(peers.get("y").unwrap().reachable);
    }

    #[test]
    fn failed_lookup_pins_the_relay_path() {
        let peers = Peers::default();

        peers.mark_unreachable("y");
        let peer = peers.get("y").unwrap();
        assert!(peer.tried && !peer.reachable);
        assert_eq!(peer.addr, None);
    }

    #[test]
    fn a_new_endpoint_resets_the_probe_state() {
        let peers = Peers::default();
        let old = "127.0.0.1:40001".parse().unwrap();
        let new = "127.0.0.1:40002".parse().unwrap();

        peers.advertise("y", old);
        peers.mark_tried("y");
        peers.confirm(old);

        // Re-advertising the same endpoint is a no-op...
        peers.advertise("y", old);
        assert!(peers.get("y").unwrap().reachable);

        // ...but a different one must be probed again.
        peers.advertise("y", new);
        let peer = peers.get("y").unwrap();
        assert_eq!(peer.addr, Some(new));
        assert!(!peer.tried && !peer.reachable);
    }
}
