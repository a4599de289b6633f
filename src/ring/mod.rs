//! Consistent-hash ring: deterministic key-to-server routing, stable under
//! membership changes.
//!
//! Grounded on `volo::loadbalance::consistent_hash`: the `VirtualNode`/sort/
//! `partition_point` lookup idiom and the `mur3` hash family are carried
//! over unchanged. What's generalized: the teacher caches one
//! `WeightedInstances` per discovery key inside a `DashMap` and rebuilds it
//! from `Discover`/`Change` events; this ring has a single membership (one
//! memcached cluster) and is mutated directly by `add`/`remove`, with the
//! whole snapshot swapped atomically via `arc_swap::ArcSwap` so readers
//! never observe a torn ring (SPEC_FULL.md §5).

use std::sync::Mutex;

use arc_swap::ArcSwap;

use crate::net::Server;

/// Number of virtual nodes contributed by each server. Unweighted: every
/// server gets the same number of points on the ring.
const DEFAULT_VIRTUAL_FACTOR: u32 = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VirtualNode {
    hash: u64,
    server: Server,
}

impl VirtualNode {
    /// Ordering used both to sort the ring and to compare on hash
    /// collision: hash first, then server identity bytewise ascending
    /// (SPEC_FULL.md §4.A "Tie-breaks").
    fn sort_key(&self) -> (u64, Vec<u8>) {
        (self.hash, self.server.identity_bytes())
    }
}

fn hash_token(bytes: &[u8]) -> u64 {
    mur3::murmurhash3_x64_128(bytes, 0).0
}

fn virtual_node_hash(server: &Server, index: u32) -> u64 {
    let key = format!("{server}-{index}");
    hash_token(key.as_bytes())
}

fn build_nodes(members: &[Server], virtual_factor: u32) -> Vec<VirtualNode> {
    let mut nodes = Vec::with_capacity(members.len() * virtual_factor as usize);
    for server in members {
        for i in 0..virtual_factor {
            nodes.push(VirtualNode {
                hash: virtual_node_hash(server, i),
                server: *server,
            });
        }
    }
    nodes.sort_unstable_by_key(VirtualNode::sort_key);
    nodes
}

/// A sorted, atomically-replaced snapshot of the ring plus the writer-side
/// membership list used to rebuild it.
pub struct HashRing {
    virtual_factor: u32,
    nodes: ArcSwap<Vec<VirtualNode>>,
    // Writers serialize here; readers never take this lock.
    members: Mutex<Vec<Server>>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_FACTOR)
    }
}

impl HashRing {
    pub fn new(virtual_factor: u32) -> Self {
        Self {
            virtual_factor,
            nodes: ArcSwap::from_pointee(Vec::new()),
            members: Mutex::new(Vec::new()),
        }
    }

    pub fn with_servers(servers: impl IntoIterator<Item = Server>, virtual_factor: u32) -> Self {
        let members: Vec<Server> = servers.into_iter().collect();
        let nodes = build_nodes(&members, virtual_factor);
        Self {
            virtual_factor,
            nodes: ArcSwap::from_pointee(nodes),
            members: Mutex::new(members),
        }
    }

    /// Adds a server to the ring. Idempotent: adding an already-present
    /// server is a no-op.
    pub fn add(&self, server: Server) {
        let mut members = self.members.lock().unwrap();
        if members.contains(&server) {
            return;
        }
        members.push(server);
        self.nodes
            .store(std::sync::Arc::new(build_nodes(&members, self.virtual_factor)));
    }

    /// Removes a server from the ring. Idempotent.
    pub fn remove(&self, server: Server) {
        let mut members = self.members.lock().unwrap();
        let before = members.len();
        members.retain(|s| *s != server);
        if members.len() != before {
            self.nodes
                .store(std::sync::Arc::new(build_nodes(&members, self.virtual_factor)));
        }
    }

    pub fn contains(&self, server: Server) -> bool {
        self.members.lock().unwrap().contains(&server)
    }

    pub fn clear(&self) {
        let mut members = self.members.lock().unwrap();
        members.clear();
        self.nodes.store(std::sync::Arc::new(Vec::new()));
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().unwrap().is_empty()
    }

    pub fn servers(&self) -> Vec<Server> {
        self.members.lock().unwrap().clone()
    }

    /// Maps `key` to the server owning the smallest token >= hash(key),
    /// wrapping to the smallest token if none (SPEC_FULL.md §3). Returns
    /// `None` only if the ring is empty.
    pub fn get(&self, key: &[u8]) -> Option<Server> {
        let nodes = self.nodes.load();
        if nodes.is_empty() {
            return None;
        }
        let key_hash = hash_token(key);
        let mut index = nodes.partition_point(|vn| vn.hash < key_hash);
        if index == nodes.len() {
            index = 0;
        }
        Some(nodes[index].server)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn server(s: &str) -> Server {
        Server(s.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn empty_ring_returns_none() {
        let ring = HashRing::default();
        assert_eq!(ring.get(b"foo"), None);
    }

    #[test]
    fn lookup_is_consistent_for_same_key() {
        let ring = HashRing::with_servers(
            [server("127.0.0.1:11211"), server("127.0.0.2:11211")],
            160,
        );
        let a = ring.get(b"some-key");
        let b = ring.get(b"some-key");
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn remove_then_no_key_resolves_to_removed_server() {
        let s1 = server("127.0.0.1:11211");
        let s2 = server("127.0.0.2:11211");
        let ring = HashRing::with_servers([s1, s2], 160);

        let keys: Vec<Vec<u8>> = (0..500).map(|i| format!("key-{i}").into_bytes()).collect();
        ring.remove(s1);
        for key in &keys {
            assert_ne!(ring.get(key), Some(s1));
        }

        ring.add(s1);
        // after re-adding, at least some keys should route back to s1
        assert!(keys.iter().any(|k| ring.get(k) == Some(s1)));
    }

    #[test]
    fn add_or_remove_only_moves_keys_between_affected_server_and_neighbors() {
        let mut servers: Vec<Server> = (0..8)
            .map(|i| server(&format!("127.0.0.1:{}", 11000 + i)))
            .collect();
        let ring = HashRing::with_servers(servers.clone(), 160);
        let keys: Vec<Vec<u8>> = (0..2000).map(|i| format!("key-{i}").into_bytes()).collect();
        let before: Vec<_> = keys.iter().map(|k| ring.get(k)).collect();

        let removed = servers.pop().unwrap();
        ring.remove(removed);

        let mut moved_from_other_than_removed = 0;
        for (key, prev) in keys.iter().zip(before.iter()) {
            let now = ring.get(key);
            if *prev != Some(removed) && now != *prev {
                moved_from_other_than_removed += 1;
            }
        }
        assert_eq!(moved_from_other_than_removed, 0);
    }

    #[test]
    fn contains_and_clear() {
        let s1 = server("127.0.0.1:11211");
        let ring = HashRing::default();
        assert!(!ring.contains(s1));
        ring.add(s1);
        assert!(ring.contains(s1));
        ring.clear();
        assert!(!ring.contains(s1));
        assert!(ring.is_empty());
    }
}
