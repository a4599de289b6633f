//! Server discovery: a static list, and the callback interface a
//! coordination-service client (ZooKeeper/etcd) is expected to drive
//! (SPEC_FULL.md §6).
//!
//! Grounded on `volo/src/discovery/mod.rs`'s `Discover` trait and
//! `StaticDiscover`, simplified to this crate's single-cluster shape: no
//! `Key`/`watch`/`Change` machinery, since a memcached client has exactly
//! one server set rather than per-endpoint discovery results.

use std::net::{IpAddr, SocketAddr};

use crate::{
    error::{Error, Result},
    net::Server,
};

#[async_trait::async_trait]
pub trait Discover: Send + Sync + 'static {
    async fn discover(&self) -> Result<Vec<Server>>;
}

/// A fixed, pre-configured server list (SPEC_FULL.md §3 "added by
/// configuration").
#[derive(Debug, Clone)]
pub struct StaticDiscover {
    servers: Vec<Server>,
}

impl StaticDiscover {
    pub fn new(servers: impl IntoIterator<Item = Server>) -> Self {
        StaticDiscover {
            servers: servers.into_iter().collect(),
        }
    }
}

#[async_trait::async_trait]
impl Discover for StaticDiscover {
    async fn discover(&self) -> Result<Vec<Server>> {
        Ok(self.servers.clone())
    }
}

/// Callbacks a coordination-service client drives as the cache server list
/// changes (SPEC_FULL.md §6 "Coordination-service listener"). `bytes`
/// encodes the list as UTF-8 `"host:port,host:port"`.
pub trait CacheServerListener: Send + Sync + 'static {
    fn on_init(&self, path: &str, bytes: &[u8]);
    fn on_commit(&self, path: &str, bytes: &[u8]);
    fn on_destroy(&self, path: &str);
}

/// Parses a `"host:port,host:port"` server list. Commas or spaces
/// separate entries; within an entry the *last* `:` splits host from
/// port, so bracketless IPv6 hosts like `::1:11211` parse correctly.
pub fn parse_server_list(raw: &str) -> Result<Vec<Server>> {
    raw.split([',', ' '])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_entry)
        .collect()
}

fn parse_entry(entry: &str) -> Result<Server> {
    let split_at = entry
        .rfind(':')
        .ok_or_else(|| Error::Framing(format!("server entry {entry:?} has no port")))?;
    let (host, port) = (&entry[..split_at], &entry[split_at + 1..]);

    let port: u16 = port
        .parse()
        .map_err(|_| Error::Framing(format!("server entry {entry:?} has a non-numeric port")))?;
    let ip: IpAddr = host
        .parse()
        .map_err(|_| Error::Framing(format!("server entry {entry:?} has an unparseable host")))?;
    Ok(Server(SocketAddr::new(ip, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_list() {
        let servers = parse_server_list("127.0.0.1:11211,127.0.0.2:11212").unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].addr().port(), 11211);
        assert_eq!(servers[1].addr().port(), 11212);
    }

    #[test]
    fn parses_space_separated_list_with_blank_entries() {
        let servers = parse_server_list(" 127.0.0.1:11211   127.0.0.2:11212 ").unwrap();
        assert_eq!(servers.len(), 2);
    }

    #[test]
    fn parses_bracketless_ipv6_entry_via_last_colon_split() {
        let servers = parse_server_list("::1:11211").unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].addr().port(), 11211);
        assert_eq!(servers[0].addr().ip(), "::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn rejects_entry_without_port() {
        assert!(parse_server_list("127.0.0.1").is_err());
    }

    #[tokio::test]
    async fn static_discover_returns_configured_servers() {
        let s = Server(SocketAddr::from(([127, 0, 0, 1], 11211)));
        let discover = StaticDiscover::new([s]);
        assert_eq!(discover.discover().await.unwrap(), vec![s]);
    }
}
