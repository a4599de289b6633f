//! Health-monitor control loop (SPEC_FULL.md §4.F): periodically probes
//! quarantined servers and reinstates the ones that answer again.
//!
//! Grounded on `volo-thrift/src/transport/pool/mod.rs`'s `sweep_loop`
//! (a `Weak`-keyed `tokio::spawn`ed ticker) for the task shape, and on
//! `ManagedConn::validate`'s `Noop` probe for the liveness check itself.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use tokio::time::{interval, Duration};
use tracing::{debug, warn};

use crate::{
    client::{conn::ManagedConn, Config, Registry},
    net::Server,
    pool::{ConnectionFactory, Poolable},
};

/// Spawns the health-monitor task. Returns `None` without spawning
/// anything if `failover` is disabled or `health_interval` is zero
/// (SPEC_FULL.md §4.F "Never ... If `failover` is disabled ... does not
/// run"). Holds only a [`Weak`] reference to the registry so the monitor
/// doesn't keep a dropped client's state alive.
pub fn spawn(registry: &Arc<Registry>, config: Config) -> Option<tokio::task::JoinHandle<()>> {
    if !config.failover || config.health_interval.is_zero() {
        return None;
    }
    let weak = Arc::downgrade(registry);
    Some(tokio::spawn(run(weak, config)))
}

async fn run(registry: Weak<Registry>, config: Config) {
    let running = Arc::new(AtomicBool::new(false));
    let mut ticker = interval(config.health_interval);
    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            debug!("registry dropped, health monitor exiting");
            return;
        };

        // A second tick arriving while a probe round is still in flight is
        // dropped rather than queued (SPEC_FULL.md §4.F "Reentrancy is
        // prevented by an atomic is-running flag").
        if running.swap(true, Ordering::AcqRel) {
            debug!("health probe round still running, skipping this tick");
            continue;
        }
        let running = running.clone();
        tokio::spawn(async move {
            probe_round(&registry, &config).await;
            running.store(false, Ordering::Release);
        });
    }
}

async fn probe_round(registry: &Registry, config: &Config) {
    let quarantined = registry.quarantined_snapshot();
    if quarantined.is_empty() {
        return;
    }

    let mut revivals = Vec::new();
    for server in quarantined {
        if probe(server, registry.factory.as_ref(), config.connect_timeout, config.response_timeout).await {
            revivals.push(server);
        }
    }

    for server in revivals {
        // Re-adding goes through the pool's non-initial add_server path
        // (`create_all_min_objects`); `revive` re-quarantines on its own if
        // that fails (SPEC_FULL.md §4.F step 4).
        if registry.revive(server).await {
            debug!(%server, "health monitor revived server");
        } else {
            warn!(%server, "health monitor probe succeeded but revival failed, re-quarantined");
        }
    }
}

/// Opens a fresh, untracked connection, runs the `Noop` validation probe,
/// and closes it regardless of outcome (SPEC_FULL.md §4.F step 2) — the
/// connection is simply dropped at the end of this function, never handed
/// to the pool.
async fn probe(
    server: Server,
    factory: &dyn ConnectionFactory<ManagedConn>,
    connect_timeout: Duration,
    response_timeout: Duration,
) -> bool {
    let dial = tokio::time::timeout(connect_timeout, factory.create(server)).await;
    let mut conn = match dial {
        Ok(Ok(conn)) => conn,
        Ok(Err(err)) => {
            debug!(%server, %err, "health probe failed to connect");
            return false;
        }
        Err(_) => {
            debug!(%server, "health probe connect timed out");
            return false;
        }
    };
    conn.validate(response_timeout).await
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::client::{Client, RawCodec};
    use bytes::Bytes;

    fn server(port: u16) -> Server {
        Server(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[tokio::test]
    async fn does_not_spawn_when_failover_disabled() {
        let client: Client<Bytes, RawCodec> =
            Client::new([server(1)], Config::default().with_failover(false), RawCodec);
        let registry = client.registry();
        assert!(spawn(&registry, client.config()).is_none());
    }

    #[tokio::test]
    async fn does_not_spawn_when_health_interval_is_zero() {
        let client: Client<Bytes, RawCodec> = Client::new(
            [server(2)],
            Config::default().with_health_interval(Duration::from_secs(0)),
            RawCodec,
        );
        let registry = client.registry();
        assert!(spawn(&registry, client.config()).is_none());
    }

    #[tokio::test]
    async fn probe_round_is_a_no_op_with_nothing_quarantined() {
        let client: Client<Bytes, RawCodec> = Client::new([server(3)], Config::default(), RawCodec);
        let registry = client.registry();
        // Should return immediately without attempting to dial anything.
        probe_round(&registry, &client.config()).await;
        assert!(registry.quarantined_snapshot().is_empty());
    }

    #[tokio::test]
    async fn quarantine_then_revive_round_trips_through_the_registry() {
        let client: Client<Bytes, RawCodec> = Client::new([server(4)], Config::default(), RawCodec);
        let registry = client.registry();
        registry.quarantine(server(4));
        assert!(!registry.ring.contains(server(4)));
        assert_eq!(registry.quarantined_snapshot(), vec![server(4)]);

        assert!(registry.revive(server(4)).await);
        assert!(registry.ring.contains(server(4)));
        assert!(registry.quarantined_snapshot().is_empty());
    }
}
