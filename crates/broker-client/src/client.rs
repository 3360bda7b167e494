use crate::broker::{Broker, BrokerId};
use crate::config::Config;
use crate::pool::BufPool;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// State shared by every broker and connection of a client: configuration,
/// the shutdown signal, the encode buffer pool, and the epoch that anchors
/// the atomic nanosecond timestamps.
pub(crate) struct Core {
    pub(crate) cfg: Config,
    pub(crate) shutdown: CancellationToken,
    pub(crate) pool: BufPool,
    pub(crate) epoch: Instant,
}

impl Core {
    pub(crate) fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Owns the set of brokers and the client-wide machinery around them.
///
/// Brokers are created on first reference and live until
/// [`Broker::stop_forever`] or [`Client::shutdown`]. Higher layers
/// (metadata discovery, producers, consumers) decide *which* broker to talk
/// to; this type only maintains them.
pub struct Client {
    core: Arc<Core>,
    brokers: Mutex<Vec<Arc<Broker>>>,
}

impl Client {
    pub fn new(cfg: Config) -> Arc<Client> {
        Arc::new(Client {
            core: Arc::new(Core {
                cfg,
                shutdown: CancellationToken::new(),
                pool: BufPool::new(),
                epoch: Instant::now(),
            }),
            brokers: Mutex::new(Vec::new()),
        })
    }

    /// The broker with this identity, created (and its writer task started)
    /// on first reference.
    pub fn broker(&self, node: i32, host: &str, port: u16, rack: Option<&str>) -> Arc<Broker> {
        let id = BrokerId {
            node,
            host: host.to_string(),
            port,
            rack: rack.map(str::to_string),
        };
        let mut brokers = self.brokers.lock().unwrap();
        if let Some(broker) = brokers.iter().find(|b| *b.id() == id) {
            return broker.clone();
        }
        let broker = Broker::spawn(self.core.clone(), id);
        brokers.push(broker.clone());
        broker
    }

    /// A seed broker: configured by the user but not yet discovered through
    /// metadata, so it gets a synthetic node id that can never collide with
    /// a real one.
    pub fn seed_broker(&self, seed_index: i32, host: &str, port: u16) -> Arc<Broker> {
        self.broker(i32::MIN + seed_index, host, port, None)
    }

    /// Spawn the idle-connection reaper in the background.
    pub fn run_reaper(self: &Arc<Self>) {
        let client = self.clone();
        tokio::spawn(async move { client.reap_connections_loop().await });
    }

    /// Every `conn_idle_timeout`, kill connections that have been quiet in
    /// one direction past the timeout without an in-progress read or write.
    /// Runs until client shutdown.
    pub async fn reap_connections_loop(&self) {
        let idle = self.core.cfg.conn_idle_timeout;
        let mut ticker = tokio::time::interval(idle);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // The first tick completes immediately.
        loop {
            tokio::select! {
                _ = self.core.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let brokers: Vec<_> = self.brokers.lock().unwrap().clone();
            for broker in brokers {
                broker.reap_connections(idle).await;
            }
        }
    }

    /// Cancel the client-wide signal and stop every broker. In-flight
    /// writes and reads resolve with `ClientClosing`; queued requests drain
    /// with `ChosenBrokerDead`.
    pub fn shutdown(&self) {
        tracing::debug!("client shutting down");
        self.core.shutdown.cancel();
        let brokers: Vec<_> = self.brokers.lock().unwrap().clone();
        for broker in brokers {
            broker.stop_forever();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn brokers_are_created_once_per_identity() {
        let client = Client::new(Config::default());
        let a = client.broker(1, "localhost", 9092, None);
        let b = client.broker(1, "localhost", 9092, None);
        assert!(Arc::ptr_eq(&a, &b));

        let c = client.broker(1, "localhost", 9093, None);
        assert!(!Arc::ptr_eq(&a, &c));

        let d = client.broker(1, "localhost", 9092, Some("rack"));
        assert!(!Arc::ptr_eq(&a, &d));
    }

    #[tokio::test]
    async fn seed_brokers_get_synthetic_ids() {
        let client = Client::new(Config::default());
        let seed0 = client.seed_broker(0, "seed-0", 9092);
        let seed1 = client.seed_broker(1, "seed-1", 9092);
        assert_eq!(seed0.id().node, i32::MIN);
        assert_eq!(seed1.id().node, i32::MIN + 1);
    }
}
