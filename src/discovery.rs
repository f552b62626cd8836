//! Device discovery: mapping device ids to relay addresses.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use crate::common::format_duration;
use crate::error::Result;
use crate::identity::DeviceId;

/// Directory of device addresses.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Addresses currently announced for `id`, possibly empty.
    async fn lookup(&self, id: &DeviceId) -> Result<Vec<String>>;

    /// Publishes `addresses` for `id`, replacing earlier announcements.
    async fn announce(&self, id: &DeviceId, addresses: Vec<String>) -> Result<()>;
}

/// Source of the addresses a device announces.
pub trait AddressLister: Send + Sync {
    /// Addresses other devices can reach.
    fn external_addresses(&self) -> Vec<String>;

    /// Every address this device listens on, reachable or not.
    fn all_addresses(&self) -> Vec<String>;
}

/// Periodically announces a device's addresses.
pub struct Announcer<D> {
    discovery: Arc<D>,
    id: DeviceId,
    interval: Duration,
}

impl<D: Discovery> Announcer<D> {
    pub fn new(discovery: Arc<D>, id: DeviceId, interval: Duration) -> Self {
        Self {
            discovery,
            id,
            interval,
        }
    }

    /// Announces now and then every interval until `shutdown` fires.
    ///
    /// Rounds where the lister has no addresses are skipped. Failed
    /// announcements are logged and retried on the next round.
    pub async fn serve(
        &self,
        lister: &dyn AddressLister,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        tracing::debug!(
            id = %self.id.short(),
            interval = %format_duration(self.interval),
            "announcer started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let addresses = lister.external_addresses();
                    if addresses.is_empty() {
                        tracing::debug!(local = ?lister.all_addresses(), "no external addresses to announce yet");
                        continue;
                    }
                    match self.discovery.announce(&self.id, addresses.clone()).await {
                        Ok(()) => tracing::debug!(?addresses, "announced"),
                        Err(e) => tracing::warn!(error = %e, "announce failed"),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("announcer received shutdown signal");
                    return Ok(());
                }
            }
        }
    }
}

/// In-memory discovery directory.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    entries: RwLock<HashMap<DeviceId, Vec<String>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed entry.
    pub fn with_entry(mut self, id: DeviceId, addresses: Vec<String>) -> Self {
        self.entries.get_mut().insert(id, addresses);
        self
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn lookup(&self, id: &DeviceId) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn announce(&self, id: &DeviceId, addresses: Vec<String>) -> Result<()> {
        self.entries.write().await.insert(*id, addresses);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedLister(Mutex<Vec<String>>);

    impl AddressLister for FixedLister {
        fn external_addresses(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn all_addresses(&self) -> Vec<String> {
            self.external_addresses()
        }
    }

    #[tokio::test]
    async fn test_static_lookup() {
        let id = DeviceId::from_der(b"device");
        let other = DeviceId::from_der(b"other");
        let discovery = StaticDiscovery::new().with_entry(id, vec!["tcp://a:1".to_string()]);

        assert_eq!(discovery.lookup(&id).await.unwrap(), vec!["tcp://a:1"]);
        assert!(discovery.lookup(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_announce_replaces_entry() {
        let id = DeviceId::from_der(b"device");
        let discovery = StaticDiscovery::new().with_entry(id, vec!["tcp://old:1".to_string()]);
        discovery
            .announce(&id, vec!["tcp://new:2".to_string()])
            .await
            .unwrap();
        assert_eq!(discovery.lookup(&id).await.unwrap(), vec!["tcp://new:2"]);
    }

    #[tokio::test]
    async fn test_announcer_skips_empty_then_publishes() {
        let id = DeviceId::from_der(b"server");
        let discovery = Arc::new(StaticDiscovery::new());
        let lister = Arc::new(FixedLister(Mutex::new(Vec::new())));
        let (shutdown_tx, _) = broadcast::channel(1);

        let announcer = Announcer::new(Arc::clone(&discovery), id, Duration::from_millis(20));
        let task = {
            let lister = Arc::clone(&lister);
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move { announcer.serve(lister.as_ref(), shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(discovery.lookup(&id).await.unwrap().is_empty());

        *lister.0.lock().unwrap() = vec!["tcp://127.0.0.1:22067".to_string()];
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            discovery.lookup(&id).await.unwrap(),
            vec!["tcp://127.0.0.1:22067"]
        );

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    struct UnreachableLister {
        local: Vec<String>,
        local_queries: AtomicUsize,
    }

    impl AddressLister for UnreachableLister {
        fn external_addresses(&self) -> Vec<String> {
            Vec::new()
        }

        fn all_addresses(&self) -> Vec<String> {
            self.local_queries.fetch_add(1, Ordering::SeqCst);
            self.local.clone()
        }
    }

    #[tokio::test]
    async fn test_announcer_never_publishes_local_only_addresses() {
        let id = DeviceId::from_der(b"server");
        let discovery = Arc::new(StaticDiscovery::new());
        let lister = Arc::new(UnreachableLister {
            local: vec!["tcp://10.0.0.5:22067".to_string()],
            local_queries: AtomicUsize::new(0),
        });
        let (shutdown_tx, _) = broadcast::channel(1);

        let announcer = Announcer::new(Arc::clone(&discovery), id, Duration::from_millis(20));
        let task = {
            let lister = Arc::clone(&lister);
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move { announcer.serve(lister.as_ref(), shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        assert!(lister.local_queries.load(Ordering::SeqCst) > 0);
        assert!(discovery.lookup(&id).await.unwrap().is_empty());
    }
}
