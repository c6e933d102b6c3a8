use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::future::{BoxFuture, FutureExt};

use crate::balancer::ChannelManager;
use crate::config::Config;
use crate::database::Database;
use crate::models::{AccessMode, ChannelInfo, NodeInfo};
use crate::stats::{NodeMetrics, NodeMetricsClient, StatsManager, WalMetrics};
use crate::store::ChannelStore;

/// A node metrics client which always returns the same metrics.
pub struct StaticMetricsClient(pub Vec<WalMetrics>);

impl NodeMetricsClient for StaticMetricsClient {
    fn get_metrics<'a>(&'a self, node: &'a NodeInfo) -> BoxFuture<'a, Result<NodeMetrics>> {
        let metrics = NodeMetrics {
            node: node.clone(),
            wal_metrics: self.0.clone(),
        };
        async move { Ok(metrics) }.boxed()
    }
}

/// A node metrics client whose node is never reachable.
pub struct FailingMetricsClient;

impl NodeMetricsClient for FailingMetricsClient {
    fn get_metrics<'a>(&'a self, node: &'a NodeInfo) -> BoxFuture<'a, Result<NodeMetrics>> {
        let res: Result<NodeMetrics> = Err(anyhow!("node {} is unreachable", node));
        async move { res }.boxed()
    }
}

/// Build read-write WAL metrics for the given channel.
pub fn rw_metrics(channel: &str, term: u64, mvcc_time_tick: u64, recovery_time_tick: u64) -> WalMetrics {
    WalMetrics::ReadWrite {
        channel: ChannelInfo {
            name: channel.into(),
            term,
            access_mode: AccessMode::ReadWrite,
        },
        mvcc_time_tick,
        recovery_time_tick,
        last_confirmed_message_id: Some(mvcc_time_tick),
    }
}

/// Build read-only WAL metrics for the given channel.
pub fn ro_metrics(channel: &str, term: u64) -> WalMetrics {
    WalMetrics::ReadOnly {
        channel: ChannelInfo {
            name: channel.into(),
            term,
            access_mode: AccessMode::ReadOnly,
        },
    }
}

/// Open a channel manager over a fresh database, registering the given channels.
pub async fn setup_channel_manager(config: Arc<Config>, channels: &[&str]) -> Result<(ChannelManager, ChannelStore, Arc<StatsManager>)> {
    let db = Database::new(config.clone()).await?;
    let store = ChannelStore::new(&db).await?;
    let stats = Arc::new(StatsManager::new(None));
    let manager = ChannelManager::recover(config, store.clone(), stats.clone()).await?;
    for name in channels {
        manager.register_channel(name, AccessMode::ReadWrite).await?;
    }
    Ok((manager, store, stats))
}
