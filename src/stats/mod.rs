//! Channel stats registry.
//!
//! The registry tracks live progress metrics of every known channel. It is constructed when the
//! coordinator starts, and is explicitly `reset` and `recover`ed whenever the coordinator
//! (re)gains leadership, as stats gathered before a failover can not be trusted to reflect
//! the cluster afterwards.
//!
//! Reads never block. All writes go through `ArcSwap::rcu`, so concurrent writers are
//! serialized against the same base registry.


use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{ChannelInfo, NodeInfo};

const METRIC_KNOWN_CHANNELS: &str = "hadron_placement_stats_known_channels";
const METRIC_MVCC_TIME_TICK: &str = "hadron_placement_channel_mvcc_time_tick";
const METRIC_RECOVERY_TIME_TICK: &str = "hadron_placement_channel_recovery_time_tick";

/// Progress metrics of a single channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// The name of the channel.
    pub channel: String,
    /// The server ID of the node which last reported on this channel.
    pub node_id: Option<i64>,
    /// The latest time tick visible to readers of the channel.
    pub mvcc_time_tick: u64,
    /// The time tick from which the channel would recover after a restart.
    pub recovery_time_tick: u64,
    /// The ID of the last message confirmed by the channel's WAL.
    pub last_confirmed_message_id: Option<u64>,
    /// The unix timestamp of the last observation, `None` if never observed.
    pub updated_at: Option<i64>,
}

impl ChannelStats {
    fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            ..Default::default()
        }
    }

    fn apply(&mut self, update: &StatsUpdate) {
        if update.node_id.is_some() {
            self.node_id = update.node_id;
        }
        self.mvcc_time_tick = self.mvcc_time_tick.max(update.mvcc_time_tick);
        self.recovery_time_tick = self.recovery_time_tick.max(update.recovery_time_tick);
        if let Some(id) = update.last_confirmed_message_id {
            self.last_confirmed_message_id = Some(self.last_confirmed_message_id.map_or(id, |prev| prev.max(id)));
        }
        self.updated_at = Some(update.observed_at);
    }
}

/// A single observation of a channel's progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsUpdate {
    pub node_id: Option<i64>,
    pub mvcc_time_tick: u64,
    pub recovery_time_tick: u64,
    pub last_confirmed_message_id: Option<u64>,
    /// The unix timestamp of the observation.
    pub observed_at: i64,
}

impl StatsUpdate {
    /// Create a new observation timestamped now.
    pub fn new(mvcc_time_tick: u64, recovery_time_tick: u64) -> Self {
        Self {
            node_id: None,
            mvcc_time_tick,
            recovery_time_tick,
            last_confirmed_message_id: None,
            observed_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

/// WAL metrics reported by a streaming node for one of its channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalMetrics {
    /// Metrics of a WAL opened for writing.
    ReadWrite {
        channel: ChannelInfo,
        mvcc_time_tick: u64,
        recovery_time_tick: u64,
        last_confirmed_message_id: Option<u64>,
    },
    /// Metrics of a WAL opened read-only. These carry no progress information.
    ReadOnly { channel: ChannelInfo },
}

/// All WAL metrics reported by a streaming node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeMetrics {
    pub node: NodeInfo,
    pub wal_metrics: Vec<WalMetrics>,
}

/// A client used to query live metrics from streaming nodes.
pub trait NodeMetricsClient: Send + Sync {
    /// Fetch the current WAL metrics of the given node.
    fn get_metrics<'a>(&'a self, node: &'a NodeInfo) -> BoxFuture<'a, Result<NodeMetrics>>;
}

/// The registry state swapped wholesale on every write.
#[derive(Clone, Default)]
struct StatsRegistry {
    channels: HashMap<Arc<String>, ChannelStats>,
    client: Option<Arc<dyn NodeMetricsClient>>,
}

/// The channel stats registry.
pub struct StatsManager {
    inner: ArcSwap<StatsRegistry>,
}

impl StatsManager {
    /// Create a new empty registry.
    pub fn new(client: Option<Arc<dyn NodeMetricsClient>>) -> Self {
        metrics::register_gauge!(METRIC_KNOWN_CHANNELS, metrics::Unit::Count, "the number of channels known to the stats registry");
        metrics::register_gauge!(METRIC_MVCC_TIME_TICK, metrics::Unit::Count, "the latest mvcc time tick observed per channel");
        metrics::register_gauge!(METRIC_RECOVERY_TIME_TICK, metrics::Unit::Count, "the latest recovery time tick observed per channel");
        Self {
            inner: ArcSwap::from_pointee(StatsRegistry { channels: HashMap::new(), client }),
        }
    }

    /// Replace the registry with an empty one holding the given node metrics client.
    #[tracing::instrument(level = "debug", skip(self, client))]
    pub fn reset(&self, client: Option<Arc<dyn NodeMetricsClient>>) {
        self.inner.store(Arc::new(StatsRegistry { channels: HashMap::new(), client }));
        metrics::gauge!(METRIC_KNOWN_CHANNELS, 0.0);
        tracing::debug!("channel stats registry reset");
    }

    /// Rebuild the set of known channels from the given authoritative list.
    ///
    /// Every listed channel starts over with an empty record, and every other channel is
    /// forgotten. The node metrics client is kept.
    #[tracing::instrument(level = "debug", skip(self, names))]
    pub fn recover<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channels: HashMap<Arc<String>, ChannelStats> = names
            .into_iter()
            .map(|name| (Arc::new(name.as_ref().to_string()), ChannelStats::new(name.as_ref())))
            .collect();
        let count = channels.len();
        self.inner.rcu(|registry| StatsRegistry {
            channels: channels.clone(),
            client: registry.client.clone(),
        });
        metrics::gauge!(METRIC_KNOWN_CHANNELS, count as f64);
        tracing::debug!(count, "channel stats registry recovered");
    }

    /// Start tracking the given channel with an empty record, if it is not already known.
    pub fn track(&self, channel: &str) {
        if self.inner.load().channels.contains_key(&channel.to_string()) {
            return;
        }
        self.inner.rcu(|registry| {
            let mut registry = StatsRegistry::clone(registry);
            registry.channels.entry(Arc::new(channel.to_string())).or_insert_with(|| ChannelStats::new(channel));
            registry
        });
        metrics::gauge!(METRIC_KNOWN_CHANNELS, self.inner.load().channels.len() as f64);
    }

    /// Record an observation of the given channel, creating its record if needed.
    pub fn observe(&self, channel: &str, update: StatsUpdate) {
        self.inner.rcu(|registry| {
            let mut registry = StatsRegistry::clone(registry);
            registry
                .channels
                .entry(Arc::new(channel.to_string()))
                .or_insert_with(|| ChannelStats::new(channel))
                .apply(&update);
            registry
        });
        if let Some(stats) = self.get(channel) {
            metrics::gauge!(METRIC_MVCC_TIME_TICK, stats.mvcc_time_tick as f64, "channel" => channel.to_string());
            metrics::gauge!(METRIC_RECOVERY_TIME_TICK, stats.recovery_time_tick as f64, "channel" => channel.to_string());
        }
    }

    /// Get the stats of the given channel, `None` if the channel is unknown.
    pub fn get(&self, channel: &str) -> Option<ChannelStats> {
        self.inner.load().channels.get(&channel.to_string()).cloned()
    }

    /// Get the stats of every known channel, ordered by channel name.
    pub fn list(&self) -> Vec<ChannelStats> {
        let registry = self.inner.load();
        let sorted: BTreeMap<&str, &ChannelStats> = registry.channels.iter().map(|(name, stats)| (name.as_str(), stats)).collect();
        sorted.into_values().cloned().collect()
    }

    /// Render the stats of every known channel as a JSON array.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.list()).context("error serializing channel stats")
    }

    /// Pull the WAL metrics of the given node and record them, returning the number of
    /// channels updated.
    ///
    /// Read-only WALs carry no progress and are skipped. If the node can not be queried,
    /// nothing is recorded.
    #[tracing::instrument(level = "debug", skip(self, node), fields(node = %node))]
    pub async fn sync_node_metrics(&self, node: &NodeInfo) -> Result<usize> {
        let client = self
            .inner
            .load()
            .client
            .clone()
            .ok_or_else(|| AppError::InvalidInput("no node metrics client configured".into()))?;
        let node_metrics = match client.get_metrics(node).await {
            Ok(node_metrics) => node_metrics,
            Err(err) => {
                tracing::error!(error = ?err, "error fetching node metrics");
                return Err(AppError::Unavailable(err).into());
            }
        };

        let observed_at = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut updated = 0;
        for wal_metrics in node_metrics.wal_metrics {
            if let WalMetrics::ReadWrite {
                channel,
                mvcc_time_tick,
                recovery_time_tick,
                last_confirmed_message_id,
            } = wal_metrics
            {
                let update = StatsUpdate {
                    node_id: Some(node_metrics.node.server_id),
                    mvcc_time_tick,
                    recovery_time_tick,
                    last_confirmed_message_id,
                    observed_at,
                };
                self.observe(&channel.name, update);
                updated += 1;
            }
        }
        Ok(updated)
    }
}
