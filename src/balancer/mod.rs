//! Channel manager.
//!
//! The manager records placement decisions made by a balancing policy. It never decides where
//! a channel should go; it only guarantees that each decision is applied through the
//! assignment protocol and persisted without lost updates.
//!
//! Every operation follows the same flow: take the latest known snapshot, open a mutation
//! builder over it, apply one transition, and conditionally write the result to the store. A
//! write which loses a race against another writer is never retried blindly: the snapshot
//! which won is adopted and the whole transition is re-applied on top of it.


use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use rand::prelude::*;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::error::AppError;
use crate::models::{AccessMode, ChannelMeta, ChannelMetaMut, NodeInfo, UnavailableOutcome};
use crate::stats::StatsManager;
use crate::store::{CasOutcome, ChannelStore};
use crate::wal::TermFence;

/// A map of the latest known snapshot of every channel.
type ChannelsMap = Arc<ArcSwap<HashMap<Arc<String>, ChannelMeta>>>;

const METRIC_ASSIGNMENTS: &str = "hadron_placement_assignments";
const METRIC_REJECTIONS: &str = "hadron_placement_protocol_rejections";
const METRIC_CONFLICTS: &str = "hadron_placement_store_conflicts";
const METRIC_CHANNEL_TERM: &str = "hadron_placement_channel_term";

/// The upper bound in milliseconds of the randomized pause taken after a lost race.
const CONFLICT_BACKOFF_MAX_MS: u64 = 20;
/// The capacity of the channel update broadcast.
const UPDATES_CAPACITY: usize = 1000;

/// The outcome of an assignment request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssignOutcome {
    /// The channel has been handed to the requested node at the snapshot's term.
    Assigned(ChannelMeta),
    /// The channel has a confirmed owner and must be marked unavailable first.
    Rejected(ChannelMeta),
}

/// The outcome of an assignment confirmation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The assignment is now confirmed.
    Confirmed(ChannelMeta),
    /// The confirmation does not apply to the current term or state.
    Rejected(ChannelMeta),
}

/// The manager of channel assignments.
pub struct ChannelManager {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The store of channel snapshots.
    store: ChannelStore,
    /// The channel stats registry.
    stats: Arc<StatsManager>,
    /// The latest known snapshot of every channel.
    channels: ChannelsMap,
    /// A channel of every newly persisted snapshot.
    updates: broadcast::Sender<ChannelMeta>,
    /// The fence of channel terms, advanced before any new snapshot is returned.
    fence: TermFence,
}

impl ChannelManager {
    /// Create a new instance, loading all persisted channels and recovering the stats registry
    /// from them.
    pub async fn recover(config: Arc<Config>, store: ChannelStore, stats: Arc<StatsManager>) -> Result<Self> {
        metrics::register_counter!(METRIC_ASSIGNMENTS, metrics::Unit::Count, "channel assignments persisted");
        metrics::register_counter!(METRIC_REJECTIONS, metrics::Unit::Count, "channel transitions rejected by the assignment protocol");
        metrics::register_counter!(METRIC_CONFLICTS, metrics::Unit::Count, "conditional channel writes lost to a concurrent writer");
        metrics::register_gauge!(METRIC_CHANNEL_TERM, metrics::Unit::Count, "the current term of each channel");

        let (updates, _) = broadcast::channel(UPDATES_CAPACITY);
        let manager = Self {
            config,
            store,
            stats,
            channels: Arc::new(ArcSwap::default()),
            updates,
            fence: TermFence::new(),
        };
        let count = manager.reload().await?;
        tracing::info!(channels = count, "channel manager recovered");
        Ok(manager)
    }

    /// Replace every cached snapshot with what is currently persisted, and recover the stats
    /// registry from the persisted channel list. Returns the number of known channels.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reload(&self) -> Result<usize> {
        let metas = self.store.list().await?;
        for meta in metas.iter() {
            metrics::gauge!(METRIC_CHANNEL_TERM, meta.term() as f64, "channel" => meta.name().to_string());
            self.fence.observe_meta(meta);
        }
        let channels: HashMap<Arc<String>, ChannelMeta> = metas.into_iter().map(|meta| (Arc::new(meta.name().to_string()), meta)).collect();
        self.stats.recover(channels.keys().map(|name| name.as_str()));
        let count = channels.len();
        self.channels.store(Arc::new(channels));
        Ok(count)
    }

    /// Subscribe to every snapshot persisted by this manager from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMeta> {
        self.updates.subscribe()
    }

    /// The fence of channel terms.
    ///
    /// The fence knows the term of a snapshot before any operation of this manager returns it.
    pub fn fence(&self) -> TermFence {
        self.fence.clone()
    }

    /// Get the latest known snapshot of the given channel.
    pub fn get(&self, name: &str) -> Option<ChannelMeta> {
        self.channels.load().get(&name.to_string()).cloned()
    }

    /// Get the latest known snapshot of every channel, ordered by name.
    pub fn list(&self) -> Vec<ChannelMeta> {
        let mut metas: Vec<ChannelMeta> = self.channels.load().values().cloned().collect();
        metas.sort_by(|a, b| a.name().cmp(b.name()));
        metas
    }

    /// Get the current term of the given channel.
    pub fn current_term(&self, name: &str) -> Option<u64> {
        self.get(name).map(|meta| meta.term())
    }

    /// Register a new channel, returning its snapshot.
    ///
    /// Registering an already known channel returns its current snapshot unchanged.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn register_channel(&self, name: &str, access_mode: AccessMode) -> Result<ChannelMeta> {
        if name.is_empty() {
            return Err(AppError::InvalidInput("channel name must not be empty".into()).into());
        }
        if let Some(meta) = self.get(name) {
            return Ok(meta);
        }
        let meta = ChannelMeta::new(name, access_mode);
        let meta = match self.store.create(&meta).await? {
            CasOutcome::Swapped => {
                tracing::info!(channel = name, "channel registered");
                self.publish(meta.clone());
                meta
            }
            CasOutcome::Conflict { current: Some(current) } => {
                self.cache(current.clone());
                current
            }
            CasOutcome::Conflict { current: None } => {
                // Creation only conflicts with an existing record.
                return Err(AppError::Conflict {
                    channel: name.into(),
                    attempts: 1,
                }
                .into());
            }
        };
        self.stats.track(name);
        Ok(meta)
    }

    /// Hand the given channel to the given node.
    ///
    /// On success, the returned snapshot's term is the fencing token the node must present on
    /// every operation against the channel.
    #[tracing::instrument(level = "debug", skip(self, node), fields(node = %node))]
    pub async fn assign_channel(&self, name: &str, access_mode: AccessMode, node: NodeInfo) -> Result<AssignOutcome> {
        let (assigned, meta) = self
            .mutate(name, |builder| builder.try_assign_to_node(access_mode, node.clone()))
            .await?;
        if assigned {
            metrics::increment_counter!(METRIC_ASSIGNMENTS);
            tracing::info!(channel = name, term = meta.term(), "channel assigned");
            Ok(AssignOutcome::Assigned(meta))
        } else {
            metrics::increment_counter!(METRIC_REJECTIONS);
            Ok(AssignOutcome::Rejected(meta))
        }
    }

    /// Confirm the assignment of the given channel at the given term.
    ///
    /// A confirmation for any term other than the current one comes from a superseded
    /// assignment and is rejected.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn assign_done(&self, name: &str, term: u64) -> Result<ConfirmOutcome> {
        let (confirmed, meta) = self
            .mutate(name, |builder| {
                if builder.term() != term {
                    tracing::debug!(channel = builder.name(), term, current = builder.term(), "ignoring confirmation of a superseded assignment");
                    return false;
                }
                builder.assign_done()
            })
            .await?;
        if confirmed {
            tracing::info!(channel = name, term, "channel assignment confirmed");
            Ok(ConfirmOutcome::Confirmed(meta))
        } else {
            metrics::increment_counter!(METRIC_REJECTIONS);
            Ok(ConfirmOutcome::Rejected(meta))
        }
    }

    /// Revoke the owner of the given channel at the given term.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn mark_unavailable(&self, name: &str, term: u64) -> Result<(UnavailableOutcome, ChannelMeta)> {
        let (outcome, meta) = self.mutate(name, |builder| builder.mark_as_unavailable(term)).await?;
        match outcome {
            UnavailableOutcome::Marked => {
                let node = meta.last_owner().map(|node| node.to_string()).unwrap_or_default();
                tracing::info!(channel = name, term, %node, "channel marked unavailable");
            }
            UnavailableOutcome::FutureTerm | UnavailableOutcome::StaleTerm | UnavailableOutcome::AlreadyUnavailable | UnavailableOutcome::NotAssigned => {
                metrics::increment_counter!(METRIC_REJECTIONS);
            }
        }
        Ok((outcome, meta))
    }

    /// Apply the given transition to the latest snapshot of a channel and persist the result.
    ///
    /// The transition may be applied more than once, each time to a fresher snapshot, so it
    /// must only depend on the builder it is given. Transitions which change nothing are not
    /// written.
    async fn mutate<F, T>(&self, name: &str, mut transition: F) -> Result<(T, ChannelMeta)>
    where
        F: FnMut(&mut ChannelMetaMut) -> T,
    {
        let mut current = match self.get(name) {
            Some(meta) => meta,
            None => self.load(name).await?,
        };
        let max_attempts = self.config.max_conflict_retries.saturating_add(1);
        for attempt in 1..=max_attempts {
            let mut builder = current.copy_for_write();
            let output = transition(&mut builder);
            if !builder.is_changed() {
                return Ok((output, current));
            }
            let next = builder.into_meta();
            match self.store.compare_and_swap(&current, &next).await? {
                CasOutcome::Swapped => {
                    self.publish(next.clone());
                    return Ok((output, next));
                }
                CasOutcome::Conflict { current: Some(latest) } => {
                    metrics::increment_counter!(METRIC_CONFLICTS);
                    tracing::debug!(channel = name, attempt, term = latest.term(), "lost race on channel update, retrying on latest snapshot");
                    self.cache(latest.clone());
                    current = latest;
                    if attempt < max_attempts {
                        let backoff = rand::thread_rng().gen_range(0..=CONFLICT_BACKOFF_MAX_MS);
                        tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                    }
                }
                CasOutcome::Conflict { current: None } => {
                    self.evict(name);
                    return Err(AppError::ChannelNotFound(name.into()).into());
                }
            }
        }
        tracing::error!(channel = name, attempts = max_attempts, "giving up on channel update after repeated conflicts");
        Err(AppError::Conflict {
            channel: name.into(),
            attempts: max_attempts,
        }
        .into())
    }

    /// Load the given channel from the store into the cache.
    async fn load(&self, name: &str) -> Result<ChannelMeta> {
        let meta = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| AppError::ChannelNotFound(name.into()))?;
        self.cache(meta.clone());
        Ok(meta)
    }

    /// Cache and broadcast a newly persisted snapshot.
    fn publish(&self, meta: ChannelMeta) {
        self.cache(meta.clone());
        let _res = self.updates.send(meta);
    }

    /// Cache the given snapshot, unless a snapshot with a higher term is already cached.
    fn cache(&self, meta: ChannelMeta) {
        self.fence.observe_meta(&meta);
        metrics::gauge!(METRIC_CHANNEL_TERM, meta.term() as f64, "channel" => meta.name().to_string());
        self.channels.rcu(|channels| {
            let mut channels = HashMap::clone(channels);
            let key = Arc::new(meta.name().to_string());
            match channels.get(&key) {
                Some(cached) if cached.term() > meta.term() => (),
                _ => {
                    channels.insert(key, meta.clone());
                }
            }
            channels
        });
    }

    fn evict(&self, name: &str) {
        self.channels.rcu(|channels| {
            let mut channels = HashMap::clone(channels);
            channels.remove(&name.to_string());
            channels
        });
    }
}
