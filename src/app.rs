use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::balancer::ChannelManager;
use crate::config::Config;
use crate::database::Database;
use crate::error::AppError;
use crate::models::{AccessMode, ChannelInfo, ChannelState};
use crate::server::spawn_prom_server;
use crate::stats::{NodeMetricsClient, StatsManager};
use crate::store::ChannelStore;
use crate::wal::{FencedWal, SledWal, TermFence};

/// The placement coordinator's core components.
pub struct Coordinator {
    /// The coordinator's database system.
    db: Database,
    /// The manager of channel assignments.
    manager: ChannelManager,
    /// The channel stats registry.
    stats: Arc<StatsManager>,
}

impl Coordinator {
    /// Open the coordinator's storage, recover its state and register the configured channels.
    pub async fn open(config: Arc<Config>, client: Option<Arc<dyn NodeMetricsClient>>) -> Result<Self> {
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let store = ChannelStore::new(&db).await.context("error opening channel store")?;
        let stats = Arc::new(StatsManager::new(client));
        let manager = ChannelManager::recover(config.clone(), store, stats.clone())
            .await
            .context("error recovering channel manager")?;

        for name in config.channels.iter() {
            manager
                .register_channel(name, AccessMode::ReadWrite)
                .await
                .with_context(|| format!("error registering configured channel {}", name))?;
        }

        Ok(Self { db, manager, stats })
    }

    /// The manager of channel assignments.
    pub fn manager(&self) -> &ChannelManager {
        &self.manager
    }

    /// The channel stats registry.
    pub fn stats(&self) -> Arc<StatsManager> {
        self.stats.clone()
    }

    /// The fence of channel terms, advanced by every snapshot of the channel manager.
    pub fn fence(&self) -> TermFence {
        self.manager.fence()
    }

    /// Take over after another coordinator, discarding stats which can no longer be trusted.
    ///
    /// Every cached snapshot is replaced with what is persisted and the stats registry is
    /// recovered from the persisted channel list.
    #[tracing::instrument(level = "debug", skip(self, client))]
    pub async fn failover(&self, client: Option<Arc<dyn NodeMetricsClient>>) -> Result<()> {
        self.stats.reset(client);
        let count = self.manager.reload().await.context("error reloading channels during failover")?;
        tracing::info!(channels = count, "coordinator failover complete");
        Ok(())
    }

    /// Open the WAL of a channel at the term of its assignment.
    ///
    /// The given channel must match the current term and access mode of an owned channel. The
    /// returned WAL rejects every operation once a newer term of the channel is issued.
    #[tracing::instrument(level = "debug", skip(self, channel), fields(channel = %channel.name, term = channel.term))]
    pub async fn open_wal(&self, channel: ChannelInfo) -> Result<FencedWal<SledWal>> {
        let meta = self
            .manager
            .get(&channel.name)
            .ok_or_else(|| AppError::ChannelNotFound(channel.name.clone()))?;
        if channel.term < meta.term() {
            return Err(AppError::StaleTerm {
                channel: channel.name,
                term: channel.term,
                latest: meta.term(),
            }
            .into());
        }
        if channel.term > meta.term() {
            return Err(AppError::InvalidInput(format!(
                "term {} of channel {} has not been issued, current term is {}",
                channel.term,
                channel.name,
                meta.term()
            ))
            .into());
        }
        if !matches!(meta.state(), ChannelState::Assigning | ChannelState::Assigned) {
            return Err(AppError::InvalidInput(format!("channel {} has no owner at term {}", channel.name, channel.term)).into());
        }
        if channel.access_mode != meta.access_mode() {
            return Err(AppError::InvalidInput(format!("channel {} is not assigned as {:?} at term {}", channel.name, channel.access_mode, channel.term)).into());
        }

        let fence = self.manager.fence();
        fence.check(&channel)?;
        let wal = SledWal::open(&self.db, channel).await?;
        Ok(FencedWal::new(wal, fence))
    }

    /// Shutdown the coordinator, releasing its storage.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.manager);
        drop(self.db);
        tracing::debug!("coordinator shutdown complete");
        Ok(())
    }
}

/// The application object for when the coordinator is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The coordinator.
    coordinator: Coordinator,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let coordinator = Coordinator::open(config.clone(), None).await?;
        let metrics_server = spawn_prom_server(&config, coordinator.stats(), shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            coordinator,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("placement coordinator is shutting down");
        if let Err(err) = self.coordinator.shutdown().await {
            tracing::error!(error = ?err, "error shutting down coordinator");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }
        tracing::debug!("placement coordinator shutdown complete");
        Ok(())
    }
}
