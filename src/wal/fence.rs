use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::AppError;
use crate::models::{ChannelInfo, ChannelMeta};
use crate::wal::{Message, MessageId, ReadOption, Wal};

/// The latest observed term of every channel.
///
/// Terms only move forward. Any operation presented with a term older than the latest
/// observed one comes from a superseded owner and is rejected.
#[derive(Clone, Default)]
pub struct TermFence {
    terms: Arc<ArcSwap<HashMap<Arc<String>, u64>>>,
}

impl TermFence {
    /// Create a new instance with no observed terms.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the latest observed term of the given channel.
    pub fn latest(&self, channel: &str) -> Option<u64> {
        self.terms.load().get(&channel.to_string()).copied()
    }

    /// Record the given term of a channel, keeping whichever term is newer.
    pub fn observe(&self, channel: &str, term: u64) {
        if self.latest(channel).map(|latest| latest >= term).unwrap_or(false) {
            return;
        }
        self.terms.rcu(|terms| {
            let mut terms = HashMap::clone(terms);
            let latest = terms.entry(Arc::new(channel.to_string())).or_insert(term);
            *latest = (*latest).max(term);
            terms
        });
    }

    /// Record the term of the given snapshot.
    pub fn observe_meta(&self, meta: &ChannelMeta) {
        self.observe(meta.name(), meta.term());
    }

    /// Check that the given channel term is not stale.
    ///
    /// Checking never records a term. Only snapshots issued by the channel manager move the
    /// fence forward.
    pub fn check(&self, channel: &ChannelInfo) -> std::result::Result<(), AppError> {
        if let Some(latest) = self.latest(&channel.name) {
            if channel.term < latest {
                tracing::debug!(channel = %channel.name, term = channel.term, latest, "rejecting operation with stale term");
                return Err(AppError::StaleTerm {
                    channel: channel.name.clone(),
                    term: channel.term,
                    latest,
                });
            }
        }
        Ok(())
    }

    /// Spawn a task which observes the term of every snapshot on the given update stream.
    pub fn follow(&self, mut updates: broadcast::Receiver<ChannelMeta>) -> JoinHandle<()> {
        let fence = self.clone();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(meta) => fence.observe_meta(&meta),
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        tracing::warn!(count, "term fence lagged behind channel updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("term fence follower has shutdown");
        })
    }
}

/// A WAL which rejects every operation once its term has been superseded.
///
/// Closing is never fenced, so a superseded owner can always release its WAL.
pub struct FencedWal<W> {
    inner: W,
    fence: TermFence,
}

impl<W: Wal> FencedWal<W> {
    /// Wrap the given WAL, fencing it with the given fence.
    pub fn new(inner: W, fence: TermFence) -> Self {
        Self { inner, fence }
    }

    /// Unwrap the underlying WAL.
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn check(&self) -> Result<()> {
        self.fence.check(self.inner.channel()).map_err(anyhow::Error::from)
    }
}

impl<W: Wal> Wal for FencedWal<W> {
    fn wal_name(&self) -> &str {
        self.inner.wal_name()
    }

    fn channel(&self) -> &ChannelInfo {
        self.inner.channel()
    }

    fn append(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<MessageId>> {
        if let Err(err) = self.check() {
            return rejected(err);
        }
        self.inner.append(payload)
    }

    fn read(&self, opt: ReadOption) -> BoxFuture<'_, Result<BoxStream<'static, Result<Message>>>> {
        if let Err(err) = self.check() {
            return rejected(err);
        }
        self.inner.read(opt)
    }

    fn truncate(&self, id: MessageId) -> BoxFuture<'_, Result<()>> {
        if let Err(err) = self.check() {
            return rejected(err);
        }
        self.inner.truncate(id)
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.inner.close()
    }
}

fn rejected<'a, T: Send + 'a>(err: anyhow::Error) -> BoxFuture<'a, Result<T>> {
    future::ready(Err(err)).boxed()
}
