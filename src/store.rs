//! Persistence of channel snapshots.
//!
//! Every write is conditioned on the currently stored snapshot, which makes the store the
//! serialization point for concurrent transitions of the same channel.

use anyhow::{Context, Result};
use sled::IVec;

use crate::database::{Database, Tree};
use crate::error::{ShutdownResult, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::models::proto::ChannelMetaProto;
use crate::models::ChannelMeta;
use crate::utils;

/// The key prefix used for storing channel snapshots, followed by the channel name.
pub const PREFIX_CHANNEL_META: &[u8; 1] = b"m";

const ERR_CAS: &str = "error performing conditional write of channel meta";

/// The outcome of a conditional write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    /// The new snapshot has been persisted.
    Swapped,
    /// The stored snapshot did not match the expected snapshot, and nothing was written.
    Conflict {
        /// The snapshot which is currently stored, if any.
        current: Option<ChannelMeta>,
    },
}

/// The store of channel snapshots.
#[derive(Clone)]
pub struct ChannelStore {
    tree: Tree,
}

impl ChannelStore {
    /// Create a new instance over the given database's channel tree.
    pub async fn new(db: &Database) -> ShutdownResult<Self> {
        let tree = db.get_channel_tree().await?;
        Ok(Self { tree })
    }

    /// Fetch the latest snapshot of the given channel.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn get(&self, name: &str) -> Result<Option<ChannelMeta>> {
        let (tree, key) = (self.tree.clone(), channel_key(name));
        Database::spawn_blocking(move || -> Result<Option<ChannelMeta>> {
            let val = tree.get(&key).context("error reading channel meta")?;
            val.map(|val| decode_meta(&val)).transpose()
        })
        .await?
    }

    /// Fetch the latest snapshot of every channel, ordered by name.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn list(&self) -> Result<Vec<ChannelMeta>> {
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<Vec<ChannelMeta>> {
            tree.scan_prefix(PREFIX_CHANNEL_META)
                .map(|kv_res| {
                    let (_, val) = kv_res.context(ERR_ITER_FAILURE)?;
                    decode_meta(&val)
                })
                .collect()
        })
        .await?
    }

    /// Persist the given snapshot only if its channel is not yet stored.
    #[tracing::instrument(level = "trace", skip(self, meta), fields(channel = meta.name()))]
    pub async fn create(&self, meta: &ChannelMeta) -> Result<CasOutcome> {
        let new = utils::encode_model(&meta.to_proto())?;
        self.cas(channel_key(meta.name()), None, new).await
    }

    /// Replace the `expected` snapshot with `new`, only if `expected` is what is currently stored.
    #[tracing::instrument(level = "trace", skip(self, expected, new), fields(channel = new.name(), term = new.term()))]
    pub async fn compare_and_swap(&self, expected: &ChannelMeta, new: &ChannelMeta) -> Result<CasOutcome> {
        let old = utils::encode_model(&expected.to_proto())?;
        let new_bytes = utils::encode_model(&new.to_proto())?;
        self.cas(channel_key(new.name()), Some(old), new_bytes).await
    }

    async fn cas(&self, key: IVec, old: Option<Vec<u8>>, new: Vec<u8>) -> Result<CasOutcome> {
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<CasOutcome> {
            let res = tree.compare_and_swap(&key, old.as_deref(), Some(new)).context(ERR_CAS)?;
            match res {
                Ok(()) => {
                    tree.flush().context(ERR_DB_FLUSH)?;
                    Ok(CasOutcome::Swapped)
                }
                Err(err) => {
                    let current = err.current.map(|val| decode_meta(&val)).transpose()?;
                    Ok(CasOutcome::Conflict { current })
                }
            }
        })
        .await?
    }
}

fn channel_key(name: &str) -> IVec {
    utils::encode_byte_prefix_str(PREFIX_CHANNEL_META, name)
}

fn decode_meta(val: &[u8]) -> Result<ChannelMeta> {
    let raw: ChannelMetaProto = utils::decode_model(val)?;
    ChannelMeta::from_proto(raw).context("error decoding channel meta from storage")
}
