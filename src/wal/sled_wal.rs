use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;

use crate::database::{Database, Tree};
use crate::error::{AppError, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::models::ChannelInfo;
use crate::utils;
use crate::wal::{Message, MessageId, ReadOption, Wal};

/// The name of this WAL implementation.
pub const WAL_NAME_SLED: &str = "sled";

/// The key prefix used for storing WAL messages.
///
/// NOTE: this prefix is followed by the big-endian encoded message ID, so that range scans
/// iterate messages in append order.
const PREFIX_WAL_MESSAGE: &[u8; 1] = b"e";
/// The key used to store the ID of the last message written to the WAL.
const KEY_WAL_LAST_WRITTEN_ID: &[u8; 1] = b"l";

/// A WAL stored in its own tree of the placement database.
pub struct SledWal {
    channel: ChannelInfo,
    tree: Tree,
    /// The ID to assign to the next appended message.
    next_id: Mutex<MessageId>,
    closed: AtomicBool,
}

impl SledWal {
    /// Open the WAL of the given channel, recovering the ID of the last written message.
    #[tracing::instrument(level = "debug", skip(db, channel), fields(channel = %channel.name, term = channel.term))]
    pub async fn open(db: &Database, channel: ChannelInfo) -> Result<Self> {
        let tree = db.get_wal_tree(&channel.name).await?;
        let last_written_id = recover_last_written_id(tree.clone()).await?;
        tracing::debug!(last_written_id, "wal opened");
        Ok(Self {
            channel,
            tree,
            next_id: Mutex::new(last_written_id + 1),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!(AppError::InvalidInput(format!("wal of channel {} is closed", self.channel.name)));
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, payload), fields(channel = %self.channel.name))]
    async fn append_message(&self, payload: Vec<u8>) -> Result<MessageId> {
        self.ensure_open()?;
        let mut next_id = self.next_id.lock().await;
        let (tree, id) = (self.tree.clone(), *next_id);
        Database::spawn_blocking(move || -> Result<()> {
            let mut batch = sled::Batch::default();
            batch.insert(&utils::encode_byte_prefix(PREFIX_WAL_MESSAGE, id), payload);
            batch.insert(KEY_WAL_LAST_WRITTEN_ID, &utils::encode_u64(id));
            tree.apply_batch(batch).context("error applying wal write batch")?;
            tree.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await??;
        *next_id += 1;
        Ok(id)
    }

    #[tracing::instrument(level = "trace", skip(self), fields(channel = %self.channel.name))]
    async fn read_messages(&self, opt: ReadOption) -> Result<BoxStream<'static, Result<Message>>> {
        self.ensure_open()?;
        let start_id = match opt {
            ReadOption::All => 0,
            ReadOption::StartFrom(id) => id,
            ReadOption::StartAfter(id) => id.saturating_add(1),
        };
        let tree = self.tree.clone();
        let messages = Database::spawn_blocking(move || -> Result<Vec<Message>> {
            let start = utils::encode_byte_prefix(PREFIX_WAL_MESSAGE, start_id);
            let stop = utils::encode_byte_prefix(PREFIX_WAL_MESSAGE, u64::MAX);
            tree.range(start..=stop)
                .map(|kv_res| -> Result<Message> {
                    let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
                    let id = utils::decode_u64(&key[1..]).context("error decoding wal message key, data corrupted")?;
                    Ok(Message { id, payload: val.to_vec() })
                })
                .collect()
        })
        .await??;
        Ok(stream::iter(messages.into_iter().map(Ok)).boxed())
    }

    #[tracing::instrument(level = "trace", skip(self), fields(channel = %self.channel.name))]
    async fn truncate_messages(&self, id: MessageId) -> Result<()> {
        self.ensure_open()?;
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<()> {
            let mut batch = sled::Batch::default();
            let start: &[u8] = PREFIX_WAL_MESSAGE;
            let stop = utils::encode_byte_prefix(PREFIX_WAL_MESSAGE, id);
            for key_res in tree.range(start..=&stop[..]).keys() {
                let key = key_res.context(ERR_ITER_FAILURE)?;
                batch.remove(key);
            }
            tree.apply_batch(batch).context("error applying wal truncation batch")?;
            tree.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await??;
        tracing::debug!(id, "wal truncated");
        Ok(())
    }

    async fn close_wal(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.tree.flush_async().await.context(ERR_DB_FLUSH)?;
        tracing::debug!(channel = %self.channel.name, term = self.channel.term, "wal closed");
        Ok(())
    }
}

impl Wal for SledWal {
    fn wal_name(&self) -> &str {
        WAL_NAME_SLED
    }

    fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    fn append(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<MessageId>> {
        self.append_message(payload).boxed()
    }

    fn read(&self, opt: ReadOption) -> BoxFuture<'_, Result<BoxStream<'static, Result<Message>>>> {
        self.read_messages(opt).boxed()
    }

    fn truncate(&self, id: MessageId) -> BoxFuture<'_, Result<()>> {
        self.truncate_messages(id).boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.close_wal().boxed()
    }
}

/// Recover the ID of the last message written to the given WAL tree, 0 if none.
async fn recover_last_written_id(tree: Tree) -> Result<MessageId> {
    Database::spawn_blocking(move || -> Result<MessageId> {
        let id = tree
            .get(KEY_WAL_LAST_WRITTEN_ID)
            .context("error fetching last written id during wal recovery")?
            .map(|val| utils::decode_u64(&val).context("error decoding last written id from storage"))
            .transpose()?
            .unwrap_or(0);
        Ok(id)
    })
    .await?
}
