//! Write-ahead log collaborators.
//!
//! Streaming nodes write each channel through a WAL opened at the term of their assignment.
//! The `Wal` trait is the contract those WALs fulfill, `FencedWal` rejects operations from
//! owners whose term has been superseded, and `SledWal` is a WAL over the placement database.

mod fence;
mod sled_wal;
#[cfg(test)]
mod sled_wal_test;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::models::ChannelInfo;

pub use fence::{FencedWal, TermFence};
pub use sled_wal::SledWal;

/// The ID of a message within a WAL.
///
/// IDs are assigned in append order, starting at 1.
pub type MessageId = u64;

/// A message read back from a WAL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// The position from which a WAL read starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOption {
    /// Read from the earliest retained message.
    All,
    /// Read starting with the given message.
    StartFrom(MessageId),
    /// Read starting with the first message following the given one.
    StartAfter(MessageId),
}

/// A write-ahead log of a single channel, opened at a specific term.
pub trait Wal: Send + Sync {
    /// The name of the WAL implementation.
    fn wal_name(&self) -> &str;

    /// The channel this WAL was opened for, at the term of its assignment.
    fn channel(&self) -> &ChannelInfo;

    /// Append a message, returning its ID once durable.
    fn append(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<MessageId>>;

    /// Open a stream over the messages at and after the given position.
    fn read(&self, opt: ReadOption) -> BoxFuture<'_, Result<BoxStream<'static, Result<Message>>>>;

    /// Discard every message up to and including the given ID.
    fn truncate(&self, id: MessageId) -> BoxFuture<'_, Result<()>>;

    /// Close the WAL. Every later operation fails.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}
