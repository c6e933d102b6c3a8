//! Physical channel assignment models.
//!
//! A `ChannelMeta` is an immutable snapshot of a channel's assignment state. The only way to
//! derive a new snapshot is to open a `ChannelMetaMut` via `ChannelMeta::copy_for_write`, apply
//! a transition, and finalize it with `into_meta` or `into_proto`. Any number of readers may
//! hold a snapshot while a transition is being computed elsewhere.
//!
//! ```text
//! Uninitialized --try_assign--> Assigning
//! Assigning     --try_assign--> Assigning   (old owner archived, term+1)
//! Assigning     --assign_done--> Assigned   (history cleared)
//! Assigned      --mark_as_unavailable(term)--> Unavailable
//! Unavailable   --try_assign--> Assigning   (old owner archived, term+1)
//! ```

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::proto::{AccessModeProto, AssignmentLogProto, ChannelInfoProto, ChannelMetaProto, ChannelStateProto, NodeInfoProto};

/// The term of every newly registered channel.
pub const INITIAL_TERM: u64 = 1;

/// The access granted to the holder of a channel assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Exclusive write ownership, subject to term fencing.
    ReadWrite,
    /// Shared read-only access.
    ReadOnly,
}

impl AccessMode {
    fn into_proto(self) -> i32 {
        match self {
            Self::ReadWrite => AccessModeProto::ReadWrite as i32,
            Self::ReadOnly => AccessModeProto::ReadOnly as i32,
        }
    }

    fn from_proto(val: i32) -> Result<Self> {
        match AccessModeProto::from_i32(val) {
            Some(AccessModeProto::ReadWrite) => Ok(Self::ReadWrite),
            Some(AccessModeProto::ReadOnly) => Ok(Self::ReadOnly),
            None => bail!("unknown access mode {}", val),
        }
    }
}

/// The identity of a streaming node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    /// The server ID of the node.
    pub server_id: i64,
    /// The network address of the node, possibly empty.
    pub address: String,
}

impl NodeInfo {
    /// Create a new instance with an empty address.
    pub fn new(server_id: i64) -> Self {
        Self { server_id, address: String::new() }
    }

    /// Set the address of this node.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    fn into_proto(self) -> NodeInfoProto {
        NodeInfoProto {
            server_id: self.server_id,
            address: self.address,
        }
    }

    fn from_proto(raw: NodeInfoProto) -> Self {
        Self {
            server_id: raw.server_id,
            address: raw.address,
        }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.is_empty() {
            write!(f, "{}", self.server_id)
        } else {
            write!(f, "{}@{}", self.server_id, self.address)
        }
    }
}

/// The identity of a physical channel at a specific term.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// The unique name of the channel.
    pub name: String,
    /// The fencing term.
    pub term: u64,
    /// The access mode granted at this term.
    pub access_mode: AccessMode,
}

/// A channel at a specific term along with the node it was assigned to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelAssignment {
    pub channel: ChannelInfo,
    pub node: NodeInfo,
}

/// The assignment state of a physical channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// The channel has never been assigned.
    Uninitialized,
    /// The channel has been handed to a node which has not yet confirmed it.
    Assigning,
    /// The current owner has confirmed the assignment.
    Assigned,
    /// The owner of the current term has been revoked.
    Unavailable,
}

impl ChannelState {
    fn into_proto(self) -> i32 {
        match self {
            Self::Uninitialized => ChannelStateProto::Uninitialized as i32,
            Self::Assigning => ChannelStateProto::Assigning as i32,
            Self::Assigned => ChannelStateProto::Assigned as i32,
            Self::Unavailable => ChannelStateProto::Unavailable as i32,
        }
    }

    fn from_proto(val: i32) -> Result<Self> {
        match ChannelStateProto::from_i32(val) {
            Some(ChannelStateProto::Uninitialized) => Ok(Self::Uninitialized),
            Some(ChannelStateProto::Assigning) => Ok(Self::Assigning),
            Some(ChannelStateProto::Assigned) => Ok(Self::Assigned),
            Some(ChannelStateProto::Unavailable) => Ok(Self::Unavailable),
            None => bail!("unknown channel state {}", val),
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Assigning => f.write_str("assigning"),
            Self::Assigned => f.write_str("assigned"),
            Self::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// The result of reporting a channel's owner as unavailable.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnavailableOutcome {
    /// The owner of the current term was revoked.
    Marked,
    /// The channel was already unavailable at this term.
    AlreadyUnavailable,
    /// The channel has never been assigned, so there is no owner to revoke.
    NotAssigned,
    /// The reported term has been superseded; the live owner is left alone.
    StaleTerm,
    /// The reported term does not exist yet. This is a caller bug and nothing was changed.
    FutureTerm,
}

/// The raw fields of a channel snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ChannelMetaInner {
    channel: ChannelInfo,
    /// The node of the current assignment, retained after the channel becomes unavailable so
    /// that it can be archived upon reassignment.
    node: Option<NodeInfo>,
    state: ChannelState,
    histories: Vec<ChannelAssignment>,
}

/// An immutable snapshot of a physical channel's assignment state.
///
/// Cloning is cheap and equality is structural.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMeta {
    inner: Arc<ChannelMetaInner>,
}

impl ChannelMeta {
    /// Create the initial snapshot of a newly registered channel.
    pub fn new(name: impl Into<String>, access_mode: AccessMode) -> Self {
        Self::from_inner(ChannelMetaInner {
            channel: ChannelInfo {
                name: name.into(),
                term: INITIAL_TERM,
                access_mode,
            },
            node: None,
            state: ChannelState::Uninitialized,
            histories: vec![],
        })
    }

    fn from_inner(inner: ChannelMetaInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    /// Reconstruct a snapshot from its persisted representation.
    pub fn from_proto(raw: ChannelMetaProto) -> Result<Self> {
        let channel = raw.channel.ok_or_else(|| anyhow!("channel meta is missing its channel info"))?;
        if channel.name.is_empty() {
            bail!("channel meta has an empty channel name");
        }
        let access_mode = AccessMode::from_proto(channel.access_mode).context("error decoding channel access mode")?;
        let state = ChannelState::from_proto(raw.state).context("error decoding channel state")?;
        let histories = raw
            .histories
            .into_iter()
            .map(|log| -> Result<ChannelAssignment> {
                let node = log.node.ok_or_else(|| anyhow!("assignment history entry of term {} is missing its node", log.term))?;
                Ok(ChannelAssignment {
                    channel: ChannelInfo {
                        name: channel.name.clone(),
                        term: log.term,
                        access_mode: AccessMode::from_proto(log.access_mode)?,
                    },
                    node: NodeInfo::from_proto(node),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_inner(ChannelMetaInner {
            channel: ChannelInfo {
                name: channel.name,
                term: channel.term,
                access_mode,
            },
            node: raw.node.map(NodeInfo::from_proto),
            state,
            histories,
        }))
    }

    /// Build the persisted representation of this snapshot.
    pub fn to_proto(&self) -> ChannelMetaProto {
        self.inner.to_proto()
    }

    /// The name of this channel.
    pub fn name(&self) -> &str {
        &self.inner.channel.name
    }

    /// The current term of this channel.
    pub fn term(&self) -> u64 {
        self.inner.channel.term
    }

    /// The assignment state of this channel.
    pub fn state(&self) -> ChannelState {
        self.inner.state
    }

    /// The access mode of the current term.
    pub fn access_mode(&self) -> AccessMode {
        self.inner.channel.access_mode
    }

    /// The channel identity at the current term.
    pub fn channel_info(&self) -> &ChannelInfo {
        &self.inner.channel
    }

    /// True if the current owner has confirmed its assignment.
    pub fn is_assigned(&self) -> bool {
        self.inner.state == ChannelState::Assigned
    }

    /// The node which currently owns this channel, if any.
    ///
    /// Only `Assigning` and `Assigned` channels have an owner.
    pub fn current_owner(&self) -> Option<&NodeInfo> {
        match self.inner.state {
            ChannelState::Assigning | ChannelState::Assigned => self.inner.node.as_ref(),
            ChannelState::Uninitialized | ChannelState::Unavailable => None,
        }
    }

    /// The node of the most recent assignment, even if it has since been revoked.
    pub fn last_owner(&self) -> Option<&NodeInfo> {
        self.inner.node.as_ref()
    }

    /// The current assignment of this channel, if it has an owner.
    pub fn current_assignment(&self) -> Option<ChannelAssignment> {
        self.current_owner().map(|node| ChannelAssignment {
            channel: self.inner.channel.clone(),
            node: node.clone(),
        })
    }

    /// Assignments superseded since the last confirmation, oldest first.
    pub fn assign_histories(&self) -> &[ChannelAssignment] {
        &self.inner.histories
    }

    /// Open a mutation builder over a private copy of this snapshot.
    pub fn copy_for_write(&self) -> ChannelMetaMut {
        ChannelMetaMut {
            inner: ChannelMetaInner::clone(&self.inner),
            changed: false,
        }
    }
}

impl ChannelMetaInner {
    fn to_proto(&self) -> ChannelMetaProto {
        ChannelMetaProto {
            channel: Some(ChannelInfoProto {
                name: self.channel.name.clone(),
                term: self.channel.term,
                access_mode: self.channel.access_mode.into_proto(),
            }),
            node: self.node.clone().map(NodeInfo::into_proto),
            state: self.state.into_proto(),
            histories: self
                .histories
                .iter()
                .map(|entry| AssignmentLogProto {
                    term: entry.channel.term,
                    node: Some(entry.node.clone().into_proto()),
                    access_mode: entry.channel.access_mode.into_proto(),
                })
                .collect(),
        }
    }
}

/// A single-use mutation builder over a copy of a channel snapshot.
///
/// Transitions take effect only once the builder is finalized, and the snapshot it was opened
/// from is never touched.
#[derive(Debug)]
pub struct ChannelMetaMut {
    inner: ChannelMetaInner,
    /// True once any transition has been applied.
    changed: bool,
}

impl ChannelMetaMut {
    /// The name of the channel being mutated.
    pub fn name(&self) -> &str {
        &self.inner.channel.name
    }

    /// The term of the in-progress mutation.
    pub fn term(&self) -> u64 {
        self.inner.channel.term
    }

    /// The state of the in-progress mutation.
    pub fn state(&self) -> ChannelState {
        self.inner.state
    }

    /// Assignments superseded so far, oldest first.
    pub fn assign_histories(&self) -> &[ChannelAssignment] {
        &self.inner.histories
    }

    /// True if any transition has been applied to this builder.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Attempt to hand the channel to the given node, bumping the term.
    ///
    /// A confirmed assignment is never replaced silently: an `Assigned` channel must first be
    /// marked unavailable, so this returns `false` without changing anything.
    #[tracing::instrument(level = "trace", skip(self), fields(channel = %self.inner.channel.name, term = self.inner.channel.term))]
    pub fn try_assign_to_node(&mut self, access_mode: AccessMode, node: NodeInfo) -> bool {
        if self.inner.state == ChannelState::Assigned {
            tracing::debug!(%node, "channel is already assigned, rejecting reassignment");
            return false;
        }
        if self.inner.state != ChannelState::Uninitialized {
            if let Some(prev) = self.inner.node.take() {
                self.inner.histories.push(ChannelAssignment {
                    channel: self.inner.channel.clone(),
                    node: prev,
                });
            }
        }
        self.inner.channel.access_mode = access_mode;
        self.inner.channel.term += 1;
        self.inner.node = Some(node);
        self.inner.state = ChannelState::Assigning;
        self.changed = true;
        true
    }

    /// Confirm the in-flight assignment. The term is left unchanged.
    ///
    /// Returns `false` if the channel is not `Assigning`.
    pub fn assign_done(&mut self) -> bool {
        if self.inner.state != ChannelState::Assigning {
            tracing::debug!(channel = %self.inner.channel.name, state = %self.inner.state, "channel is not assigning, ignoring assignment confirmation");
            return false;
        }
        self.inner.histories.clear();
        self.inner.state = ChannelState::Assigned;
        self.changed = true;
        true
    }

    /// Revoke the owner of the given term.
    ///
    /// Only a term matching the current term has any effect. The assignment history is left
    /// as is.
    pub fn mark_as_unavailable(&mut self, term: u64) -> UnavailableOutcome {
        let current = self.inner.channel.term;
        if term < current {
            tracing::debug!(channel = %self.inner.channel.name, term, current, "ignoring unavailability report for a superseded term");
            return UnavailableOutcome::StaleTerm;
        }
        if term > current {
            tracing::warn!(channel = %self.inner.channel.name, term, current, "unavailability reported for a term which does not exist yet");
            return UnavailableOutcome::FutureTerm;
        }
        match self.inner.state {
            ChannelState::Uninitialized => UnavailableOutcome::NotAssigned,
            ChannelState::Unavailable => UnavailableOutcome::AlreadyUnavailable,
            ChannelState::Assigning | ChannelState::Assigned => {
                self.inner.state = ChannelState::Unavailable;
                self.changed = true;
                UnavailableOutcome::Marked
            }
        }
    }

    /// Finalize this mutation into a new immutable snapshot.
    pub fn into_meta(self) -> ChannelMeta {
        ChannelMeta::from_inner(self.inner)
    }

    /// Finalize this mutation into its persisted representation.
    pub fn into_proto(self) -> ChannelMetaProto {
        self.inner.to_proto()
    }
}
