use anyhow::Result;

use super::channel::*;
use crate::models::proto::{ChannelInfoProto, ChannelMetaProto, ChannelStateProto, NodeInfoProto};
use crate::utils;

const CHANNEL: &str = "test-channel";

fn assign(meta: &ChannelMeta, server_id: i64) -> (bool, ChannelMeta) {
    let mut builder = meta.copy_for_write();
    let ok = builder.try_assign_to_node(AccessMode::ReadWrite, NodeInfo::new(server_id));
    (ok, builder.into_meta())
}

fn assign_done(meta: &ChannelMeta) -> ChannelMeta {
    let mut builder = meta.copy_for_write();
    assert!(builder.assign_done(), "expected assign_done to apply on state {}", meta.state());
    builder.into_meta()
}

fn mark_unavailable(meta: &ChannelMeta, term: u64) -> (UnavailableOutcome, ChannelMeta) {
    let mut builder = meta.copy_for_write();
    let outcome = builder.mark_as_unavailable(term);
    (outcome, builder.into_meta())
}

#[test]
fn new_channel_is_uninitialized_at_initial_term() {
    let meta = ChannelMeta::new(CHANNEL, AccessMode::ReadWrite);

    assert_eq!(meta.name(), CHANNEL);
    assert_eq!(meta.term(), INITIAL_TERM, "expected term {} got {}", INITIAL_TERM, meta.term());
    assert_eq!(meta.state(), ChannelState::Uninitialized);
    assert!(!meta.is_assigned(), "expected new channel to not be assigned");
    assert!(meta.current_owner().is_none(), "expected new channel to have no owner");
    assert!(meta.current_assignment().is_none(), "expected new channel to have no assignment");
    assert!(meta.assign_histories().is_empty(), "expected empty history");
}

#[test]
fn from_proto_exposes_raw_fields() -> Result<()> {
    let meta = ChannelMeta::from_proto(ChannelMetaProto {
        channel: Some(ChannelInfoProto {
            name: CHANNEL.into(),
            term: 1,
            access_mode: 0,
        }),
        node: Some(NodeInfoProto { server_id: 123, address: "".into() }),
        state: ChannelStateProto::Uninitialized as i32,
        histories: vec![],
    })?;

    assert_eq!(meta.name(), CHANNEL);
    assert_eq!(meta.term(), 1);
    assert_eq!(meta.state(), ChannelState::Uninitialized);
    assert!(!meta.is_assigned());
    assert!(meta.assign_histories().is_empty());
    assert!(meta.current_owner().is_none(), "uninitialized channels have no owner");
    assert_eq!(meta.access_mode(), AccessMode::ReadWrite);
    assert_eq!(meta.last_owner(), Some(&NodeInfo::new(123)));

    // A stored node on an uninitialized channel is never archived.
    let (ok, next) = assign(&meta, 456);
    assert!(ok);
    assert!(next.assign_histories().is_empty(), "expected no history, got {:?}", next.assign_histories());
    Ok(())
}

#[test]
fn from_proto_rejects_malformed_records() {
    let missing_channel = ChannelMetaProto::default();
    assert!(ChannelMeta::from_proto(missing_channel).is_err(), "expected error for missing channel info");

    let bad_state = ChannelMetaProto {
        channel: Some(ChannelInfoProto {
            name: CHANNEL.into(),
            term: 1,
            access_mode: 0,
        }),
        node: None,
        state: 42,
        histories: vec![],
    };
    assert!(ChannelMeta::from_proto(bad_state).is_err(), "expected error for unknown state");
}

#[test]
fn assignment_scenario_reassign_then_confirm() {
    let meta = ChannelMeta::new("c1", AccessMode::ReadWrite);

    let (ok, first) = assign(&meta, 456);
    assert!(ok, "expected first assignment to succeed");
    assert_eq!(first.term(), 2);
    assert_eq!(first.state(), ChannelState::Assigning);
    assert_eq!(first.current_owner(), Some(&NodeInfo::new(456)));
    assert!(first.assign_histories().is_empty());
    assert!(!first.is_assigned());

    // The source snapshot is untouched.
    assert_eq!(meta.term(), 1);
    assert_eq!(meta.state(), ChannelState::Uninitialized);

    let (ok, second) = assign(&first, 789);
    assert!(ok, "expected reassignment of an assigning channel to succeed");
    assert_eq!(second.term(), 3);
    assert_eq!(second.state(), ChannelState::Assigning);
    assert_eq!(second.current_owner(), Some(&NodeInfo::new(789)));
    let histories = second.assign_histories();
    assert_eq!(histories.len(), 1, "expected 1 history entry, got {:?}", histories);
    assert_eq!(histories[0].channel.name, "c1");
    assert_eq!(histories[0].channel.term, 2);
    assert_eq!(histories[0].node.server_id, 456);

    let done = assign_done(&second);
    assert_eq!(done.term(), 3, "assign_done must not change the term");
    assert_eq!(done.state(), ChannelState::Assigned);
    assert_eq!(done.current_owner(), Some(&NodeInfo::new(789)));
    assert!(done.is_assigned());
    assert!(done.assign_histories().is_empty(), "expected history to be cleared");
}

#[test]
fn assigned_channel_rejects_reassignment_and_stale_revocation() {
    let meta = ChannelMeta::new("c1", AccessMode::ReadWrite);
    let (_, meta) = assign(&meta, 456);
    let (_, meta) = assign(&meta, 789);
    let meta = assign_done(&meta);

    let mut builder = meta.copy_for_write();
    assert!(!builder.try_assign_to_node(AccessMode::ReadWrite, NodeInfo::new(789)), "expected assigned channel to reject assignment");
    assert!(!builder.is_changed(), "rejected assignment must not change the builder");
    assert_eq!(builder.into_meta(), meta);

    let (outcome, stale) = mark_unavailable(&meta, 2);
    assert_eq!(outcome, UnavailableOutcome::StaleTerm);
    assert_eq!(stale, meta, "stale revocation must be a complete no-op");
    assert!(stale.is_assigned());

    let (outcome, revoked) = mark_unavailable(&meta, 3);
    assert_eq!(outcome, UnavailableOutcome::Marked);
    assert_eq!(revoked.state(), ChannelState::Unavailable);
    assert_eq!(revoked.term(), 3);
    assert!(!revoked.is_assigned());
    assert!(revoked.current_owner().is_none(), "expected ownership to be cleared");
    assert_eq!(revoked.last_owner(), Some(&NodeInfo::new(789)));

    let (outcome, again) = mark_unavailable(&revoked, 3);
    assert_eq!(outcome, UnavailableOutcome::AlreadyUnavailable);
    assert_eq!(again, revoked);
}

#[test]
fn unavailable_channel_can_be_reassigned() {
    let meta = ChannelMeta::new("c1", AccessMode::ReadWrite);
    let (_, meta) = assign(&meta, 456);
    let (_, meta) = assign(&meta, 789);
    let meta = assign_done(&meta);
    let (_, meta) = mark_unavailable(&meta, 3);

    let (ok, next) = assign(&meta, 789);
    assert!(ok, "expected unavailable channel to accept assignment");
    assert_eq!(next.term(), 4);
    assert_eq!(next.state(), ChannelState::Assigning);
    let histories = next.assign_histories();
    assert_eq!(histories.len(), 1, "expected 1 history entry, got {:?}", histories);
    assert_eq!(histories[0].channel.term, 3);
    assert_eq!(histories[0].node.server_id, 789);
}

#[test]
fn future_term_revocation_is_ignored() {
    let meta = ChannelMeta::new("c1", AccessMode::ReadWrite);
    let (_, meta) = assign(&meta, 456);

    let (outcome, next) = mark_unavailable(&meta, meta.term() + 1);
    assert_eq!(outcome, UnavailableOutcome::FutureTerm);
    assert_eq!(next, meta, "future term revocation must not change the channel");
}

#[test]
fn uninitialized_channel_cannot_be_revoked() {
    let meta = ChannelMeta::new("c1", AccessMode::ReadWrite);
    let (outcome, next) = mark_unavailable(&meta, INITIAL_TERM);
    assert_eq!(outcome, UnavailableOutcome::NotAssigned);
    assert_eq!(next, meta);
}

#[test]
fn assigning_channel_can_be_revoked_keeping_history() {
    let meta = ChannelMeta::new("c1", AccessMode::ReadWrite);
    let (_, meta) = assign(&meta, 1);
    let (_, meta) = assign(&meta, 2);

    let (outcome, revoked) = mark_unavailable(&meta, 3);
    assert_eq!(outcome, UnavailableOutcome::Marked);
    assert_eq!(revoked.assign_histories().len(), 1, "revocation must not clear history");

    let (_, next) = assign(&revoked, 3);
    let terms: Vec<u64> = next.assign_histories().iter().map(|entry| entry.channel.term).collect();
    assert_eq!(terms, vec![2, 3], "expected history in supersession order");
}

#[test]
fn assign_done_outside_assigning_is_noop() {
    let meta = ChannelMeta::new("c1", AccessMode::ReadWrite);
    let mut builder = meta.copy_for_write();
    assert!(!builder.assign_done());
    assert!(!builder.is_changed());
    assert_eq!(builder.into_meta(), meta);
}

#[test]
fn history_grows_with_each_unconfirmed_assignment() {
    let mut meta = ChannelMeta::new("c1", AccessMode::ReadWrite);
    let mut last_term = meta.term();
    for n in 1..=10i64 {
        let (ok, next) = assign(&meta, n);
        assert!(ok);
        assert_eq!(next.term(), last_term + 1, "expected term to increase by exactly 1");
        assert_eq!(next.assign_histories().len(), (n - 1) as usize, "unexpected history length after {} assignments", n);
        last_term = next.term();
        meta = next;
    }
    let done = assign_done(&meta);
    assert!(done.assign_histories().is_empty());
    assert_eq!(done.term(), last_term);
}

#[test]
fn access_mode_is_recorded_per_term() {
    let meta = ChannelMeta::new("c1", AccessMode::ReadWrite);
    let mut builder = meta.copy_for_write();
    assert!(builder.try_assign_to_node(AccessMode::ReadOnly, NodeInfo::new(1)));
    assert!(builder.try_assign_to_node(AccessMode::ReadWrite, NodeInfo::new(2)));
    let meta = builder.into_meta();

    assert_eq!(meta.access_mode(), AccessMode::ReadWrite);
    assert_eq!(meta.assign_histories()[0].channel.access_mode, AccessMode::ReadOnly);
}

#[test]
fn snapshot_survives_persisted_representation() -> Result<()> {
    let meta = ChannelMeta::new("c1", AccessMode::ReadWrite);
    let mut builder = meta.copy_for_write();
    assert!(builder.try_assign_to_node(AccessMode::ReadWrite, NodeInfo::new(456).with_address("10.0.0.1:7000")));
    assert!(builder.try_assign_to_node(AccessMode::ReadOnly, NodeInfo::new(789)));
    let raw = builder.into_proto();

    let bytes = utils::encode_model(&raw)?;
    let decoded = ChannelMeta::from_proto(utils::decode_model(&bytes)?)?;

    assert_eq!(decoded.to_proto(), raw);
    assert_eq!(decoded.name(), "c1");
    assert_eq!(decoded.term(), 3);
    assert_eq!(decoded.state(), ChannelState::Assigning);
    assert_eq!(decoded.access_mode(), AccessMode::ReadOnly);
    assert_eq!(decoded.current_owner(), Some(&NodeInfo::new(789)));
    assert_eq!(decoded.assign_histories().len(), 1);
    assert_eq!(decoded.assign_histories()[0].node, NodeInfo::new(456).with_address("10.0.0.1:7000"));
    Ok(())
}
