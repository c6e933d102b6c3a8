pub mod channel;
#[cfg(test)]
mod channel_test;
pub mod proto {
    mod channel;

    pub use channel::*;
}

pub use channel::{AccessMode, ChannelAssignment, ChannelInfo, ChannelMeta, ChannelMetaMut, ChannelState, NodeInfo, UnavailableOutcome, INITIAL_TERM};
