/// The identity of a physical channel at a specific term.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelInfoProto {
    /// The unique name of the channel.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// The fencing term of the channel.
    #[prost(uint64, tag = "2")]
    pub term: u64,
    /// The access mode granted at this term.
    #[prost(enumeration = "AccessModeProto", tag = "3")]
    pub access_mode: i32,
}
/// The identity of a streaming node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfoProto {
    /// The server ID of the node.
    #[prost(int64, tag = "1")]
    pub server_id: i64,
    /// The network address of the node.
    #[prost(string, tag = "2")]
    pub address: ::prost::alloc::string::String,
}
/// A superseded assignment of a channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AssignmentLogProto {
    /// The term of the superseded assignment.
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// The node which held the superseded assignment.
    #[prost(message, optional, tag = "2")]
    pub node: ::core::option::Option<NodeInfoProto>,
    /// The access mode of the superseded assignment.
    #[prost(enumeration = "AccessModeProto", tag = "3")]
    pub access_mode: i32,
}
/// The persisted assignment state of a physical channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelMetaProto {
    /// The channel identity at its current term.
    #[prost(message, optional, tag = "1")]
    pub channel: ::core::option::Option<ChannelInfoProto>,
    /// The node of the current or most recent assignment.
    #[prost(message, optional, tag = "2")]
    pub node: ::core::option::Option<NodeInfoProto>,
    /// The assignment state of the channel.
    #[prost(enumeration = "ChannelStateProto", tag = "3")]
    pub state: i32,
    /// Assignments superseded since the last confirmation, oldest first.
    #[prost(message, repeated, tag = "4")]
    pub histories: ::prost::alloc::vec::Vec<AssignmentLogProto>,
}
/// Channel access modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AccessModeProto {
    ReadWrite = 0,
    ReadOnly = 1,
}
/// Channel assignment states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ChannelStateProto {
    Uninitialized = 0,
    Assigning = 1,
    Assigned = 2,
    Unavailable = 3,
}
