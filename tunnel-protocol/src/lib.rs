//! # Tunnel Protocol
//!
//! The wire format shared by the cloud relay and its agents: a
//! length-prefixed binary frame ([`Frame`]) carrying one of a fixed set of
//! typed messages ([`Message`]). Both sides of the control channel depend
//! on this crate so the two can never drift out of sync.

mod error;
mod frame;
mod message;

pub use error::{ProtocolError, MAX_PAYLOAD_LEN};
pub use frame::{Frame, FRAME_VERSION, HEADER_LEN};
pub use message::{
    AssignedRule, AssignedRuleKind, AuthAckPayload, AuthPayload, ConnectAckPayload,
    ConnectPayload, Message, MessageType, Protocol, RuleAssignmentPayload, UdpDataPayload,
};
