//! Typed messages carried inside [`crate::Frame`] payloads.
//!
//! Structured payloads (everything except `Data`/`Close`/`Heartbeat`, which
//! are opaque or empty) are encoded with `bincode` — compact and fast
//! enough not to matter next to the TCP/WS framing cost around it.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::frame::Frame;

/// Fixed wire codes for each message kind. New variants must be appended,
/// never renumbered, so that `version` stays a sufficient compatibility
/// guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Auth = 1,
    AuthAck = 2,
    Heartbeat = 3,
    Connect = 4,
    ConnectAck = 5,
    Data = 6,
    Close = 7,
    UdpData = 8,
    IcmpData = 9,
    /// Not part of the original fixed set; added for rule lifecycle glue
    /// Cloud pushes the rules an agent sources so it
    /// can start its own local listeners. Backward-safe:
    /// an older peer that doesn't know this code would reject it as
    /// `UnknownMessageType`, never silently misinterpret it.
    RuleAssignment = 10,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::Auth,
            2 => MessageType::AuthAck,
            3 => MessageType::Heartbeat,
            4 => MessageType::Connect,
            5 => MessageType::ConnectAck,
            6 => MessageType::Data,
            7 => MessageType::Close,
            8 => MessageType::UdpData,
            9 => MessageType::IcmpData,
            10 => MessageType::RuleAssignment,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAckPayload {
    pub success: bool,
    pub agent_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPayload {
    pub protocol: Protocol,
    pub target_host: String,
    pub target_port: u16,
    /// Set only when an agent is the initiator (`agent→cloud`/`agent→agent`
    /// rules): tells Cloud which rule governs this connect so it knows
    /// whether to dial the target itself or relay onward to a second
    /// agent. `None` when Cloud is the initiator, since Cloud already
    /// knows the rule context.
    pub rule_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAckPayload {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpDataPayload {
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignedRuleKind {
    AgentToCloud,
    AgentToAgent,
}

/// The subset of a rule an agent needs to run its own local listener for
/// an `agent→cloud`/`agent→agent` rule it sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignedRule {
    pub rule_id: String,
    pub kind: AssignedRuleKind,
    pub protocol: Protocol,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAssignmentPayload {
    pub rules: Vec<AssignedRule>,
}

/// The decoded, application-level view of a frame. `tunnel_id` is carried
/// alongside rather than inside the variant since it is a property of the
/// envelope, not of any one message's payload.
#[derive(Debug, Clone)]
pub enum Message {
    Auth(AuthPayload),
    AuthAck(AuthAckPayload),
    Heartbeat,
    Connect(ConnectPayload),
    ConnectAck(ConnectAckPayload),
    Data(Vec<u8>),
    Close,
    UdpData(UdpDataPayload),
    IcmpData(Vec<u8>),
    RuleAssignment(RuleAssignmentPayload),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Auth(_) => MessageType::Auth,
            Message::AuthAck(_) => MessageType::AuthAck,
            Message::Heartbeat => MessageType::Heartbeat,
            Message::Connect(_) => MessageType::Connect,
            Message::ConnectAck(_) => MessageType::ConnectAck,
            Message::Data(_) => MessageType::Data,
            Message::Close => MessageType::Close,
            Message::UdpData(_) => MessageType::UdpData,
            Message::IcmpData(_) => MessageType::IcmpData,
            Message::RuleAssignment(_) => MessageType::RuleAssignment,
        }
    }

    /// Encodes this message as a frame addressed to `tunnel_id` (0 for
    /// channel-scoped messages).
    pub fn into_frame(self, tunnel_id: u32) -> Frame {
        let msg_type = self.message_type();
        let payload = match self {
            Message::Auth(p) => bincode::serialize(&p).expect("infallible"),
            Message::AuthAck(p) => bincode::serialize(&p).expect("infallible"),
            Message::Heartbeat => Vec::new(),
            Message::Connect(p) => bincode::serialize(&p).expect("infallible"),
            Message::ConnectAck(p) => bincode::serialize(&p).expect("infallible"),
            Message::Data(bytes) => bytes,
            Message::Close => Vec::new(),
            Message::UdpData(p) => bincode::serialize(&p).expect("infallible"),
            Message::IcmpData(bytes) => bytes,
            Message::RuleAssignment(p) => bincode::serialize(&p).expect("infallible"),
        };
        Frame::new(msg_type, tunnel_id, payload)
    }

    /// Decodes a frame's payload according to its declared message type.
    pub fn from_frame(frame: Frame) -> Result<(u32, Message), ProtocolError> {
        let msg_type = frame.msg_type;
        fn decode<T: serde::de::DeserializeOwned>(
            bytes: &[u8],
            msg_type: MessageType,
        ) -> Result<T, ProtocolError> {
            bincode::deserialize(bytes).map_err(|e| ProtocolError::BadPayload(msg_type, e))
        }
        let message = match msg_type {
            MessageType::Auth => Message::Auth(decode(&frame.payload, msg_type)?),
            MessageType::AuthAck => Message::AuthAck(decode(&frame.payload, msg_type)?),
            MessageType::Heartbeat => Message::Heartbeat,
            MessageType::Connect => Message::Connect(decode(&frame.payload, msg_type)?),
            MessageType::ConnectAck => Message::ConnectAck(decode(&frame.payload, msg_type)?),
            MessageType::Data => Message::Data(frame.payload),
            MessageType::Close => Message::Close,
            MessageType::UdpData => Message::UdpData(decode(&frame.payload, msg_type)?),
            MessageType::IcmpData => Message::IcmpData(frame.payload),
            MessageType::RuleAssignment => {
                Message::RuleAssignment(decode(&frame.payload, msg_type)?)
            }
        };
        Ok((frame.tunnel_id, message))
    }
}
