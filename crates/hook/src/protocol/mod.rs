#![forbid(unsafe_code)]

//! Game traffic blocks carried inside `Recv`/`Send` messages.

mod datatypes;
mod decoder;
mod registry;

pub use datatypes::{
    Casting, ChatMessage, Control, EgressChat, EgressInstanceMovement, EgressMovement, InitZone,
    Movement, PackedPosition,
};
pub use decoder::{
    BLOCK_HEADER_LEN, BlockStreams, LOCKON_CONTROL_TYPE, MIN_BLOCK_LEN, OBFUSCATED_TERRITORIES,
    ObfuscationState, ProtocolDecoder,
};
pub use registry::{BlockRegistry, BodyDecoder, CHAT_SUBCHANNEL, ZONE_SUBCHANNEL};

use bytes::Bytes;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Body too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// Which way a block travelled relative to the game client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Server to client.
    Ingress,
    /// Client to server.
    Egress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    InitZone(InitZone),
    Casting(Casting),
    Control(Control),
    Movement(Movement),
    EgressMovement(EgressMovement),
    EgressInstanceMovement(EgressInstanceMovement),
    ChatMessage(ChatMessage),
    EgressChat(EgressChat),
    /// No registered variant matched, or the matching one failed to decode.
    Raw(Bytes),
}

impl Body {
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }
}

/// One decoded unit of game traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolBlock {
    pub subject_id: u32,
    pub current_id: u32,
    pub timestamp: SystemTime,
    pub server_id: u16,
    pub opcode: u16,
    pub body: Body,
}
