#![forbid(unsafe_code)]

use super::datatypes::{
    Casting, ChatMessage, Control, EgressChat, EgressInstanceMovement, EgressMovement, InitZone,
    Movement,
};
use super::{Body, DecodeError, Direction};
use config::Opcodes;
use std::collections::HashMap;

/// Subchannel carrying zone and world traffic.
pub const ZONE_SUBCHANNEL: u32 = 1;
/// Subchannel carrying chat traffic.
pub const CHAT_SUBCHANNEL: u32 = 2;

pub type BodyDecoder = fn(&[u8]) -> Result<Body, DecodeError>;

/// Maps `(subchannel, opcode, direction)` to the decoder of a body variant.
///
/// Only the zone and chat subchannels are ever consulted; blocks on any other
/// subchannel stay raw.
#[derive(Debug, Clone, Default)]
pub struct BlockRegistry {
    decoders: HashMap<(u32, u16, Direction), BodyDecoder>,
}

impl BlockRegistry {
    /// The default table, keyed by the configured opcodes.
    pub fn from_opcodes(opcodes: &Opcodes) -> Self {
        use Direction::{Egress, Ingress};

        let mut registry = Self::default();
        registry
            .register(ZONE_SUBCHANNEL, opcodes.init_zone, Ingress, |data| {
                InitZone::decode(data).map(Body::InitZone)
            })
            .register(ZONE_SUBCHANNEL, opcodes.casting, Ingress, |data| {
                Casting::decode(data).map(Body::Casting)
            })
            .register(ZONE_SUBCHANNEL, opcodes.control, Ingress, |data| {
                Control::decode(data).map(Body::Control)
            })
            .register(ZONE_SUBCHANNEL, opcodes.movement, Ingress, |data| {
                Movement::decode(data).map(Body::Movement)
            })
            .register(ZONE_SUBCHANNEL, opcodes.egress_movement, Egress, |data| {
                EgressMovement::decode(data).map(Body::EgressMovement)
            })
            .register(
                ZONE_SUBCHANNEL,
                opcodes.egress_instance_movement,
                Egress,
                |data| EgressInstanceMovement::decode(data).map(Body::EgressInstanceMovement),
            )
            .register(CHAT_SUBCHANNEL, opcodes.chat, Ingress, |data| {
                ChatMessage::decode(data).map(Body::ChatMessage)
            })
            .register(CHAT_SUBCHANNEL, opcodes.egress_chat, Egress, |data| {
                EgressChat::decode(data).map(Body::EgressChat)
            });
        registry
    }

    /// Add or replace the decoder for one key.
    pub fn register(
        &mut self,
        subchannel: u32,
        opcode: u16,
        direction: Direction,
        decoder: BodyDecoder,
    ) -> &mut Self {
        self.decoders.insert((subchannel, opcode, direction), decoder);
        self
    }

    pub fn lookup(&self, subchannel: u32, opcode: u16, direction: Direction) -> Option<BodyDecoder> {
        if !matches!(subchannel, ZONE_SUBCHANNEL | CHAT_SUBCHANNEL) {
            return None;
        }
        self.decoders.get(&(subchannel, opcode, direction)).copied()
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}
