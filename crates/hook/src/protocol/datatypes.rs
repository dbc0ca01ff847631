#![forbid(unsafe_code)]

//! Structured block bodies. All layouts are little-endian; bytes past the
//! fixed prefix are ignored unless the variant carries trailing text.

use super::DecodeError;
use bytes::Buf;

fn ensure(data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() < expected {
        return Err(DecodeError::TooShort {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn nul_terminated(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedPosition {
    pub x: u16,
    pub y: u16,
    pub z: u16,
}

impl PackedPosition {
    fn read(buf: &mut &[u8]) -> Self {
        Self {
            x: buf.get_u16_le(),
            y: buf.get_u16_le(),
            z: buf.get_u16_le(),
        }
    }
}

/// Sent when the client enters a zone.
#[derive(Debug, Clone, PartialEq)]
pub struct InitZone {
    pub server_id: u16,
    pub territory_type_id: u16,
    pub weather_id: u8,
    pub bitmask: u8,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl InitZone {
    pub const SIZE: usize = 104;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure(data, Self::SIZE)?;
        let mut buf = data;
        let server_id = buf.get_u16_le();
        let territory_type_id = buf.get_u16_le();
        buf.advance(12);
        let weather_id = buf.get_u8();
        let bitmask = buf.get_u8();
        buf.advance(50);
        Ok(Self {
            server_id,
            territory_type_id,
            weather_id,
            bitmask,
            x: buf.get_f32_le(),
            y: buf.get_f32_le(),
            z: buf.get_f32_le(),
        })
    }
}

/// An actor starts casting an action.
#[derive(Debug, Clone, PartialEq)]
pub struct Casting {
    pub action_id_name: u16,
    pub action_id: u32,
    pub cast_time: f32,
    pub target_id: u32,
    pub direction: u16,
    pub unk_id1: u32,
    pub position: PackedPosition,
}

impl Casting {
    pub const SIZE: usize = 32;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure(data, Self::SIZE)?;
        let mut buf = data;
        let action_id_name = buf.get_u16_le();
        buf.advance(2);
        let action_id = buf.get_u32_le();
        let cast_time = buf.get_f32_le();
        let target_id = buf.get_u32_le();
        let direction = buf.get_u16_le();
        buf.advance(2);
        let unk_id1 = buf.get_u32_le();
        let position = PackedPosition::read(&mut buf);
        Ok(Self {
            action_id_name,
            action_id,
            cast_time,
            target_id,
            direction,
            unk_id1,
            position,
        })
    }
}

/// A generic actor control with a subtype and four parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub kind: u16,
    pub p1: u32,
    pub p2: u32,
    pub p3: u32,
    pub p4: u32,
}

impl Control {
    pub const SIZE: usize = 24;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure(data, Self::SIZE)?;
        let mut buf = data;
        let kind = buf.get_u16_le();
        buf.advance(2);
        Ok(Self {
            kind,
            p1: buf.get_u32_le(),
            p2: buf.get_u32_le(),
            p3: buf.get_u32_le(),
            p4: buf.get_u32_le(),
        })
    }
}

/// Another actor moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Movement {
    pub head_rotation: u8,
    pub direction: u8,
    pub animation_type: u8,
    pub animation_state: u8,
    pub animation_speed: u8,
    pub unknown_rotation: u8,
    pub position: PackedPosition,
    pub u3: u32,
}

impl Movement {
    pub const SIZE: usize = 16;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure(data, Self::SIZE)?;
        let mut buf = data;
        Ok(Self {
            head_rotation: buf.get_u8(),
            direction: buf.get_u8(),
            animation_type: buf.get_u8(),
            animation_state: buf.get_u8(),
            animation_speed: buf.get_u8(),
            unknown_rotation: buf.get_u8(),
            position: PackedPosition::read(&mut buf),
            u3: buf.get_u32_le(),
        })
    }
}

/// The local player moved in the open world.
#[derive(Debug, Clone, PartialEq)]
pub struct EgressMovement {
    pub direction: f32,
    pub u1: u32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub u2: u32,
}

impl EgressMovement {
    pub const SIZE: usize = 24;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure(data, Self::SIZE)?;
        let mut buf = data;
        Ok(Self {
            direction: buf.get_f32_le(),
            u1: buf.get_u32_le(),
            x: buf.get_f32_le(),
            y: buf.get_f32_le(),
            z: buf.get_f32_le(),
            u2: buf.get_u32_le(),
        })
    }
}

/// The local player moved inside an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EgressInstanceMovement {
    pub direction: f32,
    pub direction_before_slip: f32,
    pub u1: u32,
    pub u2: u32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub u3: u32,
}

impl EgressInstanceMovement {
    pub const SIZE: usize = 32;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure(data, Self::SIZE)?;
        let mut buf = data;
        Ok(Self {
            direction: buf.get_f32_le(),
            direction_before_slip: buf.get_f32_le(),
            u1: buf.get_u32_le(),
            u2: buf.get_u32_le(),
            x: buf.get_f32_le(),
            y: buf.get_f32_le(),
            z: buf.get_f32_le(),
            u3: buf.get_u32_le(),
        })
    }
}

/// A chat line received from another character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub content_id: u64,
    pub entity_id: u32,
    pub world_id: u16,
    pub chat_type: u8,
    pub sender_name: String,
    pub message: String,
}

impl ChatMessage {
    pub const SIZE: usize = 48;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure(data, Self::SIZE)?;
        let mut buf = data;
        let content_id = buf.get_u64_le();
        let entity_id = buf.get_u32_le();
        let world_id = buf.get_u16_le();
        let chat_type = buf.get_u8();
        buf.advance(1);
        Ok(Self {
            content_id,
            entity_id,
            world_id,
            chat_type,
            sender_name: nul_terminated(&data[16..48]),
            message: nul_terminated(&data[48..]),
        })
    }
}

/// A chat line typed by the local player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressChat {
    pub chat_type: u16,
    pub message: String,
}

impl EgressChat {
    pub const SIZE: usize = 4;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure(data, Self::SIZE)?;
        let mut buf = data;
        Ok(Self {
            chat_type: buf.get_u16_le(),
            message: nul_terminated(&data[4..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fixtures;

    #[test]
    fn decodes_movement() {
        let movement = Movement::decode(&fixtures::MOVEMENT).unwrap();
        assert_eq!(
            movement,
            Movement {
                head_rotation: 0x12,
                direction: 0x12,
                animation_type: 0x67,
                animation_state: 0x45,
                animation_speed: 0x01,
                unknown_rotation: 0x02,
                position: PackedPosition {
                    x: 0x89ab,
                    y: 0x89ab,
                    z: 0x89ab,
                },
                u3: 0x4567,
            }
        );
    }

    #[test]
    fn decodes_egress_movement() {
        let movement = EgressMovement::decode(&fixtures::EGRESS_MOVEMENT).unwrap();
        assert_eq!(movement.direction, std::f32::consts::PI);
        assert_eq!(movement.u1, 0x4567);
        assert_eq!((movement.x, movement.y, movement.z), (500.0, 600.0, 700.0));
        assert_eq!(movement.u2, 0x89ab);
    }

    #[test]
    fn decodes_casting_and_control() {
        let casting = Casting::decode(&fixtures::CASTING).unwrap();
        assert_eq!(casting.action_id_name, 0x1000);
        assert_eq!(casting.action_id, 0x1012);
        assert_eq!(casting.target_id, 0xe000_0000);

        let control = Control::decode(&fixtures::LOCKON).unwrap();
        assert_eq!(control.kind, 0x22);
        assert_eq!(control.p1, 0x40);
    }

    #[test]
    fn decodes_init_zone() {
        let zone = InitZone::decode(&fixtures::init_zone(947)).unwrap();
        assert_eq!(zone.server_id, 0x3412);
        assert_eq!(zone.territory_type_id, 947);
    }

    #[test]
    fn decodes_chat_text() {
        let mut data = vec![0u8; 48];
        data[0..8].copy_from_slice(&42u64.to_le_bytes());
        data[14] = 10;
        data[16..21].copy_from_slice(b"Alpha");
        data.extend_from_slice(b"hello there\0garbage");

        let chat = ChatMessage::decode(&data).unwrap();
        assert_eq!(chat.content_id, 42);
        assert_eq!(chat.chat_type, 10);
        assert_eq!(chat.sender_name, "Alpha");
        assert_eq!(chat.message, "hello there");

        let egress = EgressChat::decode(b"\x0a\x00\x00\x00/say hi").unwrap();
        assert_eq!(egress.chat_type, 10);
        assert_eq!(egress.message, "/say hi");
    }

    #[test]
    fn short_bodies_are_rejected() {
        assert_eq!(
            Control::decode(&[0x22, 0, 0, 0]),
            Err(DecodeError::TooShort {
                expected: Control::SIZE,
                actual: 4,
            })
        );
        assert!(InitZone::decode(&[0u8; 16]).is_err());
    }
}
