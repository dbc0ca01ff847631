use serde::{Deserialize, Serialize};

/// Opcodes of the body variants the decoder knows how to parse.
///
/// The game renumbers these on most patches, so they are configuration rather
/// than constants. TOML accepts hex literals, e.g. `init_zone = 0x0311`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Opcodes {
    pub init_zone: u16,
    pub casting: u16,
    pub control: u16,
    pub movement: u16,
    pub egress_movement: u16,
    pub egress_instance_movement: u16,
    pub chat: u16,
    pub egress_chat: u16,
}

impl Default for Opcodes {
    fn default() -> Self {
        Self {
            init_zone: 0x0311,
            casting: 0x01b6,
            control: 0x0245,
            movement: 0x00d5,
            egress_movement: 0x02d0,
            egress_instance_movement: 0x01a4,
            chat: 0x0065,
            egress_chat: 0x0066,
        }
    }
}
