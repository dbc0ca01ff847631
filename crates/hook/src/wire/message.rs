#![forbid(unsafe_code)]

use bytes::Bytes;
use std::fmt;

/// Option subchannel that enables delivery of received (ingress) traffic.
pub const OPTION_INGRESS: u32 = 1;
/// Option subchannel that enables delivery of sent (egress) traffic.
pub const OPTION_EGRESS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Debug,
    Ping,
    Exit,
    Recv,
    Send,
    Option,
    Other(u8),
}

impl From<u8> for MessageKind {
    fn from(op: u8) -> Self {
        match op {
            0 => Self::Debug,
            1 => Self::Ping,
            2 => Self::Exit,
            3 => Self::Recv,
            4 => Self::Send,
            5 => Self::Option,
            other => Self::Other(other),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Debug => 0,
            MessageKind::Ping => 1,
            MessageKind::Exit => 2,
            MessageKind::Recv => 3,
            MessageKind::Send => 4,
            MessageKind::Option => 5,
            MessageKind::Other(op) => op,
        }
    }
}

/// One unit exchanged with the agent. The wire length is derived on encode
/// and is not part of the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub subchannel: u32,
    pub data: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, subchannel: u32, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            subchannel,
            data: data.into(),
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, 0, Bytes::new())
    }

    pub fn exit() -> Self {
        Self::new(MessageKind::Exit, 0, Bytes::new())
    }

    /// Turns a single agent option on.
    pub fn enable_option(option: u32) -> Self {
        Self::new(MessageKind::Option, option, Bytes::from_static(&[1]))
    }

    pub fn wire_len(&self) -> usize {
        super::HEADER_LEN + self.data.len()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("subchannel", &self.subchannel)
            .field("data_len", &self.data.len())
            .finish()
    }
}
