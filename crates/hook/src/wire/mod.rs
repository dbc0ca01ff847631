#![forbid(unsafe_code)]

mod codec;
mod message;

pub use codec::{FrameError, HEADER_LEN, LENGTH_LEN, MAX_FRAME_LEN, decode, encode};
pub use message::{Message, MessageKind, OPTION_EGRESS, OPTION_INGRESS};
