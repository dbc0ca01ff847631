#![forbid(unsafe_code)]

//! The services running inside every session.

mod pinger;
mod receiver;
mod sender;

pub use pinger::Pinger;
pub use receiver::{READ_BUFFER_LEN, Receiver};
pub use sender::{OUTGOING_QUEUE_LEN, Sender, SenderHandle};
