#![forbid(unsafe_code)]

//! Ingestion pipeline for traffic relayed by agents injected into game
//! client processes.
//!
//! A [`ProcessWatcher`] reports matching processes, the [`Manager`] starts a
//! [`Session`] for each one, and every session decodes the agent's frames
//! into [`ProtocolBlock`]s delivered through a [`SessionHandle`]. The
//! [`HookAdapter`] wires all of it under one supervision tree.

mod adapter;
mod connection;
mod error;
mod injector;
mod manager;
pub mod platform;
pub mod protocol;
pub mod services;
mod session;
pub mod supervisor;
mod watcher;
pub mod wire;

pub use adapter::{AdapterEvents, HookAdapter};
pub use connection::{ChannelConnection, is_end_of_stream};
pub use error::Error;
pub use injector::AgentInjector;
pub use manager::{Manager, SessionTable};
pub use platform::Platform;
pub use protocol::{Body, Direction, ProtocolBlock};
pub use session::{REQUEST_ACK, Session, SessionBuilder, SessionHandle};
pub use supervisor::{RestartPolicy, Service, ServiceExit, ServiceToken, Supervisor};
pub use watcher::{ProcessEvents, ProcessWatcher};
