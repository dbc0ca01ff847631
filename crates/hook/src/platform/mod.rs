#![forbid(unsafe_code)]

mod channel;
mod procfs_enumerator;
#[cfg(unix)]
mod unix_socket;

pub use channel::{RawChannel, StreamChannel};
pub use procfs_enumerator::ProcfsEnumerator;
#[cfg(unix)]
pub use unix_socket::{ALREADY_INJECTED_EXIT_CODE, UnixSocketProvider};

use crate::error::Error;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub trait ProcessEnumerator: Send + Sync {
    /// List every running process as `pid -> name`.
    fn enumerate_processes(&self) -> Result<HashMap<u32, String>, Error>;
}

/// Cross-process mechanics the core relies on but never implements itself.
#[async_trait]
pub trait RemoteProcessProvider: Send + Sync {
    /// Load the payload at `payload_path` into process `pid`.
    async fn inject_payload(&self, pid: u32, payload_path: &Path) -> Result<(), InjectError>;
    /// Open the named channel served by an injected agent.
    async fn open_channel(
        &self,
        name: &str,
        timeout: Duration,
    ) -> std::io::Result<Box<dyn RawChannel>>;
    /// Whether `err` means the other end of a channel went away.
    fn is_remote_closed(&self, err: &std::io::Error) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("Payload is already injected")]
    AlreadyInjected,

    #[error("Injection is not supported on this platform")]
    Unsupported,

    #[error("Injection failed: {0}")]
    Failed(String),

    #[error("Injection failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The capabilities handed to the adapter by the platform layer.
#[derive(Clone)]
pub struct Platform {
    pub enumerator: Arc<dyn ProcessEnumerator>,
    pub remote: Arc<dyn RemoteProcessProvider>,
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    /// Serves every channel from an in-memory pipe and hands the agent's end
    /// to the test. Agents always count as preloaded.
    pub(crate) struct DuplexRemote {
        agents: mpsc::UnboundedSender<(String, DuplexStream)>,
    }

    impl DuplexRemote {
        pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, DuplexStream)>) {
            let (agents, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { agents }), rx)
        }
    }

    #[async_trait]
    impl RemoteProcessProvider for DuplexRemote {
        async fn inject_payload(&self, _pid: u32, _path: &Path) -> Result<(), InjectError> {
            Err(InjectError::AlreadyInjected)
        }

        async fn open_channel(
            &self,
            name: &str,
            _timeout: Duration,
        ) -> std::io::Result<Box<dyn RawChannel>> {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            self.agents
                .send((name.to_string(), theirs))
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::NotFound))?;
            Ok(Box::new(StreamChannel::new(ours)))
        }

        fn is_remote_closed(&self, err: &std::io::Error) -> bool {
            err.kind() == std::io::ErrorKind::BrokenPipe
        }
    }
}
