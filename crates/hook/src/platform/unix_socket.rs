#![forbid(unsafe_code)]

use crate::platform::{InjectError, RawChannel, RemoteProcessProvider, StreamChannel};
use async_trait::async_trait;
use config::PlatformConfig;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

/// Exit code the injector helper uses to report an already loaded payload.
pub const ALREADY_INJECTED_EXIT_CODE: i32 = 3;

/// Channels are unix domain sockets under a shared directory, and injection
/// is delegated to an external helper program.
#[derive(Debug, Clone)]
pub struct UnixSocketProvider {
    socket_dir: PathBuf,
    injector_command: Option<PathBuf>,
}

impl UnixSocketProvider {
    pub fn new(config: &PlatformConfig) -> Self {
        Self {
            socket_dir: config.socket_dir.clone(),
            injector_command: config.injector_command.clone(),
        }
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("{name}.sock"))
    }
}

#[async_trait]
impl RemoteProcessProvider for UnixSocketProvider {
    async fn inject_payload(&self, pid: u32, payload_path: &Path) -> Result<(), InjectError> {
        let Some(command) = &self.injector_command else {
            debug!(pid, "no injector configured, expecting a preloaded agent");
            return Err(InjectError::AlreadyInjected);
        };

        let status = tokio::process::Command::new(command)
            .arg(pid.to_string())
            .arg(payload_path)
            .kill_on_drop(true)
            .status()
            .await?;

        match status.code() {
            Some(0) => Ok(()),
            Some(ALREADY_INJECTED_EXIT_CODE) => Err(InjectError::AlreadyInjected),
            _ => Err(InjectError::Failed(format!(
                "{} exited with {status}",
                command.display()
            ))),
        }
    }

    async fn open_channel(
        &self,
        name: &str,
        timeout: Duration,
    ) -> std::io::Result<Box<dyn RawChannel>> {
        let path = self.socket_path(name);
        let stream = tokio::time::timeout(timeout, UnixStream::connect(&path))
            .await
            .map_err(|_| {
                std::io::Error::new(ErrorKind::TimedOut, format!("timed out dialing {path:?}"))
            })??;
        Ok(Box::new(StreamChannel::new(stream)))
    }

    fn is_remote_closed(&self, err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
        )
    }
}
