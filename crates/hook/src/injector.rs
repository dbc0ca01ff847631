#![forbid(unsafe_code)]

use crate::connection::ChannelConnection;
use crate::error::Error;
use crate::platform::{InjectError, RemoteProcessProvider};
use config::HookConfig;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Loads the agent into a process and opens the channel it serves.
pub struct AgentInjector {
    remote: Arc<dyn RemoteProcessProvider>,
    config: HookConfig,
}

impl AgentInjector {
    pub fn new(remote: Arc<dyn RemoteProcessProvider>, config: HookConfig) -> Self {
        Self { remote, config }
    }

    /// Inject the payload into `pid` and connect to its agent.
    ///
    /// A payload that is already loaded counts as success, but the resulting
    /// connection does not own the agent. Every call starts from scratch.
    pub async fn initialize(&self, pid: u32) -> Result<ChannelConnection, Error> {
        let payload_path = &self.config.payload_path;
        if let Err(source) = tokio::fs::metadata(payload_path).await {
            return Err(Error::PayloadMissing {
                path: payload_path.clone(),
                source,
            });
        }

        let is_owner = match self.remote.inject_payload(pid, payload_path).await {
            Ok(()) => {
                info!(pid, "Injected agent");
                true
            }
            Err(InjectError::AlreadyInjected) => {
                debug!(pid, "agent already loaded");
                false
            }
            Err(source) => return Err(Error::Inject { pid, source }),
        };

        let name = self.config.channel_name(pid);
        let attempts = self.config.dial_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .remote
                .open_channel(&name, self.config.dial_timeout)
                .await
            {
                Ok(channel) => {
                    debug!(pid, %name, attempt, "channel open");
                    return Ok(ChannelConnection::new(
                        channel,
                        self.remote.clone(),
                        is_owner,
                    ));
                }
                Err(source) if attempt >= attempts => {
                    return Err(Error::Dial {
                        name,
                        attempts,
                        source,
                    });
                }
                Err(err) => {
                    warn!(pid, %name, attempt, ?err, "Failed to open channel, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.dial_retry_interval).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for AgentInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentInjector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
