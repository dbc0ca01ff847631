#![forbid(unsafe_code)]

use super::SenderHandle;
use crate::supervisor::{Service, ServiceExit};
use crate::wire::Message;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Keeps the agent's channel alive with periodic pings.
#[derive(Debug)]
pub struct Pinger {
    session_id: u32,
    sender: SenderHandle,
    period: Duration,
}

impl Pinger {
    pub fn new(session_id: u32, sender: SenderHandle, period: Duration) -> Self {
        Self {
            session_id,
            sender,
            period,
        }
    }
}

#[async_trait]
impl Service for Pinger {
    fn name(&self) -> String {
        "pinger".to_string()
    }

    async fn serve(&mut self, cancel: CancellationToken) -> ServiceExit {
        info!(session = self.session_id, "Running");
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled() => break ServiceExit::Stopped,
                _ = ticker.tick() => {}
            }
            let sent = tokio::select! {
                _ = cancel.cancelled() => break ServiceExit::Stopped,
                sent = self.sender.send(Message::ping()) => sent,
            };
            if sent.is_err() {
                debug!(session = self.session_id, "sender is gone");
                break ServiceExit::Complete;
            }
        };
        info!(session = self.session_id, "Stopping...");
        exit
    }
}
