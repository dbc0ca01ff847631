#![forbid(unsafe_code)]

use crate::connection::{ChannelConnection, is_end_of_stream};
use crate::error::Error;
use crate::supervisor::{Service, ServiceExit};
use crate::wire::{self, Message};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the outgoing message queue of one session.
pub const OUTGOING_QUEUE_LEN: usize = 64;

/// Queues messages for a session's [`Sender`].
#[derive(Debug, Clone)]
pub struct SenderHandle {
    session_id: u32,
    tx: mpsc::Sender<Message>,
}

impl SenderHandle {
    pub async fn send(&self, message: Message) -> Result<(), Error> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::SenderClosed(self.session_id))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A handle whose queue is read directly instead of by a [`Sender`].
    #[cfg(test)]
    pub(crate) fn detached(session_id: u32) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTGOING_QUEUE_LEN);
        (Self { session_id, tx }, rx)
    }
}

/// Writes queued messages to the agent, one frame per write.
pub struct Sender {
    session_id: u32,
    conn: Arc<ChannelConnection>,
    outgoing: mpsc::Receiver<Message>,
}

impl Sender {
    pub fn new(session_id: u32, conn: Arc<ChannelConnection>) -> (Self, SenderHandle) {
        let (tx, outgoing) = mpsc::channel(OUTGOING_QUEUE_LEN);
        let sender = Self {
            session_id,
            conn,
            outgoing,
        };
        (sender, SenderHandle { session_id, tx })
    }
}

#[async_trait]
impl Service for Sender {
    fn name(&self) -> String {
        "sender".to_string()
    }

    async fn serve(&mut self, cancel: CancellationToken) -> ServiceExit {
        info!(session = self.session_id, "Running");
        let exit = loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break ServiceExit::Stopped,
                message = self.outgoing.recv() => message,
            };
            let Some(message) = message else {
                break ServiceExit::Complete;
            };

            let frame = match wire::encode(&message) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(session = self.session_id, %err, "Dropping outgoing message");
                    continue;
                }
            };
            let written = tokio::select! {
                _ = cancel.cancelled() => break ServiceExit::Stopped,
                written = self.conn.write(&frame) => written,
            };
            match written {
                Ok(n) if n < frame.len() => {
                    warn!(
                        session = self.session_id,
                        written = n,
                        expected = frame.len(),
                        "Short write to agent"
                    );
                }
                Ok(_) => {}
                Err(err) if is_end_of_stream(&err) => {
                    debug!(session = self.session_id, "agent closed the channel");
                    break ServiceExit::Complete;
                }
                Err(err) => {
                    warn!(session = self.session_id, ?err, "Failed to write to agent");
                }
            }
        };
        info!(session = self.session_id, "Stopping...");
        exit
    }
}
