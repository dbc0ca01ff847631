#![forbid(unsafe_code)]

use crate::connection::{ChannelConnection, is_end_of_stream};
use crate::supervisor::{Service, ServiceExit};
use crate::wire::{self, FrameError, Message};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

/// Initial capacity of the read buffer. Room for one frame of the largest
/// size the codec accepts.
pub const READ_BUFFER_LEN: usize = wire::MAX_FRAME_LEN;

/// Reads frames off the channel and hands complete messages to the decoder.
pub struct Receiver {
    session_id: u32,
    conn: Arc<ChannelConnection>,
    messages: mpsc::Sender<Message>,
    buf: BytesMut,
}

impl Receiver {
    pub fn new(
        session_id: u32,
        conn: Arc<ChannelConnection>,
        messages: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            session_id,
            conn,
            messages,
            buf: BytesMut::with_capacity(READ_BUFFER_LEN),
        }
    }

    /// Forward every complete frame in the buffer. Returns false when
    /// cancelled while waiting on the decoder.
    async fn drain(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            let message = match wire::decode(&mut self.buf) {
                Ok(message) => message,
                Err(FrameError::Incomplete) => return true,
                Err(err) => {
                    warn!(session = self.session_id, %err, "Discarding corrupt frame");
                    continue;
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return false,
                sent = self.messages.send(message) => {
                    if sent.is_err() {
                        trace!(session = self.session_id, "decoder is gone, dropping message");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Service for Receiver {
    fn name(&self) -> String {
        "receiver".to_string()
    }

    async fn serve(&mut self, cancel: CancellationToken) -> ServiceExit {
        info!(session = self.session_id, "Running");
        let exit = loop {
            if !self.drain(&cancel).await {
                break ServiceExit::Stopped;
            }

            let read = tokio::select! {
                _ = cancel.cancelled() => break ServiceExit::Stopped,
                read = self.conn.read(&mut self.buf) => read,
            };
            match read {
                Ok(n) => trace!(session = self.session_id, n, "read from agent"),
                Err(err) if is_end_of_stream(&err) => {
                    info!(session = self.session_id, "Agent closed the channel");
                    if let Err(err) = self.conn.close().await {
                        warn!(session = self.session_id, ?err, "Failed to close channel");
                    }
                    break ServiceExit::Complete;
                }
                Err(err) => {
                    warn!(session = self.session_id, ?err, "Failed to read from agent");
                }
            }
        };
        info!(session = self.session_id, "Stopping...");
        exit
    }
}
