#![forbid(unsafe_code)]

use crate::connection::ChannelConnection;
use crate::error::Error;
use crate::injector::AgentInjector;
use crate::platform::RemoteProcessProvider;
use crate::protocol::{BlockRegistry, ProtocolBlock, ProtocolDecoder};
use crate::services::{Pinger, Receiver, Sender, SenderHandle};
use crate::supervisor::{RestartPolicy, Service, ServiceExit, Supervisor};
use crate::wire::{Message, MessageKind, OPTION_EGRESS, OPTION_INGRESS};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use config::{Config, HookConfig};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Reply to an accepted request.
pub const REQUEST_ACK: &[u8] = b"OK";

/// A raw message to push to an agent, as accepted by
/// [`SessionHandle::send_request`].
#[derive(Debug, Deserialize)]
struct Request {
    op: u8,
    channel: u32,
    /// Base64 encoded payload.
    #[serde(default)]
    data: Option<String>,
}

/// The outside view of one live session.
#[derive(Debug)]
pub struct SessionHandle {
    id: u32,
    sender: SenderHandle,
    ingress: Mutex<Option<mpsc::Receiver<ProtocolBlock>>>,
    egress: Mutex<Option<mpsc::Receiver<ProtocolBlock>>>,
}

impl SessionHandle {
    /// The id of the instrumented process.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Take the stream of server-to-client blocks. Only the first call gets
    /// it; the stream ends when the session stops.
    pub fn subscribe_ingress(&self) -> Option<mpsc::Receiver<ProtocolBlock>> {
        take(&self.ingress)
    }

    /// Take the stream of client-to-server blocks.
    pub fn subscribe_egress(&self) -> Option<mpsc::Receiver<ProtocolBlock>> {
        take(&self.egress)
    }

    /// Queue a message for the agent.
    pub async fn send(&self, message: Message) -> Result<(), Error> {
        self.sender.send(message).await
    }

    /// Queue a request of the form `{"op": u8, "channel": u32, "data":
    /// "<base64>"}` for the agent. Replies [`REQUEST_ACK`] once queued.
    pub async fn send_request(&self, request: &[u8]) -> Result<Bytes, Error> {
        let request: Request = serde_json::from_slice(request)?;
        let data = match request.data {
            Some(data) => BASE64.decode(data)?,
            None => Vec::new(),
        };
        self.send(Message::new(
            MessageKind::from(request.op),
            request.channel,
            data,
        ))
        .await?;
        Ok(Bytes::from_static(REQUEST_ACK))
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

/// One instrumented process: a connection and the four services reading,
/// writing, decoding and pinging over it.
pub struct Session {
    id: u32,
    conn: Arc<ChannelConnection>,
    sender: SenderHandle,
    handshake_delay: Duration,
    children: Supervisor,
    pending: Vec<Box<dyn Service>>,
}

impl Session {
    pub fn new(
        id: u32,
        conn: ChannelConnection,
        config: &HookConfig,
        registry: Arc<BlockRegistry>,
        policy: RestartPolicy,
    ) -> (Self, Arc<SessionHandle>) {
        let conn = Arc::new(conn);
        let (messages_tx, messages_rx) = mpsc::channel(config.block_buffer);
        let (decoder, streams) = ProtocolDecoder::new(id, registry, messages_rx, config.block_buffer);
        let (sender, sender_handle) = Sender::new(id, conn.clone());
        let receiver = Receiver::new(id, conn.clone(), messages_tx);
        let pinger = Pinger::new(id, sender_handle.clone(), config.ping_interval);

        let handle = Arc::new(SessionHandle {
            id,
            sender: sender_handle.clone(),
            ingress: Mutex::new(Some(streams.ingress)),
            egress: Mutex::new(Some(streams.egress)),
        });
        let session = Self {
            id,
            conn,
            sender: sender_handle,
            handshake_delay: config.handshake_delay,
            children: Supervisor::new(format!("stream-{id}"), policy),
            pending: vec![
                Box::new(sender),
                Box::new(receiver),
                Box::new(decoder),
                Box::new(pinger),
            ],
        };
        (session, handle)
    }
}

/// Prime the agent to deliver traffic in both directions. Sent once and never
/// retried.
async fn handshake(sender: &SenderHandle, delay: Duration) {
    tokio::time::sleep(delay).await;
    for option in [OPTION_INGRESS, OPTION_EGRESS] {
        if let Err(err) = sender.send(Message::enable_option(option)).await {
            warn!(option, %err, "Failed to send handshake");
            return;
        }
    }
    debug!("handshake sent");
}

#[async_trait]
impl Service for Session {
    fn name(&self) -> String {
        format!("stream-{}", self.id)
    }

    async fn serve(&mut self, cancel: CancellationToken) -> ServiceExit {
        let span = info_span!("session", id = self.id);
        async {
            info!("Running");
            for service in self.pending.drain(..) {
                self.children.add_boxed(service);
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = handshake(&self.sender, self.handshake_delay) => cancel.cancelled().await,
            }

            self.children.stop().await;
            if let Err(err) = self.conn.close().await {
                warn!(?err, "Failed to close channel");
            }
            info!("Stopping...");
            ServiceExit::Stopped
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("conn", &self.conn)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

/// Builds sessions for newly discovered processes.
pub struct SessionBuilder {
    injector: AgentInjector,
    config: HookConfig,
    registry: Arc<BlockRegistry>,
    policy: RestartPolicy,
}

impl SessionBuilder {
    pub fn new(config: &Config, remote: Arc<dyn RemoteProcessProvider>) -> Self {
        Self {
            injector: AgentInjector::new(remote, config.hook.clone()),
            config: config.hook.clone(),
            registry: Arc::new(BlockRegistry::from_opcodes(&config.opcodes)),
            policy: RestartPolicy::from(&config.supervisor),
        }
    }

    /// Inject and connect to `pid`. Nothing is kept on failure.
    pub async fn build(&self, pid: u32) -> Result<(Session, Arc<SessionHandle>), Error> {
        let conn = self.injector.initialize(pid).await?;
        Ok(Session::new(
            pid,
            conn,
            &self.config,
            self.registry.clone(),
            self.policy,
        ))
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("injector", &self.injector)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::PipeSemantics;
    use crate::platform::StreamChannel;
    use crate::protocol::Body;
    use crate::wire;
    use bytes::BytesMut;
    use config::Opcodes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn session(is_owner: bool) -> (Session, Arc<SessionHandle>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let conn = ChannelConnection::new(
            Box::new(StreamChannel::new(ours)),
            Arc::new(PipeSemantics),
            is_owner,
        );
        let config = HookConfig {
            ping_interval: Duration::from_secs(3600),
            ..HookConfig::default()
        };
        let registry = Arc::new(BlockRegistry::from_opcodes(&Opcodes::default()));
        let (session, handle) = Session::new(9, conn, &config, registry, RestartPolicy::default());
        (session, handle, theirs)
    }

    async fn read_message(agent: &mut DuplexStream, buf: &mut BytesMut) -> Message {
        loop {
            if let Ok(message) = wire::decode(buf) {
                return message;
            }
            assert_ne!(agent.read_buf(buf).await.unwrap(), 0, "channel closed");
        }
    }

    fn movement_block() -> Vec<u8> {
        let mut data = vec![0u8; 32];
        data[8..16].copy_from_slice(&1_000u64.to_le_bytes());
        data[18..20].copy_from_slice(&Opcodes::default().movement.to_le_bytes());
        data.extend_from_slice(&[0u8; 16]);
        data
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_then_traffic_then_stop() {
        let (mut session, handle, mut agent) = session(true);
        let mut ingress = handle.subscribe_ingress().unwrap();
        assert!(handle.subscribe_ingress().is_none());

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { session.serve(cancel).await }
        });

        let mut buf = BytesMut::new();
        let first = read_message(&mut agent, &mut buf).await;
        let second = read_message(&mut agent, &mut buf).await;
        assert_eq!(first, Message::enable_option(OPTION_INGRESS));
        assert_eq!(second, Message::enable_option(OPTION_EGRESS));

        let block = Message::new(MessageKind::Recv, 1, movement_block());
        agent.write_all(&wire::encode(&block).unwrap()).await.unwrap();
        let block = ingress.recv().await.unwrap();
        assert!(matches!(block.body, Body::Movement(_)));

        cancel.cancel();
        assert_eq!(task.await.unwrap(), ServiceExit::Stopped);

        // An owner says goodbye before closing.
        let mut last = read_message(&mut agent, &mut buf).await;
        while last.kind == MessageKind::Ping {
            last = read_message(&mut agent, &mut buf).await;
        }
        assert_eq!(last, Message::exit());
        assert!(ingress.recv().await.is_none());
    }

    #[tokio::test]
    async fn blocks_flow_again_after_a_split_corrupt_prefix() {
        let (mut session, handle, mut agent) = session(false);
        let mut ingress = handle.subscribe_ingress().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { session.serve(cancel).await }
        });

        agent.write_all(&[8, 0, 0, 0, 0xff]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        agent.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        let block = Message::new(MessageKind::Recv, 1, movement_block());
        agent.write_all(&wire::encode(&block).unwrap()).await.unwrap();

        let block = tokio::time::timeout(Duration::from_secs(2), ingress.recv())
            .await
            .expect("no block after corrupt prefix")
            .unwrap();
        assert!(matches!(block.body, Body::Movement(_)));

        cancel.cancel();
        assert_eq!(task.await.unwrap(), ServiceExit::Stopped);
    }

    #[tokio::test]
    async fn requests_are_forwarded_to_the_agent() {
        let (mut session, handle, mut agent) = session(false);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { session.serve(cancel).await }
        });

        let reply = handle
            .send_request(br#"{"op": 4, "channel": 2, "data": "AQID"}"#)
            .await
            .unwrap();
        assert_eq!(&reply[..], REQUEST_ACK);

        let mut buf = BytesMut::new();
        let message = read_message(&mut agent, &mut buf).await;
        assert_eq!(message, Message::new(MessageKind::Send, 2, vec![1u8, 2, 3]));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        let (_session, handle, _agent) = session(false);
        assert!(matches!(
            handle.send_request(b"not json").await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            handle
                .send_request(br#"{"op": 4, "channel": 2, "data": "***"}"#)
                .await,
            Err(Error::InvalidRequestData(_))
        ));
    }

    #[tokio::test]
    async fn requests_fail_once_the_session_is_gone() {
        let (session, handle, _agent) = session(false);
        drop(session);
        assert!(matches!(
            handle.send_request(br#"{"op": 1, "channel": 0}"#).await,
            Err(Error::SenderClosed(9))
        ));
    }
}
