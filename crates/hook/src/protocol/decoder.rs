#![forbid(unsafe_code)]

use super::registry::BlockRegistry;
use super::{Body, Direction, ProtocolBlock};
use crate::supervisor::{Service, ServiceExit};
use crate::wire::{Message, MessageKind};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const BLOCK_HEADER_LEN: usize = 32;
/// Blocks shorter than this are dropped without decoding.
pub const MIN_BLOCK_LEN: usize = 48;
/// Territories whose control blocks are obfuscated.
pub const OBFUSCATED_TERRITORIES: [u16; 4] = [946, 947, 948, 949];
/// Control subtype whose first parameter carries the obfuscation byte.
pub const LOCKON_CONTROL_TYPE: u16 = 0x22;

/// Per-session decoding state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObfuscationState {
    pub zone_uses_obfuscation: bool,
    pub key_byte: Option<u8>,
    /// Starts at the epoch, so a burst stamped at the epoch is forwarded once.
    pub last_egress_move_ts: SystemTime,
}

impl Default for ObfuscationState {
    fn default() -> Self {
        Self {
            zone_uses_obfuscation: false,
            key_byte: None,
            last_egress_move_ts: UNIX_EPOCH,
        }
    }
}

/// Receiving ends of a decoder's output queues.
#[derive(Debug)]
pub struct BlockStreams {
    pub ingress: mpsc::Receiver<ProtocolBlock>,
    pub egress: mpsc::Receiver<ProtocolBlock>,
}

/// Turns `Recv`/`Send` messages of one session into protocol blocks.
pub struct ProtocolDecoder {
    session_id: u32,
    registry: Arc<BlockRegistry>,
    messages: mpsc::Receiver<Message>,
    ingress_tx: mpsc::Sender<ProtocolBlock>,
    egress_tx: mpsc::Sender<ProtocolBlock>,
    state: ObfuscationState,
}

impl ProtocolDecoder {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(
        session_id: u32,
        registry: Arc<BlockRegistry>,
        messages: mpsc::Receiver<Message>,
        capacity: usize,
    ) -> (Self, BlockStreams) {
        let (ingress_tx, ingress) = mpsc::channel(capacity);
        let (egress_tx, egress) = mpsc::channel(capacity);
        let decoder = Self {
            session_id,
            registry,
            messages,
            ingress_tx,
            egress_tx,
            state: ObfuscationState::default(),
        };
        (decoder, BlockStreams { ingress, egress })
    }

    pub fn state(&self) -> &ObfuscationState {
        &self.state
    }

    /// Decode one message. Returns the block and its direction when it should
    /// be forwarded.
    pub fn process(&mut self, message: &Message) -> Option<(Direction, ProtocolBlock)> {
        let direction = match message.kind {
            MessageKind::Recv => Direction::Ingress,
            MessageKind::Send => Direction::Egress,
            MessageKind::Debug => {
                debug!(
                    session = self.session_id,
                    text = %String::from_utf8_lossy(&message.data),
                    "agent debug message"
                );
                return None;
            }
            _ => return None,
        };

        let mut block = self.decode_block(message.subchannel, direction, &message.data)?;
        self.correct_obfuscation(&mut block);
        self.should_forward(direction, &block)
            .then_some((direction, block))
    }

    fn decode_block(
        &self,
        subchannel: u32,
        direction: Direction,
        data: &Bytes,
    ) -> Option<ProtocolBlock> {
        if data.len() < MIN_BLOCK_LEN {
            warn!(
                session = self.session_id,
                len = data.len(),
                "Dropping block shorter than {MIN_BLOCK_LEN} bytes"
            );
            return None;
        }

        let mut header = &data[..BLOCK_HEADER_LEN];
        let subject_id = header.get_u32_le();
        let current_id = header.get_u32_le();
        let timestamp_ms = header.get_u64_le();
        header.advance(2);
        let opcode = header.get_u16_le();
        header.advance(2);
        let server_id = header.get_u16_le();

        let Some(timestamp) = UNIX_EPOCH.checked_add(Duration::from_millis(timestamp_ms)) else {
            warn!(session = self.session_id, timestamp_ms, "Dropping block with unrepresentable timestamp");
            return None;
        };

        let raw = data.slice(BLOCK_HEADER_LEN..);
        let body = match self.registry.lookup(subchannel, opcode, direction) {
            Some(decode) => decode(&raw).unwrap_or_else(|err| {
                warn!(
                    session = self.session_id,
                    subchannel,
                    opcode,
                    ?direction,
                    %err,
                    "Failed to unmarshal block body, forwarding raw"
                );
                Body::Raw(raw.clone())
            }),
            None => Body::Raw(raw),
        };

        Some(ProtocolBlock {
            subject_id,
            current_id,
            timestamp,
            server_id,
            opcode,
            body,
        })
    }

    fn correct_obfuscation(&mut self, block: &mut ProtocolBlock) {
        let state = &mut self.state;
        match &mut block.body {
            Body::InitZone(zone) => {
                state.key_byte = None;
                state.zone_uses_obfuscation =
                    OBFUSCATED_TERRITORIES.contains(&zone.territory_type_id);
                if state.zone_uses_obfuscation {
                    debug!(
                        session = self.session_id,
                        territory = zone.territory_type_id,
                        "Entered obfuscated zone"
                    );
                }
            }
            Body::Casting(casting) if state.zone_uses_obfuscation && state.key_byte.is_none() => {
                let key = casting
                    .action_id
                    .wrapping_sub(u32::from(casting.action_id_name)) as u8;
                state.key_byte = Some(key);
                info!(
                    session = self.session_id,
                    key_byte = key,
                    "Detected obfuscation key for current zone"
                );
            }
            Body::Control(control)
                if control.kind == LOCKON_CONTROL_TYPE && state.zone_uses_obfuscation =>
            {
                if let Some(key) = state.key_byte.filter(|&key| key != 0) {
                    control.p1 = control.p1.wrapping_sub(u32::from(key));
                }
            }
            _ => {}
        }
    }

    fn should_forward(&mut self, direction: Direction, block: &ProtocolBlock) -> bool {
        if direction == Direction::Ingress {
            return true;
        }
        if !matches!(
            block.body,
            Body::EgressMovement(_) | Body::EgressInstanceMovement(_)
        ) {
            return true;
        }
        if block.timestamp == self.state.last_egress_move_ts {
            trace!(session = self.session_id, "Dropping duplicate egress movement");
            return false;
        }
        self.state.last_egress_move_ts = block.timestamp;
        true
    }
}

#[async_trait]
impl Service for ProtocolDecoder {
    fn name(&self) -> String {
        "protocol-decoder".to_string()
    }

    async fn serve(&mut self, cancel: CancellationToken) -> ServiceExit {
        info!(session = self.session_id, "Running");
        let exit = loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break ServiceExit::Stopped,
                message = self.messages.recv() => message,
            };
            let Some(message) = message else {
                debug!(session = self.session_id, "message source closed");
                break ServiceExit::Complete;
            };
            let Some((direction, block)) = self.process(&message) else {
                continue;
            };

            let tx = match direction {
                Direction::Ingress => &self.ingress_tx,
                Direction::Egress => &self.egress_tx,
            };
            tokio::select! {
                _ = cancel.cancelled() => break ServiceExit::Stopped,
                sent = tx.send(block) => {
                    if sent.is_err() {
                        trace!(session = self.session_id, ?direction, "no subscriber for block");
                    }
                }
            }
        };
        info!(session = self.session_id, "Stopping...");
        exit
    }
}

impl std::fmt::Debug for ProtocolDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolDecoder")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
