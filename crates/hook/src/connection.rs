#![forbid(unsafe_code)]

use crate::platform::{RawChannel, RemoteProcessProvider};
use crate::wire::{self, Message};
use bytes::BytesMut;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Whether `err` is the end-of-stream signal produced by [`ChannelConnection`].
pub fn is_end_of_stream(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::UnexpectedEof
}

fn end_of_stream() -> std::io::Error {
    std::io::Error::new(ErrorKind::UnexpectedEof, "channel closed by remote")
}

/// A channel to one injected agent.
///
/// Every way the remote side can go away surfaces as a single end-of-stream
/// error (see [`is_end_of_stream`]). Closing is idempotent.
pub struct ChannelConnection {
    inner: Box<dyn RawChannel>,
    remote: Arc<dyn RemoteProcessProvider>,
    is_owner: bool,
    closed: AtomicBool,
}

impl ChannelConnection {
    /// `is_owner` marks a connection to an agent this process injected. An
    /// owner tells the agent to unload before closing.
    pub fn new(
        inner: Box<dyn RawChannel>,
        remote: Arc<dyn RemoteProcessProvider>,
        is_owner: bool,
    ) -> Self {
        Self {
            inner,
            remote,
            is_owner,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn read(&self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self.inner.read(buf).await {
            Ok(0) => Err(end_of_stream()),
            Ok(n) => Ok(n),
            Err(err) => Err(self.normalize(err)),
        }
    }

    pub async fn write(&self, data: &[u8]) -> std::io::Result<usize> {
        self.inner.write(data).await.map_err(|err| self.normalize(err))
    }

    /// Close the channel. Only the first call reaches the underlying channel;
    /// later or concurrent calls return `Ok(())` immediately.
    pub async fn close(&self) -> std::io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.is_owner {
            // The agent unloads itself once its owner says goodbye.
            match wire::encode(&Message::exit()) {
                Ok(frame) => {
                    if let Err(err) = self.inner.write(&frame).await {
                        debug!(?err, "failed to send exit before closing");
                    }
                }
                Err(err) => debug!(%err, "failed to encode exit"),
            }
        }
        self.inner.close().await
    }

    fn normalize(&self, err: std::io::Error) -> std::io::Error {
        if self.remote.is_remote_closed(&err) {
            end_of_stream()
        } else {
            err
        }
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("is_owner", &self.is_owner)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::platform::InjectError;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Treats `BrokenPipe` as the remote going away.
    pub(crate) struct PipeSemantics;

    #[async_trait]
    impl RemoteProcessProvider for PipeSemantics {
        async fn inject_payload(&self, _pid: u32, _path: &Path) -> Result<(), InjectError> {
            Ok(())
        }

        async fn open_channel(
            &self,
            _name: &str,
            _timeout: Duration,
        ) -> std::io::Result<Box<dyn RawChannel>> {
            Err(ErrorKind::NotFound.into())
        }

        fn is_remote_closed(&self, err: &std::io::Error) -> bool {
            err.kind() == ErrorKind::BrokenPipe
        }
    }

    #[derive(Default)]
    struct ScriptedChannel {
        reads: Mutex<Vec<std::io::Result<Vec<u8>>>>,
        writes: Mutex<Vec<Vec<u8>>>,
        write_error: Option<ErrorKind>,
        closes: AtomicU32,
    }

    #[async_trait]
    impl RawChannel for Arc<ScriptedChannel> {
        async fn read(&self, buf: &mut BytesMut) -> std::io::Result<usize> {
            let next = self.reads.lock().unwrap().pop();
            match next {
                Some(Ok(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(err)) => Err(err),
                None => Ok(0),
            }
        }

        async fn write(&self, data: &[u8]) -> std::io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        async fn close(&self) -> std::io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn connection(channel: &Arc<ScriptedChannel>, is_owner: bool) -> ChannelConnection {
        ChannelConnection::new(Box::new(channel.clone()), Arc::new(PipeSemantics), is_owner)
    }

    #[tokio::test]
    async fn close_reaches_the_channel_once() {
        let channel = Arc::new(ScriptedChannel::default());
        let conn = connection(&channel, false);

        for _ in 0..3 {
            conn.close().await.unwrap();
        }
        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
        assert!(channel.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_close_reaches_the_channel_once() {
        let channel = Arc::new(ScriptedChannel::default());
        let conn = Arc::new(connection(&channel, false));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.close().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn owner_sends_exit_before_closing() {
        let channel = Arc::new(ScriptedChannel::default());
        let conn = connection(&channel, true);

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        let writes = channel.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], vec![9, 0, 0, 0, 2, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn remote_closed_errors_become_end_of_stream() {
        let channel = Arc::new(ScriptedChannel {
            reads: Mutex::new(vec![
                Err(ErrorKind::BrokenPipe.into()),
                Err(ErrorKind::InvalidData.into()),
            ]),
            write_error: Some(ErrorKind::BrokenPipe),
            ..Default::default()
        });
        let conn = connection(&channel, false);
        let mut buf = BytesMut::new();

        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(!is_end_of_stream(&err));

        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(is_end_of_stream(&err));

        let err = conn.write(b"data").await.unwrap_err();
        assert!(is_end_of_stream(&err));
    }

    #[tokio::test]
    async fn zero_length_read_is_end_of_stream() {
        let channel = Arc::new(ScriptedChannel::default());
        let conn = connection(&channel, false);
        let mut buf = BytesMut::new();

        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(is_end_of_stream(&err));
    }
}
