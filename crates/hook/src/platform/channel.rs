#![forbid(unsafe_code)]

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// A raw duplex byte channel to an agent. Reads and writes may run
/// concurrently from different tasks.
#[async_trait]
pub trait RawChannel: Send + Sync {
    /// Append whatever is available to `buf`. `Ok(0)` means end of stream.
    async fn read(&self, buf: &mut BytesMut) -> std::io::Result<usize>;
    async fn write(&self, data: &[u8]) -> std::io::Result<usize>;
    async fn close(&self) -> std::io::Result<()>;
}

/// Adapts any tokio byte stream into a [`RawChannel`].
pub struct StreamChannel<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<S> RawChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut BytesMut) -> std::io::Result<usize> {
        if buf.capacity() == buf.len() {
            buf.reserve(4096);
        }
        self.reader.lock().await.read_buf(buf).await
    }

    async fn write(&self, data: &[u8]) -> std::io::Result<usize> {
        let mut writer = self.writer.lock().await;
        let written = writer.write(data).await?;
        writer.flush().await?;
        Ok(written)
    }

    async fn close(&self) -> std::io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

impl<S> std::fmt::Debug for StreamChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_and_writes_through_a_duplex() {
        let (local, mut remote) = tokio::io::duplex(64);
        let channel = StreamChannel::new(local);

        assert_eq!(channel.write(b"hello").await.unwrap(), 5);
        let mut received = [0u8; 5];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"hello");

        remote.write_all(b"world").await.unwrap();
        let mut buf = BytesMut::new();
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn remote_drop_reads_as_end_of_stream() {
        let (local, remote) = tokio::io::duplex(64);
        let channel = StreamChannel::new(local);
        drop(remote);

        let mut buf = BytesMut::new();
        assert_eq!(channel.read(&mut buf).await.unwrap(), 0);
    }
}
