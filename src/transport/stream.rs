//! Byte-stream transport.
//!
//! Any `AsyncRead`/`AsyncWrite` pair becomes a [`Transport`]. A pump task
//! drains the read side into a channel so [`Transport::data_available`] can
//! answer without blocking, the way `in_waiting` does on a UART.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Transport, TransportFuture};
use crate::error::{CandyError, Result};
use crate::protocol::{PORT_PROBE, TOKEN_LEN};

/// Chunks buffered between the pump and the transport.
const PUMP_DEPTH: usize = 64;

/// Stream transport options.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Deadline for one read
    pub read_timeout: Duration,
    /// Exchange the `"correct port"` probe before the handshake
    pub probe: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            probe: false,
        }
    }
}

impl StreamOptions {
    /// Set read deadline.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Enable or disable the port probe.
    pub fn with_probe(mut self, probe: bool) -> Self {
        self.probe = probe;
        self
    }
}

/// Transport over an async byte stream.
pub struct StreamTransport<W> {
    name: &'static str,
    writer: Option<W>,
    inbound: mpsc::Receiver<Bytes>,
    pending: BytesMut,
    pump: Option<JoinHandle<()>>,
    options: StreamOptions,
    /// The probe already succeeded on this link
    probed: bool,
}

/// In-memory transport half.
pub type MemoryTransport = StreamTransport<WriteHalf<DuplexStream>>;

/// Two connected in-memory transports.
pub fn memory_pair(options: StreamOptions) -> (MemoryTransport, MemoryTransport) {
    let (a, b) = tokio::io::duplex(1024);
    (
        StreamTransport::new("memory", a, options),
        StreamTransport::new("memory", b, options),
    )
}

impl<W> StreamTransport<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Build from separate read and write sides.
    ///
    /// Spawns the read pump, so this must run inside a tokio runtime.
    pub fn from_parts<R>(name: &'static str, reader: R, writer: W, options: StreamOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, inbound) = mpsc::channel(PUMP_DEPTH);
        let pump = tokio::spawn(pump(name, reader, tx));
        Self {
            name,
            writer: Some(writer),
            inbound,
            pending: BytesMut::new(),
            pump: Some(pump),
            options,
            probed: false,
        }
    }

    /// Bytes received but not yet consumed.
    pub fn pending_len(&mut self) -> usize {
        self.fill_pending();
        self.pending.len()
    }

    fn fill_pending(&mut self) {
        while let Ok(chunk) = self.inbound.try_recv() {
            self.pending.extend_from_slice(&chunk);
        }
    }

    /// Wait for at least `n` pending bytes, up to `deadline` if given.
    async fn fill_to(&mut self, n: usize, deadline: Option<Instant>) -> Result<()> {
        self.fill_pending();
        while self.pending.len() < n {
            let chunk = match deadline {
                Some(at) => tokio::time::timeout_at(at, self.inbound.recv())
                    .await
                    .map_err(|_| {
                        CandyError::Timeout(format!("{}: waiting for {n} bytes", self.name))
                    })?,
                None => self.inbound.recv().await,
            };
            match chunk {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => {
                    return Err(CandyError::Transport(format!(
                        "{}: stream closed by peer",
                        self.name
                    )))
                },
            }
        }
        Ok(())
    }

    async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        let deadline = Instant::now() + self.options.read_timeout;
        self.fill_to(n, Some(deadline)).await?;
        Ok(self.pending.split_to(n).freeze())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.writer.is_none() {
            return Err(CandyError::Transport(format!("{}: transport closed", self.name)));
        }
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CandyError::Transport(format!("{}: transport closed", self.name)))?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Host half of the port probe: send the literal, expect it echoed.
    async fn probe_port(&mut self) -> Result<()> {
        self.write_all(PORT_PROBE).await?;
        let echo = self.read_exact(PORT_PROBE.len()).await.map_err(|e| {
            CandyError::PortNotFound(format!("{}: no probe echo ({e})", self.name))
        })?;
        if echo.as_ref() != PORT_PROBE {
            return Err(CandyError::PortNotFound(format!(
                "{}: unexpected probe reply {:?}",
                self.name,
                String::from_utf8_lossy(&echo)
            )));
        }
        self.probed = true;
        Ok(())
    }

    /// Client half of the port probe: wait for the literal, echo it back.
    async fn answer_probe(&mut self) -> Result<()> {
        let len = PORT_PROBE.len();
        loop {
            self.fill_to(len, None).await?;
            let found = self.pending.windows(len).position(|w| w == PORT_PROBE);
            if let Some(pos) = found {
                let _ = self.pending.split_to(pos + len);
                break;
            }
            // Keep a possible partial match at the tail.
            let excess = self.pending.len() - (len - 1);
            let _ = self.pending.split_to(excess);
        }
        self.write_all(PORT_PROBE).await?;
        self.probed = true;
        tracing::info!(transport = self.name, "Port probe answered");
        Ok(())
    }
}

impl<S> StreamTransport<WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Build from one bidirectional stream.
    pub fn new(name: &'static str, stream: S, options: StreamOptions) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(name, reader, writer, options)
    }
}

async fn pump<R>(name: &'static str, mut reader: R, tx: mpsc::Sender<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(256);
    loop {
        buf.reserve(64);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::debug!(transport = name, "Stream reached EOF");
                break;
            },
            Ok(_) => {
                if tx.send(buf.split().freeze()).await.is_err() {
                    break;
                }
            },
            Err(e) => {
                tracing::warn!(transport = name, error = %e, "Stream read failed");
                break;
            },
        }
    }
}

impl<W> Transport for StreamTransport<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn open(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if self.options.probe && !self.probed {
                self.probe_port().await?;
            }
            self.fill_pending();
            let stale = self.pending.len();
            self.pending.clear();
            if stale > 0 {
                tracing::debug!(transport = self.name, stale, "Discarded stale input");
            }
            Ok(())
        })
    }

    fn accept_peer(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if self.options.probe && !self.probed {
                self.answer_probe().await?;
            }
            Ok(())
        })
    }

    fn data_available(&mut self) -> bool {
        self.fill_pending();
        self.pending.len() >= TOKEN_LEN
    }

    fn read_token(&mut self) -> TransportFuture<'_, [u8; TOKEN_LEN]> {
        Box::pin(async move {
            let bytes = self.read_exact(TOKEN_LEN).await?;
            let mut out = [0u8; TOKEN_LEN];
            out.copy_from_slice(&bytes);
            Ok(out)
        })
    }

    fn write<'a>(&'a mut self, bytes: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(self.write_all(bytes))
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if let Some(pump) = self.pump.take() {
                pump.abort();
            }
            if let Some(mut writer) = self.writer.take() {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!(transport = self.name, error = %e, "Shutdown failed");
                }
            }
            self.pending.clear();
            Ok(())
        })
    }
}

impl<W> Drop for StreamTransport<W> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> StreamOptions {
        StreamOptions::default().with_read_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_token_exchange() {
        let (mut a, mut b) = memory_pair(fast());
        a.write(b"~ES").await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(&b.read_token().await.unwrap(), b"~ES");
        assert!(!b.data_available());
    }

    #[tokio::test]
    async fn test_data_available_needs_whole_token() {
        let (mut a, mut b) = memory_pair(fast());
        a.write(b"~I").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!b.data_available());

        a.write(b"D").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(b.data_available());
        assert_eq!(&b.read_token().await.unwrap(), b"~ID");
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let (_a, mut b) = memory_pair(fast());
        let err = b.read_token().await.unwrap_err();
        assert!(matches!(err, CandyError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_read_after_peer_close() {
        let (mut a, mut b) = memory_pair(fast());
        a.close().await.unwrap();
        drop(a);
        let err = b.read_token().await.unwrap_err();
        assert!(matches!(err, CandyError::Transport(_)));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (mut a, _b) = memory_pair(fast());
        a.close().await.unwrap();
        assert!(a.write(b"~RS").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_transport_cannot_reopen() {
        let (mut a, mut b) = memory_pair(fast());
        a.close().await.unwrap();
        b.close().await.unwrap();
        assert!(matches!(a.open().await, Err(CandyError::Transport(_))));
        assert!(matches!(b.accept_peer().await, Err(CandyError::Transport(_))));
    }

    #[tokio::test]
    async fn test_port_probe_handshake() {
        let (mut host, mut client) = memory_pair(fast().with_probe(true));
        let answer = tokio::spawn(async move {
            client.accept_peer().await.unwrap();
            client
        });

        host.open().await.unwrap();
        let mut client = answer.await.unwrap();

        // A second open does not probe again.
        host.open().await.unwrap();
        host.write(b"~ES").await.unwrap();
        assert_eq!(&client.read_token().await.unwrap(), b"~ES");
    }

    #[tokio::test]
    async fn test_probe_skips_leading_noise() {
        let (mut host, mut client) = memory_pair(fast().with_probe(true));
        host.write(b"xyzcorrect").await.unwrap();
        host.write(b" port").await.unwrap();

        client.accept_peer().await.unwrap();
        let echo = host.read_exact(PORT_PROBE.len()).await.unwrap();
        assert_eq!(echo.as_ref(), PORT_PROBE);
    }

    #[tokio::test]
    async fn test_probe_without_echo_fails() {
        let (mut host, _client) = memory_pair(fast().with_probe(true));
        let err = host.open().await.unwrap_err();
        assert!(matches!(err, CandyError::PortNotFound(_)));
    }

    #[tokio::test]
    async fn test_open_discards_stale_input() {
        let (mut a, mut b) = memory_pair(fast());
        a.write(b"junk").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        b.open().await.unwrap();
        assert_eq!(b.pending_len(), 0);
    }
}
