//! Async byte-stream plumbing for a [`PacketTransport`](super::PacketTransport).
//!
//! A stream is split into a reader task (framed decode → mpsc) and a single
//! ordered writer task (mpsc → framed encode). The session task owns the
//! transport state and only exchanges whole [`Packet`]s with these tasks.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::codec::RdxCodec;
use crate::error::RdxError;
use crate::packet::Packet;

/// Packets buffered between the session task and the writer task.
///
/// Kept small so that queued traffic waits in the multiplexer, where channel
/// priorities still apply.
pub const WRITER_DEPTH: usize = 32;

const READER_DEPTH: usize = 256;

pub struct Connection;

impl Connection {
    /// Spawn reader and writer tasks for `stream`.
    pub fn spawn<S>(stream: S, codec: RdxCodec) -> (ConnectionReader, ConnectionWriter)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut framed_read = FramedRead::new(read_half, codec.clone());
        let mut framed_write = FramedWrite::new(write_half, codec);

        // Network -> session
        let (in_tx, in_rx) = mpsc::channel(READER_DEPTH);
        let reader = tokio::spawn(async move {
            while let Some(result) = framed_read.next().await {
                let stop = result.is_err();
                if in_tx.send(result).await.is_err() {
                    break; // session dropped its reader
                }
                if stop {
                    break;
                }
            }
            debug!("connection reader finished");
        });

        // Session -> network
        let (out_tx, mut out_rx) = mpsc::channel::<Packet>(WRITER_DEPTH);
        let writer = tokio::spawn(async move {
            while let Some(packet) = out_rx.recv().await {
                if let Err(e) = framed_write.send(packet).await {
                    warn!("network write error: {e}");
                    break;
                }
            }
            debug!("connection writer finished");
        });

        (
            ConnectionReader { rx: in_rx, task: reader },
            ConnectionWriter { tx: out_tx, task: writer },
        )
    }
}

// ── ConnectionReader ─────────────────────────────────────────────

pub struct ConnectionReader {
    rx: mpsc::Receiver<Result<Packet, RdxError>>,
    task: JoinHandle<()>,
}

impl ConnectionReader {
    /// Next inbound packet. End of stream maps to
    /// [`RdxError::TransportDisconnected`].
    pub async fn recv(&mut self) -> Result<Packet, RdxError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(RdxError::TransportDisconnected),
        }
    }
}

impl Drop for ConnectionReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── ConnectionWriter ─────────────────────────────────────────────

pub struct ConnectionWriter {
    tx: mpsc::Sender<Packet>,
    task: JoinHandle<()>,
}

impl ConnectionWriter {
    /// Hand a packet to the writer without waiting.
    ///
    /// Returns the packet back when the writer queue is full.
    pub fn try_send(&self, packet: Packet) -> Result<(), Option<Packet>> {
        match self.tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(p)) => Err(Some(p)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(None),
        }
    }

    /// Free slots in the writer queue.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Wait until the writer has room again.
    pub async fn ready(&self) -> Result<(), RdxError> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| RdxError::TransportDisconnected)?;
        drop(permit);
        Ok(())
    }

    /// Send a packet, waiting for room.
    pub async fn send(&self, packet: Packet) -> Result<(), RdxError> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| RdxError::TransportDisconnected)
    }

    /// Close the queue and wait for buffered packets to reach the stream.
    pub async fn shutdown(self) {
        let ConnectionWriter { tx, task } = self;
        drop(tx);
        let _ = task.await;
    }
}
