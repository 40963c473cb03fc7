//! Viewer-side endpoint.
//!
//! Receives window updates, acknowledges each one (`Ack` for throughput,
//! `DamageSequence` for the window backlog), answers pings and sends
//! encoding overrides. Decoding pixels is left to the caller; see
//! [`decode_builtin`](crate::codecs::decode_builtin) for the built-in
//! encodings.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::codec::RdxCodec;
use crate::error::RdxError;
use crate::message::MessageType;
use crate::packet::{Message, Packet};
use crate::policy::PolicyOverride;
use crate::protocol::{
    self, Ack, DamageSequence, EncodingOverride, Payload, Ping, Pong, WindowUpdate,
};
use crate::transport::{Connection, ConnectionWriter, PacketTransport, TransportConfig};

// ── ViewerConfig ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub transport: TransportConfig,
    /// Interval between latency probes; `None` disables them.
    pub ping_interval: Option<Duration>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            ping_interval: Some(Duration::from_secs(1)),
        }
    }
}

// ── ViewerStats ──────────────────────────────────────────────────

/// Receive statistics exposed to the display layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewerStats {
    pub updates: u64,
    /// Encoded bytes received across all updates.
    pub update_bytes: u64,
    /// Updates whose damage sequence went backwards for their window.
    pub out_of_order: u64,
    pub rtt: Option<Duration>,
}

// ── ViewerSession ────────────────────────────────────────────────

pub struct ViewerSession {
    config: ViewerConfig,
    transport: PacketTransport,
    epoch: Instant,
    last_seq: BTreeMap<u32, u64>,
    next_ping_id: u64,
    pings: VecDeque<(u64, Instant)>,
    stats: ViewerStats,
    stats_tx: watch::Sender<ViewerStats>,
    stats_rx: watch::Receiver<ViewerStats>,
    running: Arc<AtomicBool>,
}

impl ViewerSession {
    pub fn new(config: ViewerConfig) -> Self {
        let (stats_tx, stats_rx) = watch::channel(ViewerStats::default());
        // Nothing on the viewer side consumes send records.
        let transport = PacketTransport::new(TransportConfig {
            record_sent: false,
            ..config.transport.clone()
        });
        Self {
            transport,
            config,
            epoch: Instant::now(),
            last_seq: BTreeMap::new(),
            next_ping_id: 1,
            pings: VecDeque::new(),
            stats: ViewerStats::default(),
            stats_tx,
            stats_rx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> &ViewerStats {
        &self.stats
    }

    /// Latest statistics, updated after every received update.
    pub fn stats_receiver(&self) -> watch::Receiver<ViewerStats> {
        self.stats_rx.clone()
    }

    /// Highest damage sequence received for a window.
    pub fn last_damage_seq(&self, window_id: u32) -> Option<u64> {
        self.last_seq.get(&window_id).copied()
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn timestamp_us(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Apply one message from the server. Returns the update it carried, if
    /// any.
    pub fn on_message(&mut self, message: Message, now: Instant) -> Result<Option<WindowUpdate>, RdxError> {
        match message.message_type {
            MessageType::WindowUpdate => {
                let started = Instant::now();
                let update = match WindowUpdate::from_bytes(&message.payload) {
                    Ok(update) => update,
                    Err(e) => {
                        warn!(message_id = message.message_id, "undecodable window update: {e}");
                        return Ok(None);
                    }
                };
                let decode_time_us = started.elapsed().as_micros().min(u32::MAX as u128) as u32;
                self.on_update(&update, message.message_id, message.payload.len() as u64, decode_time_us, now)?;
                Ok(Some(update))
            }
            MessageType::Ping => {
                let ping = match Ping::from_bytes(&message.payload) {
                    Ok(ping) => ping,
                    Err(e) => {
                        warn!(message_id = message.message_id, "undecodable ping: {e}");
                        return Ok(None);
                    }
                };
                protocol::queue(
                    &mut self.transport,
                    &Pong {
                        id: ping.id,
                        echo_timestamp_us: ping.timestamp_us,
                    },
                    false,
                )?;
                Ok(None)
            }
            MessageType::Pong => {
                let pong = match Pong::from_bytes(&message.payload) {
                    Ok(pong) => pong,
                    Err(e) => {
                        warn!(message_id = message.message_id, "undecodable pong: {e}");
                        return Ok(None);
                    }
                };
                if let Some(i) = self.pings.iter().position(|(id, _)| *id == pong.id) {
                    if let Some((_, sent)) = self.pings.remove(i) {
                        self.stats.rtt = Some(now.saturating_duration_since(sent));
                    }
                }
                Ok(None)
            }
            other => {
                trace!(message_type = ?other, "ignored");
                Ok(None)
            }
        }
    }

    fn on_update(
        &mut self,
        update: &WindowUpdate,
        message_id: u32,
        bytes: u64,
        decode_time_us: u32,
        now: Instant,
    ) -> Result<(), RdxError> {
        let last = self.last_seq.entry(update.window_id).or_insert(0);
        if update.damage_seq < *last {
            warn!(
                window_id = update.window_id,
                damage_seq = update.damage_seq,
                last = *last,
                "window update out of order"
            );
            self.stats.out_of_order += 1;
        } else {
            *last = update.damage_seq;
        }

        let timestamp_us = self.timestamp_us(now);
        protocol::queue(
            &mut self.transport,
            &Ack {
                message_id,
                bytes,
                timestamp_us,
            },
            false,
        )?;
        protocol::queue(
            &mut self.transport,
            &DamageSequence {
                window_id: update.window_id,
                damage_seq: update.damage_seq,
                decode_time_us,
            },
            false,
        )?;

        self.stats.updates += 1;
        self.stats.update_bytes += update.data_len() as u64;
        self.stats_tx.send_replace(self.stats.clone());
        trace!(
            window_id = update.window_id,
            job_id = update.job_id,
            encoding = %update.encoding,
            "update received"
        );
        Ok(())
    }

    /// Feed one received packet.
    pub fn on_packet(&mut self, packet: Packet, now: Instant) -> Result<Option<WindowUpdate>, RdxError> {
        match self.transport.on_packet(packet, now)? {
            Some(message) => self.on_message(message, now),
            None => Ok(None),
        }
    }

    /// Feed raw bytes from the server.
    pub fn on_bytes(&mut self, raw: &[u8], now: Instant) -> Result<Vec<WindowUpdate>, RdxError> {
        let mut updates = Vec::new();
        for message in self.transport.on_bytes(raw, now)? {
            updates.extend(self.on_message(message, now)?);
        }
        Ok(updates)
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Ask the server to change encoding, quality or speed for one window
    /// or, with `None`, for the whole session.
    pub fn request_override(&mut self, window_id: Option<u32>, values: PolicyOverride) -> Result<(), RdxError> {
        debug!(?window_id, ?values, "requesting encoding override");
        protocol::queue(&mut self.transport, &EncodingOverride { window_id, values }, false)?;
        Ok(())
    }

    pub fn send_ping(&mut self, now: Instant) -> Result<(), RdxError> {
        let id = self.next_ping_id;
        self.next_ping_id += 1;
        if self.pings.len() >= 16 {
            self.pings.pop_front();
        }
        self.pings.push_back((id, now));
        let ping = Ping {
            id,
            timestamp_us: self.timestamp_us(now),
        };
        protocol::queue(&mut self.transport, &ping, false)?;
        Ok(())
    }

    pub fn has_outgoing(&self) -> bool {
        self.transport.has_outgoing()
    }

    pub fn poll_packet(&mut self, now: Instant) -> Option<Packet> {
        self.transport.poll_packet(now)
    }

    pub fn drain_to(&mut self, dst: &mut BytesMut, now: Instant) -> Result<usize, RdxError> {
        self.transport.drain_to(dst, now)
    }

    async fn flush(&mut self, writer: &ConnectionWriter) -> Result<(), RdxError> {
        while let Some(packet) = self.transport.poll_packet(Instant::now()) {
            writer.send(packet).await?;
        }
        Ok(())
    }

    // ── Driver ───────────────────────────────────────────────────

    /// Receive updates from `stream` and forward them on `updates` until
    /// the server disconnects, the receiver is dropped, or the stop handle
    /// is cleared.
    ///
    /// `overrides` carries encoding override requests from the display
    /// layer.
    pub async fn run<S>(
        &mut self,
        stream: S,
        updates: mpsc::Sender<WindowUpdate>,
        mut overrides: mpsc::Receiver<(Option<u32>, PolicyOverride)>,
    ) -> Result<(), RdxError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = RdxCodec::new(self.transport.config().max_packet_size);
        let (mut reader, writer) = Connection::spawn(stream, codec);
        self.running.store(true, Ordering::SeqCst);
        let mut overrides_open = true;
        let ping_interval = self.config.ping_interval;
        let mut next_ping = ping_interval.map(|_| Instant::now());

        let outcome = loop {
            if !self.running.load(Ordering::SeqCst) {
                break Ok(());
            }
            let wake = next_ping.unwrap_or_else(|| Instant::now() + Duration::from_secs(1));

            let step = tokio::select! {
                packet = reader.recv() => match packet {
                    Ok(packet) => match self.on_packet(packet, Instant::now()) {
                        Ok(Some(update)) => {
                            if updates.send(update).await.is_err() {
                                debug!("update receiver dropped");
                                self.stop();
                            }
                            Ok(())
                        }
                        Ok(None) => Ok(()),
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                },
                request = overrides.recv(), if overrides_open => match request {
                    Some((window_id, values)) => self.request_override(window_id, values),
                    None => {
                        overrides_open = false;
                        Ok(())
                    }
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => Ok(()),
            };
            if let Err(e) = step {
                break Err(e);
            }

            if let (Some(interval), Some(at)) = (ping_interval, next_ping) {
                let now = Instant::now();
                if now >= at {
                    if let Err(e) = self.send_ping(now) {
                        break Err(e);
                    }
                    next_ping = Some(now + interval);
                }
            }
            if let Err(e) = self.flush(&writer).await {
                break Err(e);
            }
        };

        self.running.store(false, Ordering::SeqCst);
        writer.shutdown().await;
        match &outcome {
            Ok(()) => info!("viewer stopped"),
            Err(RdxError::TransportDisconnected) => info!("server disconnected"),
            Err(e) => warn!("viewer ended: {e}"),
        }
        outcome
    }
}

impl Default for ViewerSession {
    fn default() -> Self {
        Self::new(ViewerConfig::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────
