//! Configuration for the rdx server.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rdx_core::policy::{EncodingPolicy, VideoScaling};
use rdx_core::session::SessionConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Encoding policy.
    pub encoding: EncodingConfig,
    /// Damage batching.
    pub batching: BatchingConfig,
    /// Quality/speed controller tuning.
    pub controller: ControllerConfig,
    /// Packet transport.
    pub transport: TransportConfig,
    /// Bandwidth estimation and limits.
    pub bandwidth: BandwidthConfig,
    /// Synthetic capture source.
    pub test_pattern: TestPatternConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to accept viewers on, `host:port`.
    pub listen: String,
    /// Maximum concurrent viewers.
    pub max_viewers: u32,
}

/// The recognised encoding options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Enabled encodings, most preferred first.
    pub encodings: Vec<String>,
    /// Target quality, 0 = auto.
    pub quality: u8,
    pub min_quality: u8,
    /// Ceiling for auto quality.
    pub max_quality: u8,
    /// Target speed, 0 = auto.
    pub speed: u8,
    pub min_speed: u8,
    /// "off", "auto" or a ratio such as "1/2".
    pub video_scaling: String,
    /// Video encoders allowed; empty allows all.
    pub video_encoders: Vec<String>,
    /// Colourspace conversion backends.
    pub csc_modules: Vec<String>,
    /// Encodes running at once per viewer.
    pub workers: usize,
}

/// Damage batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Share of the smoothed RTT added to the minimum delay.
    pub rtt_delay_fraction: f64,
    /// Merge two regions when their bounding box is at most this times
    /// their summed area.
    pub merge_overhead: f64,
    pub max_regions: usize,
    /// Pending area ratio that turns a batch into a full-window refresh.
    pub full_refresh_ratio: f64,
    /// Encode jobs in flight per window, 1 or 2.
    pub max_in_flight: usize,
    pub job_timeout_ms: u64,
}

/// Quality/speed controller tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Below this many Mbit/s auto quality aims at the minimum.
    pub low_bandwidth_mbps: f64,
    /// At or above this auto quality aims at the maximum.
    pub high_bandwidth_mbps: f64,
    pub base_speed: u8,
    pub backlog_speed_step: u8,
    pub backlog_threshold: usize,
    pub backlog_persist: u32,
    pub switch_hysteresis: u32,
    pub cost_tiebreak_speed: u8,
}

/// Packet transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub chunk_size: usize,
    pub max_packet_size: usize,
    pub max_message_size: usize,
    pub reassembly_timeout_ms: u64,
    pub max_pending_messages: usize,
}

/// Bandwidth estimation and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Hard limit in Mbit/s, 0 = unlimited.
    pub limit_mbps: u32,
    pub max_samples: usize,
    /// Smoothed RTT above baseline times this counts as congestion.
    pub congestion_rtt_factor: f64,
    /// Largest drop of the estimate per sample.
    pub max_decay: f64,
    pub ping_interval_ms: u64,
}

/// Synthetic capture source: moving boxes in a few windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestPatternConfig {
    pub windows: u32,
    pub width: u32,
    pub height: u32,
    /// Animation steps per second.
    pub fps: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7400".into(),
            max_viewers: 4,
        }
    }
}

impl Default for EncodingConfig {
    fn default() -> Self {
        let policy = EncodingPolicy::default();
        Self {
            encodings: policy.encodings,
            quality: policy.quality,
            min_quality: policy.min_quality,
            max_quality: policy.max_quality,
            speed: policy.speed,
            min_speed: policy.min_speed,
            video_scaling: policy.video_scaling.to_string(),
            video_encoders: policy.video_encoders,
            csc_modules: policy.csc_modules,
            workers: 4,
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        let d = rdx_core::AggregatorConfig::default();
        Self {
            min_delay_ms: d.min_delay.as_millis() as u64,
            max_delay_ms: d.max_delay.as_millis() as u64,
            rtt_delay_fraction: d.rtt_delay_fraction,
            merge_overhead: d.merge_overhead,
            max_regions: d.max_regions,
            full_refresh_ratio: d.full_refresh_ratio,
            max_in_flight: d.max_in_flight,
            job_timeout_ms: d.job_timeout.as_millis() as u64,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let d = rdx_core::ControllerConfig::default();
        Self {
            low_bandwidth_mbps: d.low_bandwidth as f64 * 8.0 / 1_000_000.0,
            high_bandwidth_mbps: d.high_bandwidth as f64 * 8.0 / 1_000_000.0,
            base_speed: d.base_speed,
            backlog_speed_step: d.backlog_speed_step,
            backlog_threshold: d.backlog_threshold,
            backlog_persist: d.backlog_persist,
            switch_hysteresis: d.switch_hysteresis,
            cost_tiebreak_speed: d.cost_tiebreak_speed,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        let d = rdx_core::TransportConfig::default();
        Self {
            chunk_size: d.chunk_size,
            max_packet_size: d.max_packet_size,
            max_message_size: d.max_message_size,
            reassembly_timeout_ms: d.reassembly_timeout.as_millis() as u64,
            max_pending_messages: d.max_pending_messages,
        }
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        let d = rdx_core::EstimatorConfig::default();
        Self {
            limit_mbps: 0,
            max_samples: d.max_samples,
            congestion_rtt_factor: d.congestion_rtt_factor,
            max_decay: d.max_decay,
            ping_interval_ms: 1000,
        }
    }
}

impl Default for TestPatternConfig {
    fn default() -> Self {
        Self {
            windows: 2,
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Encoding policy described by the `encoding` and `bandwidth` sections.
    pub fn to_policy(&self) -> EncodingPolicy {
        let enc = &self.encoding;
        let video_scaling = enc.video_scaling.parse::<VideoScaling>().unwrap_or_else(|e| {
            tracing::warn!("video_scaling {:?}: {e}; using auto", enc.video_scaling);
            VideoScaling::Auto
        });
        let bandwidth_limit = match self.bandwidth.limit_mbps {
            0 => None,
            mbps => Some(mbps as u64 * 1_000_000 / 8),
        };
        EncodingPolicy {
            encodings: enc.encodings.clone(),
            quality: enc.quality,
            min_quality: enc.min_quality,
            max_quality: enc.max_quality,
            speed: enc.speed,
            min_speed: enc.min_speed,
            video_scaling,
            video_encoders: enc.video_encoders.clone(),
            csc_modules: enc.csc_modules.clone(),
            bandwidth_limit,
        }
        .normalized()
    }

    /// Session tunables, clamped into workable ranges.
    pub fn to_session_config(&self) -> SessionConfig {
        let b = &self.batching;
        let c = &self.controller;
        let t = &self.transport;
        let bw = &self.bandwidth;
        let mbps_to_bytes = |mbps: f64| (mbps.max(0.0) * 1_000_000.0 / 8.0) as u64;

        let max_packet_size = t.max_packet_size.max(1024);
        let min_delay = Duration::from_millis(b.min_delay_ms);
        let low_bandwidth = mbps_to_bytes(c.low_bandwidth_mbps);

        SessionConfig {
            aggregator: rdx_core::AggregatorConfig {
                merge_overhead: b.merge_overhead.max(1.0),
                max_regions: b.max_regions.max(1),
                min_delay,
                max_delay: Duration::from_millis(b.max_delay_ms).max(min_delay),
                rtt_delay_fraction: b.rtt_delay_fraction.clamp(0.0, 4.0),
                full_refresh_ratio: b.full_refresh_ratio.clamp(0.1, 1.0),
                max_in_flight: b.max_in_flight.clamp(1, 2),
                job_timeout: Duration::from_millis(b.job_timeout_ms.max(100)),
            },
            controller: rdx_core::ControllerConfig {
                low_bandwidth,
                high_bandwidth: mbps_to_bytes(c.high_bandwidth_mbps).max(low_bandwidth + 1),
                base_speed: c.base_speed.clamp(1, 100),
                backlog_speed_step: c.backlog_speed_step.min(100),
                backlog_threshold: c.backlog_threshold.max(1),
                backlog_persist: c.backlog_persist,
                switch_hysteresis: c.switch_hysteresis,
                cost_tiebreak_speed: c.cost_tiebreak_speed.min(100),
            },
            estimator: rdx_core::EstimatorConfig {
                max_samples: bw.max_samples.max(2),
                congestion_rtt_factor: bw.congestion_rtt_factor.max(1.0),
                max_decay: bw.max_decay.clamp(0.0, 1.0),
                ..rdx_core::EstimatorConfig::default()
            },
            transport: rdx_core::TransportConfig {
                chunk_size: t.chunk_size.clamp(1024, max_packet_size),
                max_packet_size,
                max_message_size: t.max_message_size.max(max_packet_size),
                reassembly_timeout: Duration::from_millis(t.reassembly_timeout_ms.max(100)),
                max_pending_messages: t.max_pending_messages.max(1),
                ..rdx_core::TransportConfig::default()
            },
            encode_workers: self.encoding.workers.clamp(1, 64),
            ping_interval: Duration::from_millis(bw.ping_interval_ms.max(50)),
            ..SessionConfig::default()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
