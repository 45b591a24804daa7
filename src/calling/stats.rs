//! Network quality sampling for the active call.
//!
//! Once per second the sampler pulls the peer connection's RTP statistics,
//! keeps the latest packet/loss counters, and derives uplink/downlink loss
//! ratios and round-trip time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

use super::{LatencyStat, Ticker};

/// Sampling cadence.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// One entry of a WebRTC stats snapshot, reduced to what we read.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcStatsReport {
    /// What we sent (uplink)
    OutboundRtp { packets_sent: Option<u64> },
    /// The far end's view of what we sent (uplink loss + RTT)
    RemoteInboundRtp {
        packets_lost: Option<i64>,
        /// Seconds
        round_trip_time: Option<f64>,
    },
    /// What we received (downlink loss)
    InboundRtp { packets_lost: Option<i64> },
    /// The far end's view of what it sent (downlink)
    RemoteOutboundRtp { packets_sent: Option<u64> },
    Other,
}

/// Source of transport statistics for one peer connection.
pub trait StatsSource: Send + Sync {
    fn get_stats(&self) -> Result<Vec<RtcStatsReport>>;
}

/// Latest counters seen for the active media session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStatReport {
    pub inbound_packets_sent: Option<u64>,
    pub inbound_lost: Option<i64>,
    pub outbound_packets_sent: Option<u64>,
    pub outbound_lost: Option<i64>,
    pub round_trip_time_ms: Option<u64>,
}

impl NetworkStatReport {
    /// Fold one stats snapshot into the report.
    pub fn update(&mut self, reports: &[RtcStatsReport]) {
        for report in reports {
            match *report {
                RtcStatsReport::OutboundRtp { packets_sent } => {
                    self.outbound_packets_sent = packets_sent;
                }
                RtcStatsReport::RemoteInboundRtp {
                    packets_lost,
                    round_trip_time,
                } => {
                    self.outbound_lost = packets_lost;
                    // Only remote-inbound reports carry RTT
                    self.round_trip_time_ms =
                        round_trip_time.map(|secs| (secs * 1000.0).floor().max(0.0) as u64);
                }
                RtcStatsReport::InboundRtp { packets_lost } => {
                    self.inbound_lost = packets_lost;
                }
                RtcStatsReport::RemoteOutboundRtp { packets_sent } => {
                    self.inbound_packets_sent = packets_sent;
                }
                RtcStatsReport::Other => {}
            }
        }
    }

    pub fn inbound_loss_rate(&self) -> f64 {
        loss_rate(self.inbound_lost, self.inbound_packets_sent)
    }

    pub fn outbound_loss_rate(&self) -> f64 {
        loss_rate(self.outbound_lost, self.outbound_packets_sent)
    }

    pub fn to_latency_stat(&self) -> LatencyStat {
        LatencyStat {
            latency_ms: self.round_trip_time_ms.unwrap_or(0),
            up_loss_rate: self.outbound_loss_rate(),
            down_loss_rate: self.inbound_loss_rate(),
        }
    }
}

/// `lost / sent`, or 0 when either side is missing or `sent` is zero.
pub fn loss_rate(lost: Option<i64>, sent: Option<u64>) -> f64 {
    match (lost, sent) {
        (Some(lost), Some(sent)) if sent > 0 && lost > 0 => lost as f64 / sent as f64,
        _ => 0.0,
    }
}

/// Samples one media session. Dropping it stops sampling and discards the
/// accumulated counters.
pub struct NetworkQualitySampler {
    source: Arc<dyn StatsSource>,
    report: NetworkStatReport,
    ticker: Ticker,
}

impl NetworkQualitySampler {
    pub fn start(source: Arc<dyn StatsSource>) -> Self {
        Self {
            source,
            report: NetworkStatReport::default(),
            ticker: Ticker::start(SAMPLE_INTERVAL),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.ticker.deadline()
    }

    pub fn report(&self) -> &NetworkStatReport {
        &self.report
    }

    /// Take a sample if the interval has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<LatencyStat> {
        if !self.ticker.poll(now) {
            return None;
        }
        self.sample()
    }

    /// Pull stats now. A failed `get_stats` skips this sample.
    pub fn sample(&mut self) -> Option<LatencyStat> {
        match self.source.get_stats() {
            Ok(reports) => {
                self.report.update(&reports);
                let stat = self.report.to_latency_stat();
                tracing::debug!(
                    "Loss up/down: {:.2}% / {:.2}%, rtt: {}ms",
                    stat.up_loss_rate * 100.0,
                    stat.down_loss_rate * 100.0,
                    stat.latency_ms
                );
                Some(stat)
            }
            Err(e) => {
                tracing::warn!("Failed to read transport stats: {:#}", e);
                None
            }
        }
    }
}
