//! Call state module: normalize user-agent events and drive call control.
//!
//! This handles signaling state only (no media streaming).

pub mod ice;
pub mod normalizer;
pub mod softphone;
pub mod stats;

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Call direction from the local agent's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Identity of a ringing or active call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallInfo {
    pub direction: CallDirection,
    pub remote_number: String,
    pub call_id: Option<String>,
}

/// Network quality sample for the active call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStat {
    /// Round-trip time in milliseconds
    pub latency_ms: u64,
    /// Outbound (uplink) loss ratio, 0.0..=1.0
    pub up_loss_rate: f64,
    /// Inbound (downlink) loss ratio, 0.0..=1.0
    pub down_loss_rate: f64,
}

/// Normalized softphone events. This set is closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CtiEvent {
    Connected,
    Disconnected,
    Registered { local_agent: String },
    Unregistered { local_agent: String },
    RegisterFailed { msg: String },
    IncomingCall(CallInfo),
    OutgoingCall(CallInfo),
    /// Answered, or resumed from hold
    InCall { call: Option<CallInfo> },
    Hold,
    CallEnd { call: Option<CallInfo> },
    Mute,
    Unmute,
    MicError { msg: String },
    Error { msg: String },
    LatencyStat(LatencyStat),
}

impl CtiEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CtiEvent::Connected => "CONNECTED",
            CtiEvent::Disconnected => "DISCONNECTED",
            CtiEvent::Registered { .. } => "REGISTERED",
            CtiEvent::Unregistered { .. } => "UNREGISTERED",
            CtiEvent::RegisterFailed { .. } => "REGISTER_FAILED",
            CtiEvent::IncomingCall(_) => "INCOMING_CALL",
            CtiEvent::OutgoingCall(_) => "OUTGOING_CALL",
            CtiEvent::InCall { .. } => "IN_CALL",
            CtiEvent::Hold => "HOLD",
            CtiEvent::CallEnd { .. } => "CALL_END",
            CtiEvent::Mute => "MUTE",
            CtiEvent::Unmute => "UNMUTE",
            CtiEvent::MicError { .. } => "MIC_ERROR",
            CtiEvent::Error { .. } => "ERROR",
            CtiEvent::LatencyStat(_) => "LATENCY_STAT",
        }
    }

    pub(crate) fn error(msg: impl Into<String>) -> Self {
        CtiEvent::Error { msg: msg.into() }
    }
}

/// Lifecycle phase of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Created, no answer yet (ringing either way)
    Ringing,
    Connected,
    OnHold,
}

/// Periodic deadline owned by whichever component is running it.
///
/// Dropping the ticker cancels it; the event loop only ever sleeps until
/// deadlines of tickers that still exist.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    /// Start a ticker whose first deadline is one period from now.
    pub fn start(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// Returns true once per elapsed period. Missed periods are skipped
    /// rather than replayed.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        while self.next <= now {
            self.next += self.period;
        }
        true
    }
}

/// Earliest of a set of optional deadlines.
pub fn earliest(deadlines: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}
