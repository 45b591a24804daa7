//! Signaling client seam, the SIP/WebRTC user agent the softphone drives.
//!
//! The user agent itself (transport, SIP dialogs, SDP, ICE) lives behind the
//! [`SignalingClient`] trait. It reports what happens on the wire as
//! [`RawEvent`]s pushed into a channel supplied at construction.

pub mod loopback;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::calling::stats::StatsSource;

/// Opaque handle for one call session inside the user agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side created a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Originator {
    Local,
    Remote,
}

/// ICE server entry passed through to the peer connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Transport and registration parameters for the user agent.
#[derive(Clone, PartialEq, Eq)]
pub struct UaConfig {
    pub websocket_url: String,
    /// Address-of-record, `sip:ext@domain`
    pub uri: String,
    pub authorization_user: String,
    pub password: String,
    /// Requested registration lifetime in seconds
    pub register_expires: u32,
}

impl fmt::Debug for UaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UaConfig")
            .field("websocket_url", &self.websocket_url)
            .field("uri", &self.uri)
            .field("authorization_user", &self.authorization_user)
            .field("password", &"<redacted>")
            .field("register_expires", &self.register_expires)
            .finish()
    }
}

/// Media and transport options for placing or answering a call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOptions {
    pub audio: bool,
    pub video: bool,
    pub extra_headers: Vec<String>,
    /// Session timer refresh interval in seconds
    pub session_timers_expires: u32,
    pub ice_servers: Vec<IceServer>,
}

/// DTMF tone timing in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfOptions {
    pub duration_ms: u32,
    pub inter_tone_gap_ms: u32,
}

impl Default for DtmfOptions {
    fn default() -> Self {
        Self {
            duration_ms: 160,
            inter_tone_gap_ms: 1200,
        }
    }
}

/// Events on a single call session.
#[derive(Clone)]
pub enum SessionEvent {
    /// Provisional response (ringing / early media)
    Progress,
    Accepted,
    Ended { cause: String },
    Failed { cause: String },
    Hold,
    Unhold,
    /// Peer connection created; the source yields transport statistics
    PeerConnection(Arc<dyn StatsSource>),
    /// A local ICE candidate was gathered (SDP `candidate:` line)
    IceCandidate(String),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Progress => f.write_str("Progress"),
            SessionEvent::Accepted => f.write_str("Accepted"),
            SessionEvent::Ended { cause } => write!(f, "Ended({})", cause),
            SessionEvent::Failed { cause } => write!(f, "Failed({})", cause),
            SessionEvent::Hold => f.write_str("Hold"),
            SessionEvent::Unhold => f.write_str("Unhold"),
            SessionEvent::PeerConnection(_) => f.write_str("PeerConnection"),
            SessionEvent::IceCandidate(c) => write!(f, "IceCandidate({})", c),
        }
    }
}

/// Everything the user agent reports, connection- and session-scoped.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Connected,
    Disconnected,
    Registered,
    Unregistered,
    RegistrationFailed { cause: String },
    /// Fired shortly before the registration expires
    RegistrationExpiring,
    NewSession {
        session: SessionId,
        originator: Originator,
        /// User part of the remote party URI
        remote_number: String,
        /// Call id carried in the `X-JCallId` header, if any
        call_id: Option<String>,
    },
    Session {
        session: SessionId,
        event: SessionEvent,
    },
}

/// Operations the softphone needs from the SIP/WebRTC user agent.
///
/// Calls are synchronous requests; their outcome arrives later as
/// [`RawEvent`]s.
pub trait SignalingClient {
    /// Open the WebSocket transport with the extension's credentials.
    fn connect(&mut self, config: &UaConfig) -> Result<()>;
    /// Stop the user agent and close the transport.
    fn stop(&mut self);
    fn register(&mut self) -> Result<()>;
    /// Unregister all contacts.
    fn unregister(&mut self) -> Result<()>;
    /// Start an outbound call, returning the session handle.
    fn call(&mut self, target: &str, options: &CallOptions) -> Result<SessionId>;
    fn answer(&mut self, session: &SessionId, options: &CallOptions) -> Result<()>;
    fn terminate(&mut self, session: &SessionId) -> Result<()>;
    fn hold(&mut self, session: &SessionId) -> Result<()>;
    fn unhold(&mut self, session: &SessionId) -> Result<()>;
    fn mute(&mut self, session: &SessionId) -> Result<()>;
    fn unmute(&mut self, session: &SessionId) -> Result<()>;
    /// Blind transfer via REFER.
    fn refer(&mut self, session: &SessionId, target: &str) -> Result<()>;
    fn send_dtmf(&mut self, session: &SessionId, tones: &str, options: &DtmfOptions) -> Result<()>;
    /// Send an out-of-dialog `text/plain` MESSAGE.
    fn send_message(&mut self, target: &str, content: &str) -> Result<()>;
    /// Release the offer/answer held back while ICE candidates were gathered.
    fn ice_gathering_complete(&mut self, session: &SessionId);
}
