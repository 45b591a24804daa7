//! ICE candidate classification and the gathering debounce.
//!
//! The user agent holds back its offer/answer until candidate gathering is
//! declared complete. A server-reflexive or relay candidate is good enough to
//! proceed at once; otherwise we wait for late candidates, but give up one
//! second after the last one arrived.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::Instant;

use crate::signaling::SessionId;

/// Quiet period after the last candidate before gathering is forced complete.
pub const GATHERING_QUIET_PERIOD: Duration = Duration::from_millis(1000);

/// ICE candidate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    /// Candidates that already reach beyond the local network.
    pub fn is_public(&self) -> bool {
        matches!(self, CandidateType::ServerReflexive | CandidateType::Relay)
    }
}

/// Extract the candidate type from an SDP `candidate:` line.
pub fn parse_candidate_type(line: &str) -> Result<CandidateType> {
    let line = line.trim();
    let content = if let Some(rest) = line.strip_prefix("a=candidate:") {
        rest
    } else if let Some(rest) = line.strip_prefix("candidate:") {
        rest
    } else {
        bail!("not a candidate line: {}", line);
    };

    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 8 {
        bail!("candidate line too short: {}", line);
    }
    if parts[6] != "typ" {
        bail!("expected 'typ' keyword at position 6, got: {}", parts[6]);
    }

    Ok(match parts[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relay,
        other => bail!("unknown candidate type: {}", other),
    })
}

/// Per-session gathering debounce.
#[derive(Debug, Default)]
pub struct IceDebounce {
    deadlines: HashMap<SessionId, Instant>,
}

impl IceDebounce {
    /// Record a gathered candidate. Returns true if gathering should be
    /// completed right now.
    pub fn on_candidate(&mut self, session: &SessionId, line: &str, now: Instant) -> bool {
        let public = match parse_candidate_type(line) {
            Ok(t) => t.is_public(),
            Err(e) => {
                tracing::debug!("[{}] Unparsed ICE candidate ({:#}), treating as host", session, e);
                false
            }
        };

        if public {
            self.deadlines.remove(session);
            return true;
        }

        self.deadlines
            .insert(session.clone(), now + GATHERING_QUIET_PERIOD);
        false
    }

    /// Sessions whose quiet period has elapsed. They are removed.
    pub fn expired(&mut self, now: Instant) -> Vec<SessionId> {
        let due: Vec<SessionId> = self
            .deadlines
            .iter()
            .filter(|(_, d)| **d <= now)
            .map(|(s, _)| s.clone())
            .collect();
        for s in &due {
            self.deadlines.remove(s);
        }
        due
    }

    pub fn cancel(&mut self, session: &SessionId) {
        self.deadlines.remove(session);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }
}
