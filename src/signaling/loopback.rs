//! In-process signaling client that plays scripted call outcomes.
//!
//! Used for dry runs of dial lists and for end-to-end tests. Every request
//! is answered with the raw events a real user agent would produce, on the
//! same channel and with the configured ring/talk delays.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    CallOptions, DtmfOptions, Originator, RawEvent, SessionEvent, SessionId, SignalingClient,
    UaConfig,
};
use crate::calling::stats::{RtcStatsReport, StatsSource};

/// How scripted calls behave.
#[derive(Debug, Clone)]
pub struct LoopbackScript {
    /// Time from INVITE to answer (or to failure for unanswered numbers)
    pub ring: Duration,
    /// Time from answer to remote hangup
    pub talk: Duration,
    /// Numbers that never pick up
    pub no_answer: HashSet<String>,
}

impl Default for LoopbackScript {
    fn default() -> Self {
        Self {
            ring: Duration::from_secs(2),
            talk: Duration::from_secs(5),
            no_answer: HashSet::new(),
        }
    }
}

/// Synthetic transport stats: steady 20 ms RTT, one lost packet per hundred.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    samples: AtomicU64,
}

impl StatsSource for LoopbackStats {
    fn get_stats(&self) -> Result<Vec<RtcStatsReport>> {
        let n = self.samples.fetch_add(1, Ordering::Relaxed) + 1;
        let sent = n * 50;
        let lost = (sent / 100) as i64;
        Ok(vec![
            RtcStatsReport::OutboundRtp {
                packets_sent: Some(sent),
            },
            RtcStatsReport::RemoteInboundRtp {
                packets_lost: Some(lost),
                round_trip_time: Some(0.02),
            },
            RtcStatsReport::InboundRtp {
                packets_lost: Some(lost),
            },
            RtcStatsReport::RemoteOutboundRtp {
                packets_sent: Some(sent),
            },
        ])
    }
}

pub struct LoopbackClient {
    events: mpsc::UnboundedSender<RawEvent>,
    script: LoopbackScript,
    local_agent: String,
    ua: Option<UaConfig>,
    connected: bool,
    registered: bool,
    /// Fires `RegistrationExpiring` once the binding lapses
    refresh: Option<JoinHandle<()>>,
    next_session: u64,
    /// Pending scripted outcome per live session
    calls: HashMap<SessionId, JoinHandle<()>>,
}

impl LoopbackClient {
    pub fn new(
        local_agent: impl Into<String>,
        script: LoopbackScript,
        events: mpsc::UnboundedSender<RawEvent>,
    ) -> Self {
        Self {
            events,
            script,
            local_agent: local_agent.into(),
            ua: None,
            connected: false,
            registered: false,
            refresh: None,
            next_session: 0,
            calls: HashMap::new(),
        }
    }

    fn send(&self, event: RawEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Loopback event receiver gone");
        }
    }

    fn session_event(&self, session: &SessionId, event: SessionEvent) {
        self.send(RawEvent::Session {
            session: session.clone(),
            event,
        });
    }

    fn allocate_session(&mut self) -> SessionId {
        self.next_session += 1;
        SessionId(format!("loop-{}", self.next_session))
    }

    /// Simulate a call arriving from `from`. It rings until answered or
    /// terminated.
    pub fn ring_inbound(&mut self, from: &str) -> SessionId {
        let session = self.allocate_session();
        self.send(RawEvent::NewSession {
            session: session.clone(),
            originator: Originator::Remote,
            remote_number: from.to_string(),
            call_id: None,
        });
        self.session_event(&session, SessionEvent::Progress);
        self.calls
            .insert(session.clone(), tokio::spawn(std::future::pending()));
        session
    }

    fn end(&mut self, session: &SessionId, cause: &str) -> Result<()> {
        let Some(handle) = self.calls.remove(session) else {
            bail!("no such session: {}", session);
        };
        handle.abort();
        self.session_event(
            session,
            SessionEvent::Ended {
                cause: cause.to_string(),
            },
        );
        Ok(())
    }

    fn cancel_refresh(&mut self) {
        if let Some(handle) = self.refresh.take() {
            handle.abort();
        }
    }

    fn require_live(&self, session: &SessionId) -> Result<()> {
        if !self.calls.contains_key(session) {
            bail!("no such session: {}", session);
        }
        Ok(())
    }
}

impl SignalingClient for LoopbackClient {
    fn connect(&mut self, config: &UaConfig) -> Result<()> {
        tracing::debug!("Loopback connecting to {} as {}", config.websocket_url, config.uri);
        self.ua = Some(config.clone());
        self.connected = true;
        self.send(RawEvent::Connected);
        Ok(())
    }

    fn stop(&mut self) {
        self.cancel_refresh();
        let live: Vec<SessionId> = self.calls.keys().cloned().collect();
        for session in live {
            let _ = self.end(&session, "Stopped");
        }
        self.connected = false;
        self.registered = false;
    }

    fn register(&mut self) -> Result<()> {
        let Some(ua) = self.ua.as_ref().filter(|_| self.connected) else {
            bail!("transport not connected");
        };
        tracing::debug!(
            "Loopback registering {} (auth {}, expires {}s)",
            self.local_agent,
            ua.authorization_user,
            ua.register_expires
        );
        let expires = Duration::from_secs(u64::from(ua.register_expires));
        self.cancel_refresh();
        if !expires.is_zero() {
            let events = self.events.clone();
            self.refresh = Some(tokio::spawn(async move {
                tokio::time::sleep(expires).await;
                let _ = events.send(RawEvent::RegistrationExpiring);
            }));
        }
        self.registered = true;
        self.send(RawEvent::Registered);
        Ok(())
    }

    fn unregister(&mut self) -> Result<()> {
        self.cancel_refresh();
        self.registered = false;
        self.send(RawEvent::Unregistered);
        Ok(())
    }

    fn call(&mut self, target: &str, options: &CallOptions) -> Result<SessionId> {
        if !self.registered {
            bail!("not registered");
        }
        let session = self.allocate_session();
        tracing::debug!(
            "[{}] Loopback INVITE {} ({} headers)",
            session,
            target,
            options.extra_headers.len()
        );

        self.send(RawEvent::NewSession {
            session: session.clone(),
            originator: Originator::Local,
            remote_number: target.to_string(),
            call_id: None,
        });
        self.session_event(
            &session,
            SessionEvent::PeerConnection(Arc::new(LoopbackStats::default())),
        );
        self.session_event(&session, SessionEvent::Progress);

        let answers = !self.script.no_answer.contains(target);
        let ring = self.script.ring;
        let talk = self.script.talk;
        let events = self.events.clone();
        let sid = session.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ring).await;
            if !answers {
                let _ = events.send(RawEvent::Session {
                    session: sid,
                    event: SessionEvent::Failed {
                        cause: "No Answer".to_string(),
                    },
                });
                return;
            }
            let _ = events.send(RawEvent::Session {
                session: sid.clone(),
                event: SessionEvent::Accepted,
            });
            tokio::time::sleep(talk).await;
            let _ = events.send(RawEvent::Session {
                session: sid,
                event: SessionEvent::Ended {
                    cause: "BYE".to_string(),
                },
            });
        });
        self.calls.insert(session.clone(), handle);
        Ok(session)
    }

    fn answer(&mut self, session: &SessionId, _options: &CallOptions) -> Result<()> {
        self.require_live(session)?;
        let talk = self.script.talk;
        let events = self.events.clone();
        let sid = session.clone();
        self.session_event(session, SessionEvent::Accepted);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(talk).await;
            let _ = events.send(RawEvent::Session {
                session: sid,
                event: SessionEvent::Ended {
                    cause: "BYE".to_string(),
                },
            });
        });
        if let Some(old) = self.calls.insert(session.clone(), handle) {
            old.abort();
        }
        Ok(())
    }

    fn terminate(&mut self, session: &SessionId) -> Result<()> {
        self.end(session, "Terminated")
    }

    fn hold(&mut self, session: &SessionId) -> Result<()> {
        self.require_live(session)?;
        self.session_event(session, SessionEvent::Hold);
        Ok(())
    }

    fn unhold(&mut self, session: &SessionId) -> Result<()> {
        self.require_live(session)?;
        self.session_event(session, SessionEvent::Unhold);
        Ok(())
    }

    fn mute(&mut self, session: &SessionId) -> Result<()> {
        self.require_live(session)
    }

    fn unmute(&mut self, session: &SessionId) -> Result<()> {
        self.require_live(session)
    }

    fn refer(&mut self, session: &SessionId, target: &str) -> Result<()> {
        tracing::debug!("[{}] Loopback REFER to {}", session, target);
        self.end(session, "Transferred")
    }

    fn send_dtmf(&mut self, session: &SessionId, tones: &str, options: &DtmfOptions) -> Result<()> {
        self.require_live(session)?;
        tracing::debug!(
            "[{}] Loopback DTMF {} ({}ms, gap {}ms)",
            session,
            tones,
            options.duration_ms,
            options.inter_tone_gap_ms
        );
        Ok(())
    }

    fn send_message(&mut self, target: &str, content: &str) -> Result<()> {
        if !self.registered {
            bail!("not registered");
        }
        tracing::debug!("Loopback MESSAGE to {}: {} bytes", target, content.len());
        Ok(())
    }

    fn ice_gathering_complete(&mut self, session: &SessionId) {
        tracing::debug!("[{}] Loopback ICE gathering complete", session);
    }
}
