//! Maps raw user-agent events onto the closed [`CtiEvent`] vocabulary.
//!
//! The normalizer tracks connection/registration flags and a context per
//! call session. Exactly one session is "current"; only the current session
//! is reported. Side effects on the user agent (re-register, stop, release
//! ICE gathering) are returned as [`Effect`]s for the owner to apply.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::ice::IceDebounce;
use super::stats::NetworkQualitySampler;
use super::{earliest, CallDirection, CallInfo, CallState, CtiEvent};
use crate::signaling::{Originator, RawEvent, SessionEvent, SessionId};

/// Action the owner must perform on the user agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Register,
    Stop,
    IceReady(SessionId),
}

/// Per-call data, alive from session creation until it ends or fails.
pub struct CallSessionContext {
    pub info: CallInfo,
    pub state: CallState,
    /// Progress already reported
    announced: bool,
    /// Present once the peer connection exists
    sampler: Option<NetworkQualitySampler>,
    /// Placed through `track_outbound`; its end is always reported
    tracked: bool,
}

impl CallSessionContext {
    fn new(info: CallInfo) -> Self {
        Self {
            info,
            state: CallState::Ringing,
            announced: false,
            sampler: None,
            tracked: false,
        }
    }

    /// Media is flowing (answered, possibly on hold).
    pub fn is_established(&self) -> bool {
        matches!(self.state, CallState::Connected | CallState::OnHold)
    }

    pub fn has_media(&self) -> bool {
        self.sampler.is_some()
    }
}

pub struct CallEventNormalizer {
    local_agent: String,
    auto_register: bool,
    events: mpsc::UnboundedSender<CtiEvent>,
    connected: bool,
    registered: bool,
    sessions: HashMap<SessionId, CallSessionContext>,
    current: Option<SessionId>,
    ice: IceDebounce,
}

impl CallEventNormalizer {
    pub fn new(
        local_agent: impl Into<String>,
        auto_register: bool,
        events: mpsc::UnboundedSender<CtiEvent>,
    ) -> Self {
        Self {
            local_agent: local_agent.into(),
            auto_register,
            events,
            connected: false,
            registered: false,
            sessions: HashMap::new(),
            current: None,
            ice: IceDebounce::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn current_session(&self) -> Option<(&SessionId, &CallSessionContext)> {
        let id = self.current.as_ref()?;
        self.sessions.get(id).map(|ctx| (id, ctx))
    }

    /// Adopt a session we just placed as the current one.
    pub fn track_outbound(&mut self, session: SessionId, remote_number: &str, call_id: &str) {
        let info = CallInfo {
            direction: CallDirection::Outbound,
            remote_number: remote_number.to_string(),
            call_id: Some(call_id.to_string()),
        };
        let mut ctx = CallSessionContext::new(info);
        ctx.tracked = true;
        self.sessions.insert(session.clone(), ctx);
        self.current = Some(session);
    }

    /// Push an event to the listener.
    pub fn emit(&self, event: CtiEvent) {
        tracing::debug!("Event: {}", event.name());
        if self.events.send(event).is_err() {
            tracing::debug!("Event listener gone, dropping event");
        }
    }

    pub fn handle(&mut self, raw: RawEvent, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        match raw {
            RawEvent::Connected => {
                self.connected = true;
                self.emit(CtiEvent::Connected);
                if self.auto_register {
                    effects.push(Effect::Register);
                }
            }
            RawEvent::Disconnected => {
                self.connected = false;
                self.registered = false;
                effects.push(Effect::Stop);
                self.emit(CtiEvent::Disconnected);
                self.end_all_sessions("transport disconnected");
            }
            RawEvent::Registered => {
                self.registered = true;
                self.emit(CtiEvent::Registered {
                    local_agent: self.local_agent.clone(),
                });
            }
            RawEvent::Unregistered => {
                self.registered = false;
                effects.push(Effect::Stop);
                self.emit(CtiEvent::Unregistered {
                    local_agent: self.local_agent.clone(),
                });
                self.end_all_sessions("unregistered");
            }
            RawEvent::RegistrationFailed { cause } => {
                self.registered = false;
                tracing::warn!("Registration failed: {}", cause);
                self.emit(CtiEvent::RegisterFailed {
                    msg: format!("Registration failed: {}", cause),
                });
                effects.push(Effect::Stop);
                self.end_all_sessions("registration failed");
            }
            RawEvent::RegistrationExpiring => {
                tracing::debug!("Registration expiring, renewing");
                effects.push(Effect::Register);
            }
            RawEvent::NewSession {
                session,
                originator,
                remote_number,
                call_id,
            } => self.on_new_session(session, originator, remote_number, call_id),
            RawEvent::Session { session, event } => {
                self.on_session_event(&session, event, now, &mut effects)
            }
        }
        effects
    }

    fn on_new_session(
        &mut self,
        session: SessionId,
        originator: Originator,
        remote_number: String,
        call_id: Option<String>,
    ) {
        match originator {
            Originator::Remote => {
                tracing::info!("[{}] Incoming call from {}", session, remote_number);
                let info = CallInfo {
                    direction: CallDirection::Inbound,
                    remote_number,
                    call_id,
                };
                self.sessions
                    .insert(session.clone(), CallSessionContext::new(info));
                self.current = Some(session);
            }
            Originator::Local => {
                if self.sessions.contains_key(&session) {
                    return;
                }
                // Placed outside `track_outbound`; report it anyway
                tracing::info!("[{}] Outgoing call to {}", session, remote_number);
                let info = CallInfo {
                    direction: CallDirection::Outbound,
                    remote_number,
                    call_id,
                };
                self.sessions
                    .insert(session.clone(), CallSessionContext::new(info));
                self.current = Some(session);
            }
        }
    }

    fn on_session_event(
        &mut self,
        session: &SessionId,
        event: SessionEvent,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if let SessionEvent::Ended { cause } | SessionEvent::Failed { cause } = &event {
            self.end_session(session, cause);
            return;
        }

        let is_current = self.current.as_ref() == Some(session);
        let Some(ctx) = self.sessions.get_mut(session) else {
            tracing::debug!("[{}] Event for unknown session: {:?}", session, event);
            return;
        };

        let mut out = None;
        match event {
            SessionEvent::Progress => {
                if !ctx.announced {
                    ctx.announced = true;
                    out = Some(match ctx.info.direction {
                        CallDirection::Inbound => CtiEvent::IncomingCall(ctx.info.clone()),
                        CallDirection::Outbound => CtiEvent::OutgoingCall(ctx.info.clone()),
                    });
                }
            }
            SessionEvent::Accepted => {
                ctx.state = CallState::Connected;
                out = Some(CtiEvent::InCall {
                    call: Some(ctx.info.clone()),
                });
            }
            SessionEvent::Hold => {
                ctx.state = CallState::OnHold;
                out = Some(CtiEvent::Hold);
            }
            SessionEvent::Unhold => {
                ctx.state = CallState::Connected;
                out = Some(CtiEvent::InCall {
                    call: Some(ctx.info.clone()),
                });
            }
            SessionEvent::PeerConnection(source) => {
                tracing::debug!("[{}] Peer connection up, sampling network stats", session);
                ctx.sampler = Some(NetworkQualitySampler::start(source));
            }
            SessionEvent::IceCandidate(line) => {
                if self.ice.on_candidate(session, &line, now) {
                    effects.push(Effect::IceReady(session.clone()));
                }
            }
            SessionEvent::Ended { .. } | SessionEvent::Failed { .. } => {}
        }

        if let Some(ev) = out {
            if is_current {
                self.emit(ev);
            } else {
                tracing::debug!("[{}] Suppressing {} for background session", session, ev.name());
            }
        }
    }

    /// Ended and failed are indistinguishable from here on.
    fn end_session(&mut self, session: &SessionId, cause: &str) {
        self.ice.cancel(session);
        let Some(ctx) = self.sessions.remove(session) else {
            tracing::debug!("[{}] End for unknown session ({})", session, cause);
            return;
        };

        if self.current.as_ref() == Some(session) {
            self.current = None;
        } else if ctx.tracked {
            // A call we placed lost focus to another session but still owes
            // its outcome
            tracing::info!("[{}] Background outbound call ended: {}", session, cause);
        } else {
            tracing::debug!("[{}] Background session ended ({})", session, cause);
            return;
        }
        tracing::info!("[{}] Call ended: {}", session, cause);
        self.emit(CtiEvent::CallEnd {
            call: Some(ctx.info),
        });
    }

    /// The user agent is going away; every session dies with it. The current
    /// session is ended last so its `CALL_END` is the final event.
    fn end_all_sessions(&mut self, cause: &str) {
        let mut ids: Vec<SessionId> = self
            .sessions
            .keys()
            .filter(|id| self.current.as_ref() != Some(*id))
            .cloned()
            .collect();
        ids.extend(self.current.clone());
        for id in ids {
            self.end_session(&id, cause);
        }
    }

    /// Drive timers: ICE quiet periods and the current session's sampler.
    pub fn on_timer(&mut self, now: Instant) -> Vec<Effect> {
        let effects: Vec<Effect> = self
            .ice
            .expired(now)
            .into_iter()
            .map(|s| {
                tracing::debug!("[{}] ICE gathering quiet period elapsed", s);
                Effect::IceReady(s)
            })
            .collect();

        let stat = self
            .current
            .as_ref()
            .and_then(|id| self.sessions.get_mut(id))
            .and_then(|ctx| ctx.sampler.as_mut())
            .and_then(|sampler| sampler.poll(now));
        if let Some(stat) = stat {
            self.emit(CtiEvent::LatencyStat(stat));
        }

        effects
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let sampler = self
            .current_session()
            .and_then(|(_, ctx)| ctx.sampler.as_ref())
            .map(|s| s.deadline());
        earliest([self.ice.next_deadline(), sampler])
    }

    /// Forget all sessions and timers.
    pub fn reset(&mut self) {
        self.sessions.clear();
        self.current = None;
        self.ice = IceDebounce::default();
    }
}
