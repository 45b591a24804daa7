//! Softphone facade: call control on top of a [`SignalingClient`].
//!
//! Every operation validates against the normalizer's view of the current
//! session first. Invalid requests and client failures are reported as
//! `ERROR` events instead of being returned, so a UI only has one channel to
//! watch.

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::normalizer::{CallEventNormalizer, Effect};
use super::{CallDirection, CallState, CtiEvent};
use crate::config::SipConfig;
use crate::signaling::{CallOptions, DtmfOptions, RawEvent, SessionId, SignalingClient};
use crate::task::Dialer;

/// Session timer refresh for outbound calls, seconds.
const SESSION_TIMERS_EXPIRES: u32 = 120;

/// Optional business headers attached to an outbound INVITE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallExtraParam {
    /// Caller id to present on the trunk
    pub out_number: Option<String>,
    pub business_id: Option<String>,
}

impl CallExtraParam {
    /// SIP headers for this call.
    pub fn headers(&self, call_id: &str) -> Vec<String> {
        let mut headers = vec![format!("X-JCallId: {}", call_id)];
        if let Some(ref id) = self.business_id {
            headers.push(format!("X-JBusinessId: {}", id));
        }
        if let Some(ref out) = self.out_number {
            headers.push(format!("X-JOutNumber: {}", out));
        }
        headers
    }
}

/// Microphone availability as reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicStatus {
    Granted,
    Denied,
    /// Permission not decided yet
    Prompt,
    /// No media device API (e.g. insecure origin)
    Unavailable,
    /// Opening the device failed
    DeviceError,
}

impl MicStatus {
    fn error_message(&self) -> Option<&'static str> {
        match self {
            MicStatus::Granted => None,
            MicStatus::Denied => {
                Some("Microphone permission is denied; allow microphone access")
            }
            MicStatus::Prompt => Some(
                "Microphone permission has not been granted; allow microphone access and retry",
            ),
            MicStatus::Unavailable => Some(
                "Microphone check failed; check microphone permission and that the page is served over HTTPS",
            ),
            MicStatus::DeviceError => {
                Some("Microphone check failed; check that a microphone is connected")
            }
        }
    }
}

/// Host hook for probing the microphone.
pub trait MicrophoneCheck: Send {
    fn status(&self) -> MicStatus;
}

pub struct Softphone<C: SignalingClient> {
    client: C,
    normalizer: CallEventNormalizer,
    config: SipConfig,
    microphone: Option<Box<dyn MicrophoneCheck>>,
}

impl<C: SignalingClient> Softphone<C> {
    pub fn new(client: C, config: SipConfig, events: mpsc::UnboundedSender<CtiEvent>) -> Self {
        let normalizer =
            CallEventNormalizer::new(config.ext_no.clone(), config.auto_register, events);
        Self {
            client,
            normalizer,
            config,
            microphone: None,
        }
    }

    /// Attach a microphone check. Runs a check right away when `check_mic`
    /// is configured.
    pub fn with_microphone(mut self, check: Box<dyn MicrophoneCheck>) -> Self {
        self.microphone = Some(check);
        if self.config.check_mic {
            self.check_microphone();
        }
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn normalizer(&self) -> &CallEventNormalizer {
        &self.normalizer
    }

    pub fn local_agent(&self) -> &str {
        &self.config.ext_no
    }

    /// Open the transport.
    pub fn connect(&mut self) {
        tracing::info!("Connecting to {}", self.config.websocket_url());
        if let Err(e) = self.client.connect(&self.config.ua_config()) {
            self.fail("Failed to connect to the signaling server", e);
        }
    }

    /// Feed one raw user-agent event.
    pub fn handle_raw(&mut self, raw: RawEvent) {
        let effects = self.normalizer.handle(raw, Instant::now());
        self.apply(effects);
    }

    /// Drive ICE and stats timers.
    pub fn on_timer(&mut self, now: Instant) {
        let effects = self.normalizer.on_timer(now);
        self.apply(effects);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.normalizer.next_deadline()
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Register => {
                    if let Err(e) = self.client.register() {
                        self.fail("Registration request failed", e);
                    }
                }
                Effect::Stop => self.client.stop(),
                Effect::IceReady(session) => self.client.ice_gathering_complete(&session),
            }
        }
    }

    fn emit(&self, event: CtiEvent) {
        self.normalizer.emit(event);
    }

    fn fail(&self, what: &str, err: anyhow::Error) {
        tracing::warn!("{}: {:#}", what, err);
        self.emit(CtiEvent::error(format!("{}: {}", what, err)));
    }

    fn call_options(&self, extra_headers: Vec<String>) -> CallOptions {
        CallOptions {
            audio: true,
            video: false,
            extra_headers,
            session_timers_expires: SESSION_TIMERS_EXPIRES,
            ice_servers: self.config.ice_servers(),
        }
    }

    /// Current session if it is established, otherwise emit `ERROR`.
    fn active_session(&self) -> Option<SessionId> {
        match self.normalizer.current_session() {
            Some((id, ctx)) if ctx.is_established() => Some(id.clone()),
            _ => {
                self.emit(CtiEvent::error(
                    "No active call; the call does not exist or has already ended",
                ));
                None
            }
        }
    }

    /// Report microphone problems as `MIC_ERROR`. Returns true when usable.
    pub fn check_microphone(&self) -> bool {
        let Some(ref check) = self.microphone else {
            return true;
        };
        match check.status().error_message() {
            Some(msg) => {
                tracing::warn!("{}", msg);
                self.emit(CtiEvent::MicError {
                    msg: msg.to_string(),
                });
                false
            }
            None => true,
        }
    }

    pub fn register(&mut self) {
        if !self.normalizer.is_connected() {
            self.emit(CtiEvent::error(
                "WebSocket is not connected; connect to the signaling server first",
            ));
            return;
        }
        if let Err(e) = self.client.register() {
            self.fail("Registration request failed", e);
        }
    }

    pub fn unregister(&mut self) {
        if !self.normalizer.is_connected() || !self.normalizer.is_registered() {
            self.emit(CtiEvent::error("Not registered; unregister is not allowed"));
            return;
        }
        if let Err(e) = self.client.unregister() {
            self.fail("Unregister request failed", e);
        }
    }

    /// Place an outbound call. Returns the generated call id, or `None` if
    /// the request was refused (reported as `ERROR`).
    pub fn call(&mut self, phone: &str, param: &CallExtraParam) -> Option<String> {
        if self.config.check_mic {
            self.check_microphone();
        }
        if !self.normalizer.is_registered() {
            self.emit(CtiEvent::error("Register successfully before placing a call"));
            return None;
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        let options = self.call_options(param.headers(&call_id));
        match self.client.call(phone, &options) {
            Ok(session) => {
                tracing::info!("[{}] Calling {} call_id={}", session, phone, call_id);
                self.normalizer.track_outbound(session, phone, &call_id);
                Some(call_id)
            }
            Err(e) => {
                self.fail("Call request failed", e);
                None
            }
        }
    }

    /// Answer the ringing inbound call.
    pub fn answer(&mut self) {
        let session = match self.normalizer.current_session() {
            Some((id, ctx))
                if ctx.state == CallState::Ringing
                    && ctx.info.direction == CallDirection::Inbound =>
            {
                id.clone()
            }
            _ => {
                self.emit(CtiEvent::error(
                    "Invalid operation; there is no ringing call to answer",
                ));
                return;
            }
        };
        let options = self.call_options(Vec::new());
        if let Err(e) = self.client.answer(&session, &options) {
            self.fail("Answer failed", e);
        }
    }

    pub fn hangup(&mut self) {
        let Some((session, _)) = self.normalizer.current_session() else {
            self.emit(CtiEvent::error("No current call to hang up"));
            return;
        };
        let session = session.clone();
        if let Err(e) = self.client.terminate(&session) {
            self.fail("Hangup failed", e);
        }
    }

    pub fn hold(&mut self) {
        let Some(session) = self.active_session() else {
            return;
        };
        if let Err(e) = self.client.hold(&session) {
            self.fail("Hold failed", e);
        }
    }

    /// Resume a held call. Ignored when the call is not on hold.
    pub fn unhold(&mut self) {
        let Some(session) = self.active_session() else {
            return;
        };
        let on_hold = matches!(
            self.normalizer.current_session(),
            Some((_, ctx)) if ctx.state == CallState::OnHold
        );
        if !on_hold {
            return;
        }
        if let Err(e) = self.client.unhold(&session) {
            self.fail("Unhold failed", e);
        }
    }

    pub fn mute(&mut self) {
        let Some(session) = self.active_session() else {
            return;
        };
        match self.client.mute(&session) {
            Ok(()) => self.emit(CtiEvent::Mute),
            Err(e) => self.fail("Mute failed", e),
        }
    }

    pub fn unmute(&mut self) {
        let Some(session) = self.active_session() else {
            return;
        };
        match self.client.unmute(&session) {
            Ok(()) => self.emit(CtiEvent::Unmute),
            Err(e) => self.fail("Unmute failed", e),
        }
    }

    /// Blind-transfer the active call to `phone`.
    pub fn transfer(&mut self, phone: &str) {
        let Some(session) = self.active_session() else {
            return;
        };
        tracing::info!("[{}] Transferring to {}", session, phone);
        if let Err(e) = self.client.refer(&session, phone) {
            self.fail("Transfer failed", e);
        }
    }

    /// Send DTMF on the current call. Silently ignored without one.
    pub fn send_dtmf(&mut self, tones: &str) {
        let Some((session, _)) = self.normalizer.current_session() else {
            return;
        };
        let session = session.clone();
        if let Err(e) = self
            .client
            .send_dtmf(&session, tones, &DtmfOptions::default())
        {
            self.fail("DTMF failed", e);
        }
    }

    pub fn send_message(&mut self, target: &str, content: &str) {
        if let Err(e) = self.client.send_message(target, content) {
            self.fail("Message failed", e);
        }
    }

    /// Drop all call state and stop the user agent.
    pub fn shutdown(&mut self) {
        tracing::info!("Stopping softphone");
        self.normalizer.reset();
        self.client.stop();
    }
}

impl<C: SignalingClient> Dialer for Softphone<C> {
    fn dial(&mut self, phone: &str) -> Option<String> {
        self.call(phone, &CallExtraParam::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{Originator, SessionEvent, UaConfig};
    use anyhow::{bail, Result};

    /// Records every request; never produces events on its own.
    #[derive(Default)]
    struct FakeClient {
        log: Vec<String>,
        ua: Option<UaConfig>,
        last_options: Option<CallOptions>,
        fail_calls: bool,
        next_session: u32,
    }

    impl SignalingClient for FakeClient {
        fn connect(&mut self, config: &UaConfig) -> Result<()> {
            self.log.push("connect".into());
            self.ua = Some(config.clone());
            Ok(())
        }
        fn stop(&mut self) {
            self.log.push("stop".into());
        }
        fn register(&mut self) -> Result<()> {
            self.log.push("register".into());
            Ok(())
        }
        fn unregister(&mut self) -> Result<()> {
            self.log.push("unregister".into());
            Ok(())
        }
        fn call(&mut self, target: &str, options: &CallOptions) -> Result<SessionId> {
            if self.fail_calls {
                bail!("transport closed");
            }
            self.next_session += 1;
            self.log.push(format!("call {}", target));
            self.last_options = Some(options.clone());
            Ok(SessionId(format!("s{}", self.next_session)))
        }
        fn answer(&mut self, session: &SessionId, _options: &CallOptions) -> Result<()> {
            self.log.push(format!("answer {}", session));
            Ok(())
        }
        fn terminate(&mut self, session: &SessionId) -> Result<()> {
            self.log.push(format!("terminate {}", session));
            Ok(())
        }
        fn hold(&mut self, session: &SessionId) -> Result<()> {
            self.log.push(format!("hold {}", session));
            Ok(())
        }
        fn unhold(&mut self, session: &SessionId) -> Result<()> {
            self.log.push(format!("unhold {}", session));
            Ok(())
        }
        fn mute(&mut self, session: &SessionId) -> Result<()> {
            self.log.push(format!("mute {}", session));
            Ok(())
        }
        fn unmute(&mut self, session: &SessionId) -> Result<()> {
            self.log.push(format!("unmute {}", session));
            Ok(())
        }
        fn refer(&mut self, session: &SessionId, target: &str) -> Result<()> {
            self.log.push(format!("refer {} {}", session, target));
            Ok(())
        }
        fn send_dtmf(
            &mut self,
            session: &SessionId,
            tones: &str,
            options: &DtmfOptions,
        ) -> Result<()> {
            self.log.push(format!(
                "dtmf {} {} {}/{}",
                session, tones, options.duration_ms, options.inter_tone_gap_ms
            ));
            Ok(())
        }
        fn send_message(&mut self, target: &str, content: &str) -> Result<()> {
            self.log.push(format!("message {} {}", target, content));
            Ok(())
        }
        fn ice_gathering_complete(&mut self, session: &SessionId) {
            self.log.push(format!("ice {}", session));
        }
    }

    struct Mic(MicStatus);

    impl MicrophoneCheck for Mic {
        fn status(&self) -> MicStatus {
            self.0
        }
    }

    fn phone() -> (Softphone<FakeClient>, mpsc::UnboundedReceiver<CtiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SipConfig {
            ext_no: "1001".into(),
            ext_pwd: "secret".into(),
            ..Default::default()
        };
        (Softphone::new(FakeClient::default(), config, tx), rx)
    }

    fn registered_phone() -> (Softphone<FakeClient>, mpsc::UnboundedReceiver<CtiEvent>) {
        let (mut p, mut rx) = phone();
        p.handle_raw(RawEvent::Connected);
        p.handle_raw(RawEvent::Registered);
        drain(&mut rx);
        p.client_mut().log.clear();
        (p, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CtiEvent>) -> Vec<CtiEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn is_error(ev: &CtiEvent) -> bool {
        matches!(ev, CtiEvent::Error { .. })
    }

    #[test]
    fn test_connected_triggers_auto_register() {
        let (mut p, mut rx) = phone();
        p.connect();
        p.handle_raw(RawEvent::Connected);
        assert_eq!(p.client().log, vec!["connect", "register"]);
        let ua = p.client().ua.clone().unwrap();
        assert_eq!(ua.authorization_user, "1001");
        assert_eq!(ua.password, "secret");
        assert_eq!(ua.register_expires, 15);
        assert_eq!(drain(&mut rx), vec![CtiEvent::Connected]);
    }

    #[test]
    fn test_register_requires_connection() {
        let (mut p, mut rx) = phone();
        p.register();
        assert!(p.client().log.is_empty());
        assert!(is_error(&drain(&mut rx)[0]));

        p.unregister();
        assert!(is_error(&drain(&mut rx)[0]));
    }

    #[test]
    fn test_call_requires_registration() {
        let (mut p, mut rx) = phone();
        assert!(p.call("100", &CallExtraParam::default()).is_none());
        assert!(p.client().log.is_empty());
        assert!(is_error(&drain(&mut rx)[0]));
    }

    #[test]
    fn test_call_builds_headers_and_options() {
        let (mut p, _rx) = registered_phone();
        let param = CallExtraParam {
            out_number: Some("95555".into()),
            business_id: Some("order-7".into()),
        };
        let call_id = p.call("100", &param).unwrap();

        let opts = p.client().last_options.clone().unwrap();
        assert_eq!(
            opts.extra_headers,
            vec![
                format!("X-JCallId: {}", call_id),
                "X-JBusinessId: order-7".to_string(),
                "X-JOutNumber: 95555".to_string(),
            ]
        );
        assert!(opts.audio);
        assert!(!opts.video);
        assert_eq!(opts.session_timers_expires, 120);
        assert_eq!(opts.ice_servers.len(), 1);

        let (session, ctx) = p.normalizer().current_session().unwrap();
        assert_eq!(session, &SessionId("s1".into()));
        assert_eq!(ctx.info.call_id.as_deref(), Some(call_id.as_str()));
    }

    #[test]
    fn test_client_failure_becomes_error_event() {
        let (mut p, mut rx) = registered_phone();
        p.client_mut().fail_calls = true;
        assert!(p.dial("100").is_none());
        let events = drain(&mut rx);
        match &events[0] {
            CtiEvent::Error { msg } => assert!(msg.contains("transport closed")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(p.normalizer().current_session().is_none());
    }

    #[test]
    fn test_call_control_needs_established_call() {
        let (mut p, mut rx) = registered_phone();
        p.hold();
        p.mute();
        p.transfer("200");
        assert!(p.client().log.is_empty());
        assert_eq!(drain(&mut rx).iter().filter(|e| is_error(e)).count(), 3);

        p.dial("100");
        p.handle_raw(RawEvent::Session {
            session: SessionId("s1".into()),
            event: SessionEvent::Accepted,
        });
        drain(&mut rx);

        // Not on hold yet: unhold is a silent no-op
        p.unhold();
        p.hold();
        p.handle_raw(RawEvent::Session {
            session: SessionId("s1".into()),
            event: SessionEvent::Hold,
        });
        p.unhold();
        p.mute();
        p.unmute();
        p.transfer("200");
        p.send_dtmf("12#");
        p.hangup();

        assert_eq!(
            p.client().log,
            vec![
                "call 100",
                "hold s1",
                "unhold s1",
                "mute s1",
                "unmute s1",
                "refer s1 200",
                "dtmf s1 12# 160/1200",
                "terminate s1",
            ]
        );
        let names: Vec<_> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["HOLD", "MUTE", "UNMUTE"]);
    }

    #[test]
    fn test_answer_only_ringing_inbound() {
        let (mut p, mut rx) = registered_phone();
        p.answer();
        assert!(is_error(&drain(&mut rx)[0]));

        p.handle_raw(RawEvent::NewSession {
            session: SessionId("in".into()),
            originator: Originator::Remote,
            remote_number: "200".into(),
            call_id: None,
        });
        p.answer();
        assert_eq!(p.client().log, vec!["answer in"]);
    }

    #[test]
    fn test_hangup_without_call_is_error() {
        let (mut p, mut rx) = registered_phone();
        p.hangup();
        p.send_dtmf("1");
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(is_error(&events[0]));
    }

    #[test]
    fn test_disconnect_stops_user_agent() {
        let (mut p, mut rx) = registered_phone();
        p.handle_raw(RawEvent::Disconnected);
        assert_eq!(p.client().log, vec!["stop"]);
        assert_eq!(drain(&mut rx), vec![CtiEvent::Disconnected]);
        assert!(!p.normalizer().is_registered());
    }

    #[test]
    fn test_microphone_check() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = SipConfig {
            check_mic: true,
            ..Default::default()
        };
        let p = Softphone::new(FakeClient::default(), config, tx)
            .with_microphone(Box::new(Mic(MicStatus::Denied)));
        match drain(&mut rx).as_slice() {
            [CtiEvent::MicError { msg }] => assert!(msg.contains("denied")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!p.check_microphone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let p = Softphone::new(FakeClient::default(), SipConfig::default(), tx)
            .with_microphone(Box::new(Mic(MicStatus::Granted)));
        assert!(p.check_microphone());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_send_message() {
        let (mut p, _rx) = phone();
        p.send_message("sip:1002@example.com", "hello");
        assert_eq!(p.client().log, vec!["message sip:1002@example.com hello"]);
    }
}
