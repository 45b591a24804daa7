use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use super::{
    CallTarget, Dialer, PauseInfo, TaskCallback, TaskError, TaskEvent, TaskState, TaskStatistics,
};
use crate::calling::{CallInfo, CtiEvent, Ticker};
use crate::config::TaskConfig;

/// Cadence of periodic statistics snapshots while running.
pub const STAT_INTERVAL: Duration = Duration::from_secs(1);

/// Auto-dial task engine.
///
/// Every mutating entry point checks the current state first, so late or
/// duplicated events after a transition are harmless.
pub struct AutoDialTask {
    config: TaskConfig,
    callback: TaskCallback,
    state: TaskState,
    queue: VecDeque<CallTarget>,
    stats: TaskStatistics,
    current: Option<CallTarget>,
    /// Call id the dialer returned for `current`
    current_call_id: Option<String>,
    /// The current target reached IN_CALL
    current_answered: bool,
    started_at: Option<Instant>,
    /// Set when leaving Running, freezes the duration
    stopped_at: Option<Instant>,
    /// Present only while Running
    stat_timer: Option<Ticker>,
    destroyed: bool,
}

impl AutoDialTask {
    pub fn new(config: TaskConfig, callback: TaskCallback) -> Self {
        Self {
            config,
            callback,
            state: TaskState::Paused,
            queue: VecDeque::new(),
            stats: TaskStatistics::default(),
            current: None,
            current_call_id: None,
            current_answered: false,
            started_at: None,
            stopped_at: None,
            stat_timer: None,
            destroyed: false,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn current_target(&self) -> Option<&CallTarget> {
        self.current.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Deadline of the statistics ticker, if it is running.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.stat_timer.as_ref().map(Ticker::deadline)
    }

    /// Current statistics with derived fields filled in.
    pub fn statistics(&self) -> TaskStatistics {
        let mut stats = self.stats.clone();
        stats.status = self.state;
        stats.current_target = self.current.clone();
        stats.duration_seconds = match self.started_at {
            Some(start) => {
                let end = self.stopped_at.unwrap_or_else(Instant::now);
                end.saturating_duration_since(start).as_secs()
            }
            None => 0,
        };
        stats
    }

    pub fn add_task(&mut self, target: CallTarget) -> Result<(), TaskError> {
        self.add_tasks(std::iter::once(target))
    }

    /// Enqueue targets in order. Never dials by itself.
    pub fn add_tasks(
        &mut self,
        targets: impl IntoIterator<Item = CallTarget>,
    ) -> Result<(), TaskError> {
        if self.destroyed {
            return Err(TaskError::Destroyed);
        }
        let before = self.queue.len();
        self.queue.extend(targets);
        let added = self.queue.len() - before;
        if added == 0 {
            return Ok(());
        }
        self.stats.total += added as u64;
        tracing::debug!("Enqueued {} target(s), {} waiting", added, self.queue.len());
        self.emit_stat();
        Ok(())
    }

    /// Paused → Running. Starting an already running task does nothing.
    pub fn start(&mut self, dialer: &mut dyn Dialer) -> Result<(), TaskError> {
        if self.destroyed {
            return Err(TaskError::Destroyed);
        }
        match self.state {
            TaskState::Ended => return Err(TaskError::AlreadyEnded),
            TaskState::Running => {
                tracing::debug!("Task already running");
                return Ok(());
            }
            TaskState::Paused => {}
        }

        tracing::info!("Task started with {} target(s) queued", self.queue.len());
        self.state = TaskState::Running;
        self.stats.start_timestamp = Some(Utc::now());
        self.started_at = Some(Instant::now());
        self.stopped_at = None;
        self.stat_timer = Some(Ticker::start(STAT_INTERVAL));
        self.stats.info = "running".to_string();
        self.emit_stat();

        if self.current.is_some() {
            // User paused mid-call and the call is still up; advance when it
            // ends
            self.stats.info = "waiting for current call".to_string();
            return Ok(());
        }
        self.next(dialer);
        Ok(())
    }

    /// Dial the queue head, or end the task if the queue is empty.
    ///
    /// Ignored unless running with no call in progress; this is also how a
    /// caller finishes after-call work.
    pub fn next(&mut self, dialer: &mut dyn Dialer) {
        if self.destroyed || self.state != TaskState::Running {
            tracing::debug!("next() ignored in state {:?}", self.state);
            return;
        }
        if let Some(ref current) = self.current {
            tracing::warn!("next() ignored, call to {} still in progress", current.phone);
            return;
        }

        let Some(target) = self.queue.pop_front() else {
            tracing::info!("Queue drained, ending task");
            self.end();
            return;
        };

        match dialer.dial(&target.phone) {
            Some(call_id) => {
                tracing::info!("Dialing {} ({}) call_id={}", target.phone, target.id, call_id);
                self.stats.info = format!("dialing {}", target.phone);
                self.current = Some(target);
                self.current_call_id = Some(call_id);
                self.current_answered = false;
                self.stats.dialed += 1;
                self.emit_stat();
            }
            None => {
                tracing::warn!("Dial request for {} refused, pausing", target.phone);
                self.queue.push_front(target);
                self.pause_with(PauseInfo::system("dial_rejected"));
            }
        }
    }

    /// User pause. Pausing a paused task only re-emits a snapshot.
    pub fn pause(&mut self) {
        if self.destroyed {
            return;
        }
        if self.state == TaskState::Paused {
            self.emit_stat();
            return;
        }
        self.pause_with(PauseInfo::user());
    }

    /// Running → Ended. Stopping an ended task only re-emits a snapshot.
    pub fn stop(&mut self) {
        if self.destroyed {
            return;
        }
        self.end();
    }

    /// Release the timer and drop all targets. Further calls are rejected or
    /// ignored.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        tracing::debug!("Task destroyed");
        self.stat_timer = None;
        self.take_current();
        self.queue.clear();
        self.destroyed = true;
    }

    /// Feed a normalized softphone event.
    pub fn handle_call_event(&mut self, event: &CtiEvent, dialer: &mut dyn Dialer) {
        if self.destroyed {
            return;
        }
        match event {
            CtiEvent::Disconnected => self.system_pause("disconnected"),
            CtiEvent::Unregistered { .. } => self.system_pause("unregistered"),
            CtiEvent::RegisterFailed { .. } => self.system_pause("register_failed"),
            CtiEvent::InCall { call } if self.is_current_call(call.as_ref()) => {
                self.on_answered()
            }
            CtiEvent::CallEnd { call } if self.is_current_call(call.as_ref()) => {
                self.on_call_end(dialer)
            }
            _ => {}
        }
    }

    /// Whether a call event belongs to the call this task placed. Other
    /// calls (inbound, manual) never move the task.
    fn is_current_call(&self, call: Option<&CallInfo>) -> bool {
        match (&self.current_call_id, call.and_then(|c| c.call_id.as_ref())) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => false,
        }
    }

    fn take_current(&mut self) -> Option<CallTarget> {
        self.current_call_id = None;
        self.current_answered = false;
        self.current.take()
    }

    /// Emit a snapshot if the statistics ticker is due.
    pub fn on_tick(&mut self, now: Instant) {
        let due = match self.stat_timer.as_mut() {
            Some(timer) => timer.poll(now),
            None => false,
        };
        if due && self.state == TaskState::Running {
            self.emit_stat();
        }
    }

    fn on_answered(&mut self) {
        // IN_CALL also follows unhold; count each target once
        if self.current.is_none() || self.current_answered {
            return;
        }
        self.current_answered = true;
        self.emit(TaskEvent::CallAnswer(self.current.clone()));
        self.stats.answered += 1;
        self.emit_stat();
    }

    fn on_call_end(&mut self, dialer: &mut dyn Dialer) {
        if self.current.is_none() {
            return;
        }

        if !self.current_answered {
            self.stats.unanswered += 1;
            self.emit_stat();
            self.take_current();
            self.next(dialer);
            return;
        }

        let ended = self.take_current();
        self.emit(TaskEvent::CallEnd(ended));
        self.emit_stat();
        if self.config.auto_after_call_work {
            tracing::debug!("After-call work, waiting for next()");
            self.stats.info = "after-call work".to_string();
        } else {
            self.next(dialer);
        }
    }

    /// Connectivity loss. The in-flight call cannot survive it, so its
    /// outcome is settled here and a later `start()` dials the queue head.
    fn system_pause(&mut self, reason: &str) {
        if self.state != TaskState::Running {
            return;
        }
        let answered = self.current_answered;
        if let Some(target) = self.take_current() {
            if answered {
                self.emit(TaskEvent::CallEnd(Some(target)));
            } else {
                tracing::debug!("Call to {} lost with the connection", target.phone);
                self.stats.unanswered += 1;
            }
        }
        self.pause_with(PauseInfo::system(reason));
    }

    fn pause_with(&mut self, info: PauseInfo) {
        if self.state != TaskState::Running {
            return;
        }
        tracing::info!("Task paused ({:?}): {}", info.source, info.reason);
        self.state = TaskState::Paused;
        self.stat_timer = None;
        self.stopped_at = Some(Instant::now());
        self.stats.info = if info.reason.is_empty() {
            "paused".to_string()
        } else {
            format!("paused: {}", info.reason)
        };
        self.emit_stat();
        self.emit(TaskEvent::TaskPause(info));
    }

    fn end(&mut self) {
        if self.state == TaskState::Ended {
            self.emit_stat();
            return;
        }
        tracing::info!(
            "Task ended: dialed={} answered={} unanswered={}",
            self.stats.dialed,
            self.stats.answered,
            self.stats.unanswered
        );
        self.state = TaskState::Ended;
        self.stat_timer = None;
        if self.started_at.is_some() && self.stopped_at.is_none() {
            self.stopped_at = Some(Instant::now());
        }
        self.stats.info = "ended".to_string();
        let snapshot = self.statistics();
        self.emit(TaskEvent::TaskStat(snapshot.clone()));
        self.emit(TaskEvent::TaskEnd(snapshot));
    }

    fn emit_stat(&mut self) {
        let snapshot = self.statistics();
        self.emit(TaskEvent::TaskStat(snapshot));
    }

    fn emit(&mut self, event: TaskEvent) {
        (self.callback)(event);
    }
}
