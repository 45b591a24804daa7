//! Event loop that owns the softphone and the auto-dial task.
//!
//! One tokio task multiplexes raw user-agent events, normalized events,
//! commands from any number of [`CtiHandle`]s and the earliest pending timer.
//! Everything observable is forwarded to a single listener channel.

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::calling::softphone::{CallExtraParam, Softphone};
use crate::calling::{earliest, CtiEvent};
use crate::config::{Config, TaskConfig};
use crate::signaling::{RawEvent, SignalingClient};
use crate::task::{AutoDialTask, CallTarget, TaskEvent};

/// What the listener receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Notification {
    Phone(CtiEvent),
    Task(TaskEvent),
}

/// Requests accepted by the event loop.
#[derive(Debug, Clone)]
pub enum Command {
    /// Replace the current task with a fresh one; the old task is destroyed
    NewTask(TaskConfig),
    AddTasks(Vec<CallTarget>),
    StartTask,
    PauseTask,
    StopTask,
    NextTask,
    Register,
    Unregister,
    Call { phone: String, param: CallExtraParam },
    Answer,
    Hangup,
    Hold,
    Unhold,
    Mute,
    Unmute,
    Transfer(String),
    SendDtmf(String),
    SendMessage { target: String, content: String },
    Shutdown,
}

/// Cloneable sender side of the event loop.
#[derive(Debug, Clone)]
pub struct CtiHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CtiHandle {
    pub fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .ok()
            .context("CTI event loop has stopped")
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

pub struct CtiBar<C: SignalingClient> {
    phone: Softphone<C>,
    task: Option<AutoDialTask>,
    raw_rx: mpsc::UnboundedReceiver<RawEvent>,
    cti_rx: mpsc::UnboundedReceiver<CtiEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    notify: mpsc::UnboundedSender<Notification>,
}

impl<C: SignalingClient> CtiBar<C> {
    /// Wire a client whose raw events arrive on `raw_rx`. Notifications go
    /// to `notify`.
    pub fn new(
        client: C,
        config: &Config,
        raw_rx: mpsc::UnboundedReceiver<RawEvent>,
        notify: mpsc::UnboundedSender<Notification>,
    ) -> (Self, CtiHandle) {
        let (cti_tx, cti_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let phone = Softphone::new(client, config.sip.clone(), cti_tx);
        let task = new_task(config.task, notify.clone());
        let bar = Self {
            phone,
            task: Some(task),
            raw_rx,
            cti_rx,
            cmd_rx,
            notify,
        };
        (bar, CtiHandle { tx: cmd_tx })
    }

    pub fn phone(&self) -> &Softphone<C> {
        &self.phone
    }

    pub fn task(&self) -> Option<&AutoDialTask> {
        self.task.as_ref()
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.phone.next_deadline(),
            self.task.as_ref().and_then(AutoDialTask::next_deadline),
        ])
    }

    /// Connect and process events until `Shutdown` or every handle is gone.
    pub async fn run(mut self) -> Result<()> {
        self.phone.connect();

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                Some(event) = self.cti_rx.recv() => self.on_event(event),
                Some(raw) = self.raw_rx.recv() => self.phone.handle_raw(raw),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                _ = sleep_until(deadline) => self.on_timer(Instant::now()),
            }
        }

        self.shutdown();
        Ok(())
    }

    fn on_event(&mut self, event: CtiEvent) {
        tracing::debug!("{}", event.name());
        let _ = self.notify.send(Notification::Phone(event.clone()));
        if let Some(task) = self.task.as_mut() {
            task.handle_call_event(&event, &mut self.phone);
        }
    }

    fn on_timer(&mut self, now: Instant) {
        self.phone.on_timer(now);
        if let Some(task) = self.task.as_mut() {
            task.on_tick(now);
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::NewTask(config) => {
                if let Some(mut old) = self.task.take() {
                    old.destroy();
                }
                self.task = Some(new_task(config, self.notify.clone()));
            }
            Command::AddTasks(targets) => self.with_task(|task, _| task.add_tasks(targets)),
            Command::StartTask => self.with_task(|task, phone| task.start(phone)),
            Command::PauseTask => self.with_task(|task, _| {
                task.pause();
                Ok(())
            }),
            Command::StopTask => self.with_task(|task, _| {
                task.stop();
                Ok(())
            }),
            Command::NextTask => self.with_task(|task, phone| {
                task.next(phone);
                Ok(())
            }),
            Command::Register => self.phone.register(),
            Command::Unregister => self.phone.unregister(),
            Command::Call { phone, param } => {
                if let Some(call_id) = self.phone.call(&phone, &param) {
                    tracing::info!("Calling {} (call id {})", phone, call_id);
                }
            }
            Command::Answer => self.phone.answer(),
            Command::Hangup => self.phone.hangup(),
            Command::Hold => self.phone.hold(),
            Command::Unhold => self.phone.unhold(),
            Command::Mute => self.phone.mute(),
            Command::Unmute => self.phone.unmute(),
            Command::Transfer(phone) => self.phone.transfer(&phone),
            Command::SendDtmf(tones) => self.phone.send_dtmf(&tones),
            Command::SendMessage { target, content } => {
                self.phone.send_message(&target, &content)
            }
            Command::Shutdown => {}
        }
    }

    fn with_task<F>(&mut self, f: F)
    where
        F: FnOnce(&mut AutoDialTask, &mut Softphone<C>) -> Result<(), crate::task::TaskError>,
    {
        let Some(task) = self.task.as_mut() else {
            tracing::warn!("No auto-dial task");
            return;
        };
        if let Err(e) = f(task, &mut self.phone) {
            tracing::warn!("Task command rejected: {}", e);
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("Shutting down");
        if let Some(task) = self.task.as_mut() {
            task.destroy();
        }
        self.phone.shutdown();
    }
}

fn new_task(config: TaskConfig, notify: mpsc::UnboundedSender<Notification>) -> AutoDialTask {
    AutoDialTask::new(
        config,
        Box::new(move |event| {
            let _ = notify.send(Notification::Task(event));
        }),
    )
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
