//! CTI bar - softphone call control and outbound auto-dialing.
//!
//! The SIP/WebRTC user agent sits behind [`signaling::SignalingClient`].
//! [`calling`] turns its events into a small closed set of [`CtiEvent`]s,
//! [`task`] dials a queue of targets off those events, and [`runtime`] runs
//! both on one tokio event loop.

pub mod calling;
pub mod config;
pub mod runtime;
pub mod signaling;
pub mod task;

pub use calling::softphone::{CallExtraParam, Softphone};
pub use calling::{CtiEvent, LatencyStat};
pub use config::Config;
pub use runtime::{Command, CtiBar, CtiHandle, Notification};
pub use task::{AutoDialTask, CallTarget, TaskEvent, TaskStatistics};
