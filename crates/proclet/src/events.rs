//! Inbound notifications and the topics they are routed under.

use crate::bridge::protocol::ErrorEnvelope;
use crate::cyclic::Envelope;
use crate::emitter::EventEmitter;
use crate::error::RemoteError;
use crate::id::ActionId;

/// Routing key. Call and property results are keyed by their action id,
/// so each response reaches only the call that is waiting for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Ready,
    ModuleLoaded,
    LoadError,
    CallResult(ActionId),
    PropertyResult(ActionId),
    Exited,
}

#[derive(Debug, Clone)]
pub enum Notification {
    Ready,
    ModuleLoaded,
    LoadError(RemoteError),
    CallResult {
        action_id: ActionId,
        outcome: Result<Envelope, ErrorEnvelope>,
    },
    PropertyResult {
        action_id: ActionId,
        payload: Option<Envelope>,
    },
    Exited(ExitInfo),
}

impl Notification {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Ready => Topic::Ready,
            Self::ModuleLoaded => Topic::ModuleLoaded,
            Self::LoadError(_) => Topic::LoadError,
            Self::CallResult { action_id, .. } => Topic::CallResult(action_id.clone()),
            Self::PropertyResult { action_id, .. } => Topic::PropertyResult(action_id.clone()),
            Self::Exited(_) => Topic::Exited,
        }
    }
}

pub type Events = EventEmitter<Topic, Notification>;

pub(crate) fn publish(events: &Events, notification: Notification) {
    events.emit(notification.topic(), notification);
}

/// How a worker process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the process was killed by a signal or its status is unknown.
    pub code: Option<i32>,
    /// Tail of the worker's stderr.
    pub stderr: String,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}
