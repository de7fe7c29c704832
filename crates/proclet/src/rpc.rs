//! Call correlation: "invoke a remote function" becomes "send a request
//! tagged with a fresh action id, then settle on the response event with the
//! same id".
//!
//! Both directions share [`CallCore`]: the controller calls into the worker's
//! module, and the worker calls back into the controller's registered API.
//! Only the outbound half differs (see [`Outbound`]).

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::cyclic::{CodecError, Envelope};
use crate::error::RemoteError;
use crate::events::{Events, Notification, Topic};
use crate::id::{ActionId, IdGenerator};
use crate::schema::Arity;
use crate::value::Value;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("worker is closed")]
    Closed,
    #[error("failed to send request: {0}")]
    Send(#[source] io::Error),
    #[error("Unable to access '{0}'")]
    Unavailable(String),
    #[error("peer went away before responding")]
    Disconnected,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("'{name}' takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: Arity,
        got: usize,
    },
    #[error("'{0}' is not part of the API")]
    UnknownMethod(String),
}

impl CallError {
    /// The remote failure, when the callee itself raised one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

/// The sending half of one call direction.
#[async_trait]
pub(crate) trait Outbound: Send + Sync {
    async fn send_invoke(
        &self,
        action_id: ActionId,
        function_name: &str,
        args: Envelope,
    ) -> io::Result<()>;

    async fn send_get(&self, action_id: ActionId, export_name: &str) -> io::Result<()> {
        let _ = (action_id, export_name);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "property access is only available from the controller",
        ))
    }
}

/// State of the channel a [`CallCore`] sends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    Open,
    /// No new calls; pending ones may still settle.
    Draining,
    /// Peer gone; pending calls reject.
    Down,
}

pub(crate) struct CallCore {
    ids: IdGenerator,
    events: Events,
    outbound: Arc<dyn Outbound>,
    link: watch::Receiver<Link>,
    timeout: Option<Duration>,
}

impl CallCore {
    pub(crate) fn new(
        events: Events,
        outbound: Arc<dyn Outbound>,
        link: watch::Receiver<Link>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            ids: IdGenerator::new(),
            events,
            outbound,
            link,
            timeout,
        }
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if *self.link.borrow() == Link::Open {
            Ok(())
        } else {
            Err(CallError::Closed)
        }
    }

    pub(crate) async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.ensure_open()?;
        let action_id = ActionId::next(&self.ids);
        let envelope = Envelope::encode_args(&args)?;

        let (tx, rx) = oneshot::channel();
        let _listener = self
            .events
            .once(Topic::CallResult(action_id.clone()), deliver_once(tx));

        tracing::debug!(%action_id, function = name, "Invoking remote function");
        self.outbound
            .send_invoke(action_id.clone(), name, envelope)
            .await
            .map_err(CallError::Send)?;

        match self.settle(rx).await? {
            Notification::CallResult {
                outcome: Ok(payload),
                ..
            } => Ok(payload.decode()?),
            Notification::CallResult {
                outcome: Err(error),
                ..
            } => {
                tracing::debug!(%action_id, function = name, "Remote function failed");
                Err(CallError::Remote(error.into()))
            }
            other => {
                tracing::warn!(%action_id, ?other, "Unexpected notification for call");
                Err(CallError::Disconnected)
            }
        }
    }

    pub(crate) async fn get(&self, name: &str) -> Result<Value, CallError> {
        self.ensure_open()?;
        let action_id = ActionId::next(&self.ids);

        let (tx, rx) = oneshot::channel();
        let _listener = self
            .events
            .once(Topic::PropertyResult(action_id.clone()), deliver_once(tx));

        tracing::debug!(%action_id, export = name, "Reading remote export");
        self.outbound
            .send_get(action_id.clone(), name)
            .await
            .map_err(CallError::Send)?;

        match self.settle(rx).await? {
            Notification::PropertyResult {
                payload: Some(payload),
                ..
            } => Ok(payload.decode()?),
            _ => Err(CallError::Unavailable(name.to_string())),
        }
    }

    async fn settle(&self, rx: oneshot::Receiver<Notification>) -> Result<Notification, CallError> {
        let mut link = self.link.clone();
        let wait = async move {
            tokio::select! {
                biased;
                res = rx => res.map_err(|_| CallError::Disconnected),
                _ = link.wait_for(|l| *l == Link::Down) => Err(CallError::Disconnected),
            }
        };
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| CallError::Timeout(limit))?,
            None => wait.await,
        }
    }
}

fn deliver_once(
    tx: oneshot::Sender<Notification>,
) -> impl Fn(Notification) + Send + Sync + 'static {
    let slot = Mutex::new(Some(tx));
    move |notification| {
        let tx = slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(notification);
        }
    }
}

/// Call façade for remote functions.
///
/// `invoke.call("f", args)` and `invoke.method("f").call(args)` take the same
/// path and produce the same request.
#[derive(Clone)]
pub struct Invoke {
    core: Arc<CallCore>,
}

impl Invoke {
    pub(crate) fn new(core: Arc<CallCore>) -> Self {
        Self { core }
    }

    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.core.invoke(name, args).await
    }

    pub fn method(&self, name: impl Into<String>) -> RemoteMethod {
        RemoteMethod {
            core: Arc::clone(&self.core),
            name: name.into(),
        }
    }
}

/// One remote function, bound by name.
#[derive(Clone)]
pub struct RemoteMethod {
    core: Arc<CallCore>,
    name: String,
}

impl RemoteMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value, CallError> {
        self.core.invoke(&self.name, args).await
    }
}

/// Read façade for a worker module's non-function exports.
#[derive(Clone)]
pub struct Get {
    core: Arc<CallCore>,
}

impl Get {
    pub(crate) fn new(core: Arc<CallCore>) -> Self {
        Self { core }
    }

    pub async fn fetch(&self, name: &str) -> Result<Value, CallError> {
        self.core.get(name).await
    }

    pub fn property(&self, name: impl Into<String>) -> RemoteProperty {
        RemoteProperty {
            core: Arc::clone(&self.core),
            name: name.into(),
        }
    }
}

#[derive(Clone)]
pub struct RemoteProperty {
    core: Arc<CallCore>,
    name: String,
}

impl RemoteProperty {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn fetch(&self) -> Result<Value, CallError> {
        self.core.get(&self.name).await
    }
}
