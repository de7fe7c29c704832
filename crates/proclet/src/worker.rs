//! Worker runtime - the child side of the protocol.
//!
//! The controller side (spawning, message routing) is in controller.rs.
//!
//! Flow:
//! 1. Send SubprocessReady
//! 2. On LoadModule, run the loader concurrently with the event loop (a
//!    module may call into the controller while it loads)
//! 3. Answer Invoke/Get against the loaded module; route DeliverCallResult
//!    to the worker's own pending calls
//! 4. Exit on Terminate or when the control channel closes

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, watch};

use crate::bridge::protocol::{CallOutcome, ControlRequest, ErrorEnvelope, WorkerMessage};
use crate::bridge::{BoxedReader, BoxedWriter, SharedWriter, frame_reader, send_frame, shared_writer};
use crate::cyclic::Envelope;
use crate::error::{RemoteError, panic_envelope};
use crate::events::{Events, Notification, publish};
use crate::id::{ActionId, WorkerId};
use crate::registry::{Module, ModuleLoader, serve_call};
use crate::rpc::{CallCore, Invoke, Link, Outbound};
use crate::worker_tracing_layer::LogRecord;

/// Environment variable carrying the worker id to a spawned worker.
pub const WORKER_ID_ENV: &str = "PROCLET_WORKER_ID";

#[derive(Debug)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Tracing events to forward to the controller as worker_log frames.
    pub log_records: Option<mpsc::Receiver<LogRecord>>,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<WorkerId>) -> Self {
        Self {
            worker_id: worker_id.into(),
            log_records: None,
        }
    }

    /// Worker id from [`WORKER_ID_ENV`], falling back to the first CLI argument.
    pub fn from_env() -> io::Result<Self> {
        std::env::var(WORKER_ID_ENV)
            .ok()
            .or_else(|| std::env::args().nth(1))
            .map(Self::new)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("worker id missing: set {WORKER_ID_ENV} or pass it as the first argument"),
                )
            })
    }

    pub fn with_log_records(mut self, rx: mpsc::Receiver<LogRecord>) -> Self {
        self.log_records = Some(rx);
        self
    }
}

/// What a module sees of its worker: its id and a call façade into the
/// controller's registered API.
#[derive(Clone)]
pub struct WorkerContext {
    worker_id: WorkerId,
    invoke: Invoke,
}

impl WorkerContext {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn invoke(&self) -> &Invoke {
        &self.invoke
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

struct WorkerOutbound {
    writer: SharedWriter<WorkerMessage>,
    worker_id: WorkerId,
}

#[async_trait]
impl Outbound for WorkerOutbound {
    async fn send_invoke(
        &self,
        action_id: ActionId,
        function_name: &str,
        args: Envelope,
    ) -> io::Result<()> {
        send_frame(
            &self.writer,
            WorkerMessage::Invoke {
                worker_id: self.worker_id.clone(),
                action_id,
                function_name: function_name.to_string(),
                args,
            },
        )
        .await
    }
}

/// Run the worker over the process's stdin/stdout.
pub async fn run_worker(loader: impl ModuleLoader, config: WorkerConfig) -> io::Result<()> {
    serve(
        Box::pin(tokio::io::stdin()),
        Box::pin(tokio::io::stdout()),
        Arc::new(loader),
        config,
    )
    .await
}

/// Run the worker over an arbitrary pipe pair.
pub async fn run_worker_on(
    reader: BoxedReader,
    writer: BoxedWriter,
    loader: Arc<dyn ModuleLoader>,
    worker_id: WorkerId,
) -> io::Result<()> {
    serve(reader, writer, loader, WorkerConfig::new(worker_id)).await
}

async fn serve(
    reader: BoxedReader,
    writer: BoxedWriter,
    loader: Arc<dyn ModuleLoader>,
    config: WorkerConfig,
) -> io::Result<()> {
    let WorkerConfig {
        worker_id,
        mut log_records,
    } = config;

    let mut ctrl_reader = frame_reader::<ControlRequest>(reader);
    let writer = shared_writer::<WorkerMessage>(writer);

    let events = Events::new();
    let (link_tx, link_rx) = watch::channel(Link::Open);
    let core = Arc::new(CallCore::new(
        events.clone(),
        Arc::new(WorkerOutbound {
            writer: Arc::clone(&writer),
            worker_id: worker_id.clone(),
        }),
        link_rx,
        None,
    ));
    let ctx = WorkerContext {
        worker_id: worker_id.clone(),
        invoke: Invoke::new(core),
    };

    tracing::trace!(%worker_id, "Sending SubprocessReady");
    send_frame(
        &writer,
        WorkerMessage::SubprocessReady {
            worker_id: worker_id.clone(),
        },
    )
    .await?;

    let (load_tx, mut load_rx) = mpsc::channel::<Result<Module, ErrorEnvelope>>(1);
    let mut module: Option<Arc<Module>> = None;
    let mut loading = false;

    loop {
        tokio::select! {
            biased;

            ctrl_msg = ctrl_reader.next() => {
                match ctrl_msg {
                    Some(Ok(ControlRequest::LoadModule { import_path })) => {
                        if module.is_some() || loading {
                            tracing::warn!(%import_path, "Module load requested twice");
                            reply(&writer, WorkerMessage::LoadError {
                                worker_id: worker_id.clone(),
                                error: RemoteError::new("Module already loaded.").to_envelope(),
                            });
                            continue;
                        }
                        loading = true;
                        tracing::info!(%import_path, "Loading module");
                        let loader = Arc::clone(&loader);
                        let ctx = ctx.clone();
                        let load_tx = load_tx.clone();
                        tokio::spawn(async move {
                            let result = AssertUnwindSafe(loader.load(&import_path, ctx))
                                .catch_unwind()
                                .await;
                            let result = match result {
                                Ok(Ok(module)) => Ok(module),
                                Ok(Err(e)) => Err(e.to_envelope()),
                                Err(panic) => Err(panic_envelope(panic)),
                            };
                            let _ = load_tx.send(result).await;
                        });
                    }
                    Some(Ok(ControlRequest::Terminate)) => {
                        tracing::info!("Terminate requested");
                        break;
                    }
                    Some(Ok(ControlRequest::DeliverCallResult { action_id, outcome })) => {
                        let outcome = match outcome {
                            CallOutcome::Success { payload } => Ok(payload),
                            CallOutcome::Failure { error } => Err(error),
                        };
                        publish(&events, Notification::CallResult { action_id, outcome });
                    }
                    Some(Ok(ControlRequest::Invoke { action_id, function_name, args })) => {
                        let Some(module) = module.as_ref() else {
                            reply(&writer, WorkerMessage::ActionError {
                                worker_id: worker_id.clone(),
                                action_id,
                                error: RemoteError::new("Module not loaded.").to_envelope(),
                            });
                            continue;
                        };
                        let function = module.callable(&function_name);
                        let writer = Arc::clone(&writer);
                        let worker_id = worker_id.clone();
                        tokio::spawn(async move {
                            tracing::debug!(%action_id, function = %function_name, "Serving call");
                            let msg = match serve_call(function, &function_name, args).await {
                                CallOutcome::Success { payload } => WorkerMessage::ActionResult {
                                    worker_id,
                                    action_id,
                                    payload,
                                },
                                CallOutcome::Failure { error } => WorkerMessage::ActionError {
                                    worker_id,
                                    action_id,
                                    error,
                                },
                            };
                            if let Err(e) = send_frame(&writer, msg).await {
                                tracing::warn!(error = %e, "Failed to send call result");
                            }
                        });
                    }
                    Some(Ok(ControlRequest::Get { action_id, export_name })) => {
                        let payload = read_export(module.as_deref(), &export_name);
                        reply(&writer, WorkerMessage::GetResult {
                            worker_id: worker_id.clone(),
                            action_id,
                            payload,
                        });
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Control channel error");
                        break;
                    }
                    None => {
                        tracing::info!("Control channel closed (controller gone?), exiting");
                        break;
                    }
                }
            }

            Some(result) = load_rx.recv() => {
                loading = false;
                match result {
                    Ok(loaded) => {
                        tracing::info!(
                            exports = loaded.export_names().count(),
                            "Module loaded"
                        );
                        module = Some(Arc::new(loaded));
                        reply(&writer, WorkerMessage::ModuleLoaded {
                            worker_id: worker_id.clone(),
                        });
                    }
                    Err(error) => {
                        tracing::error!(error = ?error, "Module failed to load");
                        reply(&writer, WorkerMessage::LoadError {
                            worker_id: worker_id.clone(),
                            error,
                        });
                    }
                }
            }

            Some(record) = next_record(&mut log_records) => {
                let _ = send_frame(&writer, record.into_message(&worker_id)).await;
            }
        }
    }

    if let Some(rx) = log_records.as_mut() {
        while let Ok(record) = rx.try_recv() {
            let _ = send_frame(&writer, record.into_message(&worker_id)).await;
        }
    }
    link_tx.send_replace(Link::Down);
    tracing::info!("Worker exiting");
    Ok(())
}

async fn next_record(rx: &mut Option<mpsc::Receiver<LogRecord>>) -> Option<LogRecord> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Send without holding up the event loop.
fn reply(writer: &SharedWriter<WorkerMessage>, msg: WorkerMessage) {
    let writer = Arc::clone(writer);
    tokio::spawn(async move {
        if let Err(e) = send_frame(&writer, msg).await {
            tracing::warn!(error = %e, "Failed to send reply");
        }
    });
}

/// Plain value of a module export. Absent when no module is loaded, the
/// export is missing, or it is a function.
fn read_export(module: Option<&Module>, name: &str) -> Option<Envelope> {
    let Some(module) = module else {
        tracing::warn!(export = name, "Module not loaded.");
        return None;
    };
    if module.callable(name).is_some() {
        tracing::warn!(
            export = name,
            "Functions of workers cannot be read directly. Use invoke() instead."
        );
        return None;
    }
    let value = module.readable(name)?;
    match Envelope::encode(&value) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::warn!(export = name, error = %e, "Export cannot be encoded");
            None
        }
    }
}
