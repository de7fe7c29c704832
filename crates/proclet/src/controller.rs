//! Worker controller - owns one worker subprocess and its event loop.
//!
//! Flow:
//! 1. Spawn the worker, start the read loop
//! 2. Worker sends SubprocessReady (`spawning` -> `ready`)
//! 3. `load_module` sends LoadModule once ready (`loading`), settles on
//!    ModuleLoaded (`active`) or LoadError (`load_failed`)
//! 4. Route results to pending calls, serve the worker's calls into the
//!    registered API
//! 5. On exit: reject pending calls, record [`ExitInfo`], notify `on_exit`

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, watch};

use crate::bridge::protocol::{ControlRequest, WorkerMessage};
use crate::bridge::{BoxedReader, FrameReader, SharedWriter, frame_reader, send_frame, shared_writer};
use crate::cyclic::Envelope;
use crate::error::RemoteError;
use crate::events::{Events, ExitInfo, Notification, Topic, publish};
use crate::id::{ActionId, WorkerId};
use crate::registry::{FunctionTable, RemoteFn, serve_call};
use crate::rpc::{CallCore, Get, Invoke, Link, Outbound};
use crate::schema::{ApiSchema, BoundApi};
use crate::spawn::{SpawnError, SpawnRequest, SpawnedWorker, WorkerProcess, WorkerSpawner};
use crate::worker_tracing_layer::emit_worker_log;

/// Bytes of worker stderr kept for [`ExitInfo::stderr`].
pub const STDERR_TAIL_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Ready,
    Loading,
    Active,
    LoadFailed,
    Exited,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("module failed to load: {0}")]
    Remote(#[from] RemoteError),
    #[error("a module load was already requested for this worker")]
    AlreadyRequested,
    #[error("worker exited before the module loaded")]
    Exited,
    #[error("module load timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to send load request: {0}")]
    Send(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub grace_period: Duration,
    pub load_timeout: Duration,
    pub call_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(500),
            load_timeout: Duration::from_secs(300),
            call_timeout: None,
        }
    }
}

struct ControlOutbound {
    writer: SharedWriter<ControlRequest>,
}

#[async_trait]
impl Outbound for ControlOutbound {
    async fn send_invoke(
        &self,
        action_id: ActionId,
        function_name: &str,
        args: Envelope,
    ) -> io::Result<()> {
        send_frame(
            &self.writer,
            ControlRequest::Invoke {
                action_id,
                function_name: function_name.to_string(),
                args,
            },
        )
        .await
    }

    async fn send_get(&self, action_id: ActionId, export_name: &str) -> io::Result<()> {
        send_frame(
            &self.writer,
            ControlRequest::Get {
                action_id,
                export_name: export_name.to_string(),
            },
        )
        .await
    }
}

pub struct WorkerController {
    worker_id: WorkerId,
    config: ControllerConfig,
    writer: SharedWriter<ControlRequest>,
    events: Events,
    core: Arc<CallCore>,
    api: DashMap<String, RemoteFn>,
    state: watch::Sender<WorkerState>,
    link: watch::Sender<Link>,
    load_requested: AtomicBool,
    terminating: AtomicBool,
    /// Guards the check-then-register in `on_exit` against a concurrent exit.
    exit: Mutex<Option<ExitInfo>>,
    exit_watch: watch::Sender<Option<ExitInfo>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerController {
    /// Spawn a worker and start its read loop. Returns immediately; the
    /// worker becomes ready asynchronously.
    pub fn spawn(
        spawner: &dyn WorkerSpawner,
        request: SpawnRequest,
        config: ControllerConfig,
    ) -> Result<Arc<Self>, SpawnError> {
        let worker_id = request.worker_id.clone();
        tracing::info!(%worker_id, "Spawning worker");
        let SpawnedWorker {
            stdin,
            stdout,
            stderr,
            process,
        } = spawner.spawn(&request)?;

        let writer = shared_writer::<ControlRequest>(stdin);
        let events = Events::new();
        let (link, link_rx) = watch::channel(Link::Open);
        let core = Arc::new(CallCore::new(
            events.clone(),
            Arc::new(ControlOutbound {
                writer: Arc::clone(&writer),
            }),
            link_rx,
            config.call_timeout,
        ));
        let (kill_tx, kill_rx) = oneshot::channel();

        let controller = Arc::new(Self {
            worker_id: worker_id.clone(),
            config,
            writer,
            events,
            core,
            api: DashMap::new(),
            state: watch::Sender::new(WorkerState::Spawning),
            link,
            load_requested: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            exit: Mutex::new(None),
            exit_watch: watch::Sender::new(None),
            kill_tx: Mutex::new(Some(kill_tx)),
        });

        let stderr_task = stderr.map(|s| tokio::spawn(capture_stderr(worker_id.clone(), s)));
        tokio::spawn(run_event_loop(
            Arc::downgrade(&controller),
            worker_id,
            frame_reader::<WorkerMessage>(stdout),
            process,
            kill_rx,
            stderr_task,
        ));

        Ok(controller)
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        lock(&self.exit).clone()
    }

    /// Load `import_path` into the worker. Waits for readiness first.
    ///
    /// Only one load may be requested per worker.
    pub async fn load_module(&self, import_path: &str) -> Result<(), LoadError> {
        if self.load_requested.swap(true, Ordering::SeqCst) {
            return Err(LoadError::AlreadyRequested);
        }
        let limit = self.config.load_timeout;
        match tokio::time::timeout(limit, self.load_inner(import_path)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(worker_id = %self.worker_id, import_path, "Module load timed out");
                Err(LoadError::Timeout(limit))
            }
        }
    }

    async fn load_inner(&self, import_path: &str) -> Result<(), LoadError> {
        let (tx, rx) = oneshot::channel::<Notification>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let forward = |tx: &Arc<Mutex<Option<oneshot::Sender<Notification>>>>| {
            let tx = Arc::clone(tx);
            move |n: Notification| {
                if let Some(tx) = lock(&tx).take() {
                    let _ = tx.send(n);
                }
            }
        };
        let _loaded = self.events.once(Topic::ModuleLoaded, forward(&tx));
        let _failed = self.events.once(Topic::LoadError, forward(&tx));

        let mut state = self.state.subscribe();
        let ready = state
            .wait_for(|s| *s != WorkerState::Spawning)
            .await
            .map(|s| *s)
            .unwrap_or(WorkerState::Exited);
        if ready == WorkerState::Exited {
            return Err(LoadError::Exited);
        }

        self.state.send_if_modified(|s| {
            let ready = *s == WorkerState::Ready;
            if ready {
                *s = WorkerState::Loading;
            }
            ready
        });
        tracing::info!(worker_id = %self.worker_id, import_path, "Loading module");
        send_frame(
            &self.writer,
            ControlRequest::LoadModule {
                import_path: import_path.to_string(),
            },
        )
        .await
        .map_err(LoadError::Send)?;

        let mut exit = self.exit_watch.subscribe();
        tokio::select! {
            biased;
            n = rx => match n {
                Ok(Notification::ModuleLoaded) => Ok(()),
                Ok(Notification::LoadError(e)) => Err(LoadError::Remote(e)),
                _ => Err(LoadError::Exited),
            },
            _ = exit.wait_for(Option::is_some) => Err(LoadError::Exited),
        }
    }

    /// Install controller functions callable by the worker. Later
    /// registrations replace earlier ones of the same name.
    pub fn register_callable_api(&self, api: FunctionTable) {
        for (name, f) in api {
            tracing::debug!(worker_id = %self.worker_id, function = %name, "Registering callable");
            self.api.insert(name, f);
        }
    }

    pub fn call_proxy(self: &Arc<Self>) -> CallProxy {
        CallProxy {
            controller: Arc::clone(self),
        }
    }

    /// Ask the worker to stop; kill it if it outlives the grace period.
    ///
    /// New calls fail with `Closed` from here on. Idempotent: later callers
    /// wait for the same exit.
    pub async fn terminate(&self) -> ExitInfo {
        if self.terminating.swap(true, Ordering::SeqCst) || self.exit_info().is_some() {
            return self.wait_exit().await;
        }
        self.drain_link();

        tracing::info!(worker_id = %self.worker_id, "Terminating worker");
        if let Err(e) = send_frame(&self.writer, ControlRequest::Terminate).await {
            tracing::debug!(worker_id = %self.worker_id, error = %e, "Terminate not delivered");
        }

        match tokio::time::timeout(self.config.grace_period, self.wait_exit()).await {
            Ok(info) => info,
            Err(_) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    grace_period = ?self.config.grace_period,
                    "Worker did not exit in time, killing"
                );
                self.kill();
                self.wait_exit().await
            }
        }
    }

    /// Force-kill without asking.
    pub fn kill(&self) {
        if let Some(tx) = lock(&self.kill_tx).take() {
            let _ = tx.send(());
        }
    }

    /// Invoke `cb` once with the exit info; immediately if already exited.
    pub fn on_exit<F>(&self, cb: F)
    where
        F: FnOnce(ExitInfo) + Send + 'static,
    {
        let exit = lock(&self.exit);
        if let Some(info) = exit.clone() {
            drop(exit);
            cb(info);
            return;
        }
        let cb = Mutex::new(Some(cb));
        self.events.on(Topic::Exited, move |n| {
            if let Notification::Exited(info) = n
                && let Some(cb) = lock(&cb).take()
            {
                cb(info);
            }
        });
    }

    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_watch.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(info) => info.clone().unwrap_or_default(),
            Err(_) => ExitInfo::default(),
        }
    }

    fn handle(&self, msg: WorkerMessage) {
        if msg.worker_id() != &self.worker_id {
            tracing::warn!(
                worker_id = %self.worker_id,
                sender = %msg.worker_id(),
                kind = msg.kind(),
                "Dropping message from another worker"
            );
            return;
        }

        match msg {
            WorkerMessage::SubprocessReady { .. } => {
                tracing::debug!(worker_id = %self.worker_id, "Worker ready");
                self.transition(WorkerState::Spawning, WorkerState::Ready);
                publish(&self.events, Notification::Ready);
            }
            WorkerMessage::ModuleLoaded { .. } => {
                tracing::info!(worker_id = %self.worker_id, "Module loaded");
                self.transition(WorkerState::Loading, WorkerState::Active);
                publish(&self.events, Notification::ModuleLoaded);
            }
            WorkerMessage::LoadError { error, .. } => {
                let error = RemoteError::from(error);
                tracing::error!(worker_id = %self.worker_id, %error, "Module failed to load");
                self.transition(WorkerState::Loading, WorkerState::LoadFailed);
                publish(&self.events, Notification::LoadError(error));
            }
            WorkerMessage::ActionResult {
                action_id, payload, ..
            } => publish(
                &self.events,
                Notification::CallResult {
                    action_id,
                    outcome: Ok(payload),
                },
            ),
            WorkerMessage::ActionError {
                action_id, error, ..
            } => publish(
                &self.events,
                Notification::CallResult {
                    action_id,
                    outcome: Err(error),
                },
            ),
            WorkerMessage::GetResult {
                action_id, payload, ..
            } => publish(
                &self.events,
                Notification::PropertyResult { action_id, payload },
            ),
            WorkerMessage::Invoke {
                action_id,
                function_name,
                args,
                ..
            } => {
                let function = self.api.get(&function_name).map(|f| Arc::clone(f.value()));
                let writer = Arc::clone(&self.writer);
                let worker_id = self.worker_id.clone();
                tokio::spawn(async move {
                    tracing::debug!(%worker_id, %action_id, function = %function_name, "Serving worker call");
                    let outcome = serve_call(function, &function_name, args).await;
                    if let Err(e) =
                        send_frame(&writer, ControlRequest::DeliverCallResult { action_id, outcome }).await
                    {
                        tracing::warn!(%worker_id, error = %e, "Failed to deliver call result");
                    }
                });
            }
            WorkerMessage::WorkerLog {
                target,
                level,
                message,
                ..
            } => emit_worker_log(&self.worker_id, &target, &level, &message),
        }
    }

    /// Stop accepting new calls; pending ones may still settle.
    fn drain_link(&self) {
        self.link.send_if_modified(|l| {
            let open = *l == Link::Open;
            if open {
                *l = Link::Draining;
            }
            open
        });
    }

    fn transition(&self, from: WorkerState, to: WorkerState) {
        self.state.send_if_modified(|s| {
            let matches = *s == from;
            if matches {
                *s = to;
            }
            matches
        });
    }

    async fn mark_exited(&self, info: ExitInfo) {
        self.drain_link();
        self.state.send_replace(WorkerState::Exited);
        // Results read before the channel closed settle before the rest reject.
        self.events.flush().await;
        self.link.send_replace(Link::Down);

        let mut exit = lock(&self.exit);
        *exit = Some(info.clone());
        self.exit_watch.send_replace(Some(info.clone()));
        publish(&self.events, Notification::Exited(info));
    }
}

async fn run_event_loop(
    this: Weak<WorkerController>,
    worker_id: WorkerId,
    mut reader: FrameReader<WorkerMessage>,
    mut process: Box<dyn WorkerProcess>,
    mut kill_rx: oneshot::Receiver<()>,
    stderr_task: Option<tokio::task::JoinHandle<String>>,
) {
    let mut kill_requested = false;

    loop {
        tokio::select! {
            biased;

            // Also fires when the controller is dropped.
            _ = &mut kill_rx => {
                kill_requested = true;
                tracing::debug!(%worker_id, "Killing worker");
                if let Err(e) = process.start_kill() {
                    tracing::warn!(%worker_id, error = %e, "Failed to kill worker");
                }
                break;
            }

            msg = reader.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        let Some(controller) = this.upgrade() else {
                            tracing::debug!(%worker_id, "Controller dropped, ignoring worker output");
                            continue;
                        };
                        controller.handle(msg);
                    }
                    Some(Err(e)) => {
                        // Nothing after a bad frame can be trusted; replies would never be read.
                        tracing::error!(%worker_id, error = %e, "Control channel error, killing worker");
                        kill_requested = true;
                        if let Err(e) = process.start_kill() {
                            tracing::warn!(%worker_id, error = %e, "Failed to kill worker");
                        }
                        break;
                    }
                    None => {
                        tracing::debug!(%worker_id, "Worker closed its output");
                        break;
                    }
                }
            }
        }
    }

    if let Some(controller) = this.upgrade() {
        controller.drain_link();
    }

    // Output closed but the process may linger; a kill still applies.
    let status = loop {
        tokio::select! {
            status = process.wait() => break status,
            _ = &mut kill_rx, if !kill_requested => kill_requested = true,
        }
        if let Err(e) = process.start_kill() {
            tracing::warn!(%worker_id, error = %e, "Failed to kill worker");
        }
    };
    let code = status.unwrap_or_else(|e| {
        tracing::warn!(%worker_id, error = %e, "Failed to wait for worker");
        None
    });

    let stderr = match stderr_task {
        Some(task) => match tokio::time::timeout(Duration::from_secs(1), task).await {
            Ok(Ok(tail)) => tail,
            _ => String::new(),
        },
        None => String::new(),
    };

    tracing::info!(%worker_id, ?code, "Worker exited");
    if let Some(controller) = this.upgrade() {
        controller.mark_exited(ExitInfo { code, stderr }).await;
    }
}

/// Log worker stderr line by line and keep its tail.
async fn capture_stderr(worker_id: WorkerId, stderr: BoxedReader) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(target: "proclet::worker_stderr", %worker_id, "{}", line);
                tail.push_str(&line);
                tail.push('\n');
                if tail.len() > STDERR_TAIL_BYTES {
                    let mut cut = tail.len() - STDERR_TAIL_BYTES;
                    while !tail.is_char_boundary(cut) {
                        cut += 1;
                    }
                    tail.drain(..cut);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%worker_id, error = %e, "Stopped reading worker stderr");
                break;
            }
        }
    }
    tail
}

/// Handle to one worker: calls, property reads, lifecycle.
#[derive(Clone)]
pub struct CallProxy {
    controller: Arc<WorkerController>,
}

impl CallProxy {
    pub fn worker_id(&self) -> &WorkerId {
        self.controller.worker_id()
    }

    pub fn state(&self) -> WorkerState {
        self.controller.state()
    }

    pub fn invoke(&self) -> Invoke {
        Invoke::new(Arc::clone(&self.controller.core))
    }

    pub fn get(&self) -> Get {
        Get::new(Arc::clone(&self.controller.core))
    }

    /// Compile `schema` into a method table bound to this worker.
    pub fn bind(&self, schema: &ApiSchema) -> BoundApi {
        schema.bind(&self.invoke(), &self.get())
    }

    pub fn register_callable_api(&self, api: FunctionTable) {
        self.controller.register_callable_api(api);
    }

    pub async fn terminate(&self) -> ExitInfo {
        self.controller.terminate().await
    }

    pub fn on_exit<F>(&self, cb: F)
    where
        F: FnOnce(ExitInfo) + Send + 'static,
    {
        self.controller.on_exit(cb);
    }

    pub async fn wait_exit(&self) -> ExitInfo {
        self.controller.wait_exit().await
    }
}

impl std::fmt::Debug for CallProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallProxy")
            .field("worker_id", self.worker_id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::registry::{Module, ModuleRegistry};
    use crate::schema::Arity;
    use crate::bridge::codec::JsonCodec;
    use crate::rpc::CallError;
    use crate::spawn::{CommandSpawner, InProcessSpawner, TaskProcess};
    use crate::value::Value;
    use futures::SinkExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new()
            .register("demo", |ctx| {
                Ok(Module::new()
                    .function("foo", |args: Vec<Value>| async move {
                        let s: String = args.iter().map(|a| a.to_string()).collect();
                        Ok(Value::from(s))
                    })
                    .function("bar", |_| async {
                        Err(RemoteError::named("TypeError", "bar always fails"))
                    })
                    .function("slow", |_| async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(Value::from("slow"))
                    })
                    .function("hang", |_| async {
                        std::future::pending::<()>().await;
                        Ok(Value::Null)
                    })
                    .function("quuz", move |args: Vec<Value>| {
                        let invoke = ctx.invoke().clone();
                        async move {
                            invoke
                                .call("loopback", args)
                                .await
                                .map_err(|e| RemoteError::new(e.to_string()))
                        }
                    })
                    .value("version", "2.0"))
            })
            .register("broken", |_| Err(RemoteError::new("Cannot load broken")))
    }

    /// A hand-driven worker: ready, then loads on request and nothing else.
    /// With `garbage_after_load` it follows module_loaded with an undecodable
    /// frame and stays alive.
    struct ScriptedSpawner {
        garbage_after_load: bool,
        loads: Arc<AtomicUsize>,
    }

    impl ScriptedSpawner {
        fn new(garbage_after_load: bool) -> Self {
            Self {
                garbage_after_load,
                loads: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl WorkerSpawner for ScriptedSpawner {
        fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
            let (controller_end, worker_end) = tokio::io::duplex(64 * 1024);
            let (worker_read, worker_write) = tokio::io::split(worker_end);
            let (controller_read, controller_write) = tokio::io::split(controller_end);
            let handle = tokio::spawn(script(
                worker_read,
                worker_write,
                request.worker_id.clone(),
                self.garbage_after_load,
                Arc::clone(&self.loads),
            ));
            Ok(SpawnedWorker {
                stdin: Box::pin(controller_write),
                stdout: Box::pin(controller_read),
                stderr: None,
                process: Box::new(TaskProcess::new(handle)),
            })
        }
    }

    async fn script(
        reader: ReadHalf<DuplexStream>,
        mut writer: WriteHalf<DuplexStream>,
        worker_id: WorkerId,
        garbage_after_load: bool,
        loads: Arc<AtomicUsize>,
    ) -> io::Result<()> {
        let mut requests = FramedRead::new(reader, JsonCodec::<ControlRequest>::new());
        write_msg(
            &mut writer,
            WorkerMessage::SubprocessReady {
                worker_id: worker_id.clone(),
            },
        )
        .await?;

        while let Some(request) = requests.next().await {
            match request? {
                ControlRequest::LoadModule { .. } => {
                    loads.fetch_add(1, Ordering::SeqCst);
                    write_msg(
                        &mut writer,
                        WorkerMessage::ModuleLoaded {
                            worker_id: worker_id.clone(),
                        },
                    )
                    .await?;
                    if garbage_after_load {
                        writer.write_all(&[0, 0, 0, 5]).await?;
                        writer.write_all(b"nope!").await?;
                    }
                }
                ControlRequest::Terminate => break,
                _ => {}
            }
        }
        Ok(())
    }

    async fn write_msg(writer: &mut WriteHalf<DuplexStream>, msg: WorkerMessage) -> io::Result<()> {
        FramedWrite::new(writer, JsonCodec::<WorkerMessage>::new())
            .send(msg)
            .await
    }

    fn spawn_scripted(spawner: &ScriptedSpawner) -> Arc<WorkerController> {
        WorkerController::spawn(
            spawner,
            SpawnRequest {
                app_id: "test.app".into(),
                worker_id: WorkerId::new("test.app", "5"),
            },
            ControllerConfig::default(),
        )
        .unwrap()
    }

    fn spawn_in_process(config: ControllerConfig) -> Arc<WorkerController> {
        WorkerController::spawn(
            &InProcessSpawner::new(registry()),
            SpawnRequest {
                app_id: "test.app".into(),
                worker_id: WorkerId::new("test.app", "1"),
            },
            config,
        )
        .unwrap()
    }

    async fn active() -> Arc<WorkerController> {
        let controller = spawn_in_process(ControllerConfig::default());
        controller.load_module("demo").await.unwrap();
        controller
    }

    #[tokio::test]
    async fn load_then_call() {
        let controller = active().await;
        assert_eq!(controller.state(), WorkerState::Active);

        let proxy = controller.call_proxy();
        let out = proxy.invoke().call("foo", args!["ab", 2]).await.unwrap();
        assert_eq!(out, Value::from("ab2"));

        let out = proxy.invoke().method("foo").call(args!["ab", 2]).await.unwrap();
        assert_eq!(out, Value::from("ab2"));
    }

    #[tokio::test]
    async fn second_load_is_rejected() {
        let controller = active().await;
        assert!(matches!(
            controller.load_module("demo").await,
            Err(LoadError::AlreadyRequested)
        ));
    }

    #[tokio::test]
    async fn failing_module_rejects_load() {
        let controller = spawn_in_process(ControllerConfig::default());
        let err = controller.load_module("broken").await.unwrap_err();

        let LoadError::Remote(remote) = err else {
            panic!("expected remote load error");
        };
        assert_eq!(remote.message, "Cannot load broken");
        assert_eq!(controller.state(), WorkerState::LoadFailed);
        assert!(controller.exit_info().is_none());
    }

    #[tokio::test]
    async fn thrown_error_rejects_with_message() {
        let proxy = active().await.call_proxy();
        let err = proxy.invoke().call("bar", args![]).await.unwrap_err();
        let remote = err.remote().unwrap();
        assert_eq!(remote.name, "TypeError");
        assert_eq!(remote.message, "bar always fails");
    }

    #[tokio::test]
    async fn fast_call_settles_before_slow_one() {
        let proxy = active().await.call_proxy();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (p1, o1) = (proxy.clone(), Arc::clone(&order));
        let slow = tokio::spawn(async move {
            p1.invoke().call("slow", args![]).await.unwrap();
            lock(&o1).push("slow");
        });
        tokio::task::yield_now().await;
        proxy.invoke().call("foo", args!["x"]).await.unwrap();
        lock(&order).push("fast");
        slow.await.unwrap();

        assert_eq!(*lock(&order), vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn loopback_through_controller_api() {
        let controller = spawn_in_process(ControllerConfig::default());
        controller.register_callable_api(FunctionTable::new().function(
            "loopback",
            |args: Vec<Value>| async move {
                let s = args[0].as_str().unwrap_or_default();
                Ok(Value::from(format!("{s}{s}")))
            },
        ));
        controller.load_module("demo").await.unwrap();

        let out = controller
            .call_proxy()
            .invoke()
            .call("quuz", args!["ab"])
            .await
            .unwrap();
        assert_eq!(out, Value::from("abab"));
    }

    #[tokio::test]
    async fn unregistered_controller_function_rejects_worker_call() {
        let proxy = active().await.call_proxy();
        let err = proxy.invoke().call("quuz", args!["ab"]).await.unwrap_err();
        assert!(err.remote().unwrap().message.contains("'loopback' cannot be called."));
    }

    #[tokio::test]
    async fn get_reads_exports() {
        let proxy = active().await.call_proxy();
        assert_eq!(proxy.get().fetch("version").await.unwrap(), Value::from("2.0"));

        let err = proxy.get().property("foo").fetch().await.unwrap_err();
        assert_eq!(err.to_string(), "Unable to access 'foo'");
    }

    #[tokio::test]
    async fn bound_api_checks_names_and_arity() {
        let proxy = active().await.call_proxy();
        let api = proxy.bind(
            &ApiSchema::new()
                .method("foo", Arity::Exact(2))
                .property("version"),
        );

        assert_eq!(api.call("foo", args!["a", "b"]).await.unwrap(), Value::from("ab"));
        assert!(matches!(
            api.call("foo", args!["a"]).await,
            Err(CallError::Arity { got: 1, .. })
        ));
        assert!(matches!(
            api.call("nope", args![]).await,
            Err(CallError::UnknownMethod(_))
        ));
        assert_eq!(api.get("version").await.unwrap(), Value::from("2.0"));
    }

    #[tokio::test]
    async fn terminate_exits_and_closes_calls() {
        let controller = active().await;
        let proxy = controller.call_proxy();

        let info = proxy.terminate().await;
        assert_eq!(info.code, Some(0));
        assert_eq!(proxy.state(), WorkerState::Exited);
        assert!(matches!(
            proxy.invoke().call("foo", args![]).await,
            Err(CallError::Closed)
        ));

        // idempotent
        assert_eq!(proxy.terminate().await, info);
    }

    #[tokio::test]
    async fn pending_call_rejects_when_worker_is_killed() {
        let controller = active().await;
        let proxy = controller.call_proxy();

        let p = proxy.clone();
        let pending = tokio::spawn(async move { p.invoke().call("hang", args![]).await });
        tokio::task::yield_now().await;
        controller.kill();

        assert!(matches!(
            pending.await.unwrap(),
            Err(CallError::Disconnected)
        ));
        assert_eq!(controller.wait_exit().await.code, None);
    }

    #[tokio::test]
    async fn on_exit_fires_once_even_after_exit() {
        let controller = active().await;
        let (tx, rx) = oneshot::channel();
        controller.on_exit(move |info| {
            let _ = tx.send(info);
        });
        controller.terminate().await;
        assert_eq!(rx.await.unwrap().code, Some(0));

        let (tx, rx) = oneshot::channel();
        controller.on_exit(move |info| {
            let _ = tx.send(info);
        });
        assert_eq!(rx.await.unwrap().code, Some(0));
    }

    #[tokio::test]
    async fn load_after_ready_is_sent_once() {
        let spawner = ScriptedSpawner::new(false);
        let controller = spawn_scripted(&spawner);

        let mut state = controller.state.subscribe();
        state
            .wait_for(|s| *s == WorkerState::Ready)
            .await
            .unwrap();
        controller.load_module("demo").await.unwrap();
        assert_eq!(controller.state(), WorkerState::Active);

        assert_eq!(controller.terminate().await.code, Some(0));
        assert_eq!(spawner.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn load_before_ready_is_sent_once() {
        let spawner = ScriptedSpawner::new(false);
        let controller = spawn_scripted(&spawner);

        controller.load_module("demo").await.unwrap();
        assert_eq!(controller.state(), WorkerState::Active);

        controller.terminate().await;
        assert_eq!(spawner.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_frame_kills_worker_and_settles_calls() {
        let spawner = ScriptedSpawner::new(true);
        let controller = spawn_scripted(&spawner);
        controller.load_module("demo").await.unwrap();

        let invoke = controller.call_proxy().invoke();
        let call = invoke.call("foo", args![]);
        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("call must settle once the channel is corrupt");
        assert!(matches!(
            result,
            Err(CallError::Disconnected | CallError::Closed)
        ));

        assert_eq!(controller.wait_exit().await.code, None);
        assert_eq!(controller.state(), WorkerState::Exited);
    }

    #[tokio::test]
    async fn calls_close_as_soon_as_exit_is_observed() {
        let controller = active().await;
        let mut state = controller.state.subscribe();
        controller.kill();

        state
            .wait_for(|s| *s == WorkerState::Exited)
            .await
            .unwrap();
        assert!(matches!(
            controller.call_proxy().invoke().call("foo", args![]).await,
            Err(CallError::Closed)
        ));
    }

    #[tokio::test]
    async fn kill_before_ready_fails_load() {
        let controller = spawn_in_process(ControllerConfig::default());
        controller.kill();
        assert!(matches!(
            controller.load_module("demo").await,
            Err(LoadError::Exited)
        ));
        assert_eq!(controller.state(), WorkerState::Exited);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_worker_times_out_load() {
        let controller = WorkerController::spawn(
            &CommandSpawner::new("sleep").arg("5"),
            SpawnRequest {
                app_id: "test.app".into(),
                worker_id: WorkerId::new("test.app", "8"),
            },
            ControllerConfig {
                load_timeout: Duration::from_millis(50),
                grace_period: Duration::from_millis(50),
                ..ControllerConfig::default()
            },
        )
        .unwrap();

        assert!(matches!(
            controller.load_module("demo").await,
            Err(LoadError::Timeout(_))
        ));
        assert_eq!(controller.state(), WorkerState::Spawning);
        assert_eq!(controller.terminate().await.code, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashed_process_reports_code_and_stderr() {
        let spawner = CommandSpawner::new("sh")
            .arg("-c")
            .arg("echo something broke >&2; exit 3");
        let controller = WorkerController::spawn(
            &spawner,
            SpawnRequest {
                app_id: "test.app".into(),
                worker_id: WorkerId::new("test.app", "7"),
            },
            ControllerConfig::default(),
        )
        .unwrap();

        assert!(matches!(
            controller.load_module("demo").await,
            Err(LoadError::Exited)
        ));
        let info = controller.wait_exit().await;
        assert_eq!(info.code, Some(3));
        assert_eq!(info.stderr, "something broke\n");
        assert!(matches!(
            controller.call_proxy().invoke().call("foo", args![]).await,
            Err(CallError::Closed)
        ));
    }
}
