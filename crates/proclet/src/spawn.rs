//! Worker spawn strategies.
//!
//! A spawner hands the controller three pipes and a process handle. The
//! controller does not care whether the worker is a real subprocess
//! ([`CommandSpawner`]) or a task on the current runtime ([`InProcessSpawner`]).

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::bridge::{BoxedReader, BoxedWriter};
use crate::id::WorkerId;
use crate::registry::ModuleLoader;
use crate::worker::{WORKER_ID_ENV, run_worker_on};

/// Environment variable carrying the controller's identity to the worker.
pub const APP_ID_ENV: &str = "PROCLET_APP_ID";

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub app_id: String,
    pub worker_id: WorkerId,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("{0} not captured")]
    MissingPipe(&'static str),
}

/// Exit tracking and forced termination for one spawned worker.
#[async_trait]
pub trait WorkerProcess: Send {
    /// Wait for the worker to end. `None` when it was killed by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    fn start_kill(&mut self) -> io::Result<()>;

    fn id(&self) -> Option<u32> {
        None
    }
}

pub struct SpawnedWorker {
    /// Controller-to-worker frames.
    pub stdin: BoxedWriter,
    /// Worker-to-controller frames.
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub process: Box<dyn WorkerProcess>,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedWorker, SpawnError>;
}

/// Runs a worker binary as a subprocess.
///
/// The worker id and app id are passed in [`WORKER_ID_ENV`] and
/// [`APP_ID_ENV`]; stdio is piped.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(APP_ID_ENV, &request.app_id)
            .env(WORKER_ID_ENV, request.worker_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        tracing::debug!(
            worker_id = %request.worker_id,
            pid = child.id(),
            program = %self.program.display(),
            "Spawned worker process"
        );

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().map(|s| Box::pin(s) as BoxedReader);

        Ok(SpawnedWorker {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr,
            process: Box::new(ChildProcess(child)),
        })
    }
}

struct ChildProcess(Child);

#[async_trait]
impl WorkerProcess for ChildProcess {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.0.start_kill()
    }

    fn id(&self) -> Option<u32> {
        self.0.id()
    }
}

/// Runs the worker runtime as a task over an in-memory pipe.
pub struct InProcessSpawner {
    loader: Arc<dyn ModuleLoader>,
    buffer_size: usize,
}

impl InProcessSpawner {
    pub fn new(loader: impl ModuleLoader) -> Self {
        Self {
            loader: Arc::new(loader),
            buffer_size: 64 * 1024,
        }
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
        let (controller_end, worker_end) = tokio::io::duplex(self.buffer_size);
        let (worker_read, worker_write) = tokio::io::split(worker_end);
        let (controller_read, controller_write) = tokio::io::split(controller_end);

        let loader = Arc::clone(&self.loader);
        let worker_id = request.worker_id.clone();
        let handle = tokio::spawn(async move {
            run_worker_on(Box::pin(worker_read), Box::pin(worker_write), loader, worker_id).await
        });

        Ok(SpawnedWorker {
            stdin: Box::pin(controller_write),
            stdout: Box::pin(controller_read),
            stderr: None,
            process: Box::new(TaskProcess::new(handle)),
        })
    }
}

/// A worker running as a task: `Ok` exits 0, `Err` exits 1, a panic exits
/// 101, and an aborted task reports no code.
pub(crate) struct TaskProcess {
    handle: JoinHandle<io::Result<()>>,
    exit: Option<Option<i32>>,
}

impl TaskProcess {
    pub(crate) fn new(handle: JoinHandle<io::Result<()>>) -> Self {
        Self { handle, exit: None }
    }
}

#[async_trait]
impl WorkerProcess for TaskProcess {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        let code = match (&mut self.handle).await {
            Ok(Ok(())) => Some(0),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "In-process worker failed");
                Some(1)
            }
            Err(e) if e.is_cancelled() => None,
            Err(_) => Some(101),
        };
        self.exit = Some(code);
        Ok(code)
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.handle.abort();
        Ok(())
    }
}
