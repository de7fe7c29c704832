//! Server - creates workers and tracks the live ones.
//!
//! Each worker id is `{identity}.client{n}`, with `n` from a counter private
//! to this server. A worker leaves the registry when it exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;

use crate::controller::{CallProxy, ControllerConfig, LoadError, WorkerController};
use crate::id::{IdGenerator, WorkerId};
use crate::registry::FunctionTable;
use crate::spawn::{SpawnError, SpawnRequest, WorkerSpawner};

#[derive(Clone)]
pub struct ServerConfig {
    spawner: Arc<dyn WorkerSpawner>,
    controller: ControllerConfig,
}

impl ServerConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            controller: ControllerConfig::default(),
        }
    }

    /// Time a worker gets to exit after Terminate before it is killed.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.controller.grace_period = grace;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.controller.load_timeout = timeout;
        self
    }

    /// Reject calls that get no response in time. Off by default.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.controller.call_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("worker {worker_id} failed to load its module")]
    Load {
        worker_id: WorkerId,
        #[source]
        source: LoadError,
    },
    #[error("server is closed")]
    Closed,
}

struct ServerInner {
    identity: String,
    config: ServerConfig,
    ids: IdGenerator,
    workers: DashMap<WorkerId, Arc<WorkerController>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn start(identity: impl Into<String>, config: ServerConfig) -> Self {
        let identity = identity.into();
        tracing::info!(%identity, "Server started");
        Self {
            inner: Arc::new(ServerInner {
                identity,
                config,
                ids: IdGenerator::new(),
                workers: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Spawn a worker, install `api` for it, and load `entrypoint`.
    ///
    /// The API is in place before the module loads, so module code may call
    /// it during load. A worker whose load fails stays registered until it
    /// exits.
    pub async fn create_client(
        &self,
        entrypoint: &str,
        api: Option<FunctionTable>,
    ) -> Result<CallProxy, ServerError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ServerError::Closed);
        }

        let worker_id = WorkerId::new(&self.inner.identity, &self.inner.ids.next_id());
        let controller = WorkerController::spawn(
            self.inner.config.spawner.as_ref(),
            SpawnRequest {
                app_id: self.inner.identity.clone(),
                worker_id: worker_id.clone(),
            },
            self.inner.config.controller.clone(),
        )?;
        self.inner
            .workers
            .insert(worker_id.clone(), Arc::clone(&controller));

        let registry: Weak<ServerInner> = Arc::downgrade(&self.inner);
        let exited_id = worker_id.clone();
        controller.on_exit(move |info| {
            tracing::debug!(worker_id = %exited_id, code = ?info.code, "Removing exited worker");
            if let Some(inner) = registry.upgrade() {
                inner.workers.remove(&exited_id);
            }
        });

        if let Some(api) = api {
            controller.register_callable_api(api);
        }

        controller
            .load_module(entrypoint)
            .await
            .map_err(|source| ServerError::Load {
                worker_id: worker_id.clone(),
                source,
            })?;

        tracing::info!(%worker_id, entrypoint, "Client ready");
        Ok(controller.call_proxy())
    }

    pub fn worker(&self, worker_id: &WorkerId) -> Option<CallProxy> {
        self.inner.workers.get(worker_id).map(|c| c.call_proxy())
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.inner.workers.iter().map(|e| e.key().clone()).collect()
    }

    /// Terminate every live worker. Later `create_client` calls fail.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let workers: Vec<_> = self
            .inner
            .workers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        tracing::info!(identity = %self.inner.identity, workers = workers.len(), "Closing server");
        futures::future::join_all(workers.iter().map(|w| w.terminate())).await;
    }
}
