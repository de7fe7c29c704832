//! proclet: a controller that spawns worker processes, loads a module into
//! each, and calls across the process boundary in both directions.

mod emitter;
mod events;
mod id;
mod registry;
mod rpc;
mod schema;

pub mod bridge;
pub mod controller;
pub mod cyclic;
pub mod error;
pub mod server;
pub mod spawn;
pub mod value;
pub mod worker;
mod worker_tracing_layer;

pub use controller::{CallProxy, ControllerConfig, LoadError, WorkerController, WorkerState};
pub use cyclic::{CodecError, CycleRef, Envelope, PathSegment};
pub use emitter::{EventEmitter, ListenerGuard, ListenerId};
pub use error::RemoteError;
pub use events::ExitInfo;
pub use id::{ActionId, IdGenerator, WorkerId};
pub use registry::{Export, FunctionTable, Module, ModuleLoader, ModuleRegistry, RemoteFn, remote_fn};
pub use rpc::{CallError, Get, Invoke, RemoteMethod, RemoteProperty};
pub use schema::{ApiSchema, Arity, BoundApi};
pub use server::{Server, ServerConfig, ServerError};
pub use spawn::{CommandSpawner, InProcessSpawner, SpawnError, SpawnRequest, WorkerSpawner};
pub use value::{ArrayRef, ObjectRef, Value};
pub use worker::{WorkerConfig, WorkerContext, run_worker, run_worker_on};
pub use worker_tracing_layer::{LOG_ENV, LogRecord, WorkerTracingLayer, init_worker_tracing};
