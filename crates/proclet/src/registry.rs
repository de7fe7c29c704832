//! Callable surfaces: the controller's exposed API and the worker's loaded
//! module.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;

use crate::bridge::protocol::CallOutcome;
use crate::cyclic::Envelope;
use crate::error::{RemoteError, panic_envelope};
use crate::value::Value;
use crate::worker::WorkerContext;

/// A function callable from the other side of the channel.
pub type RemoteFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>;

pub fn remote_fn<F, Fut>(f: F) -> RemoteFn
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

/// Named functions, in registration order. Re-registering a name replaces it.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: IndexMap<String, RemoteFn>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        self.insert(name, remote_fn(f));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, f: RemoteFn) -> Option<RemoteFn> {
        self.functions.insert(name.into(), f)
    }

    pub fn get(&self, name: &str) -> Option<RemoteFn> {
        self.functions.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl IntoIterator for FunctionTable {
    type Item = (String, RemoteFn);
    type IntoIter = indexmap::map::IntoIter<String, RemoteFn>;

    fn into_iter(self) -> Self::IntoIter {
        self.functions.into_iter()
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.functions.keys()).finish()
    }
}

pub enum Export {
    Function(RemoteFn),
    Value(Value),
}

/// A loaded worker module: named exports in declaration order.
#[derive(Default)]
pub struct Module {
    exports: IndexMap<String, Export>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        self.exports
            .insert(name.into(), Export::Function(remote_fn(f)));
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.exports
            .insert(name.into(), Export::Value(value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    /// The callable export named `name`, if it is a function.
    pub fn callable(&self, name: &str) -> Option<RemoteFn> {
        match self.exports.get(name) {
            Some(Export::Function(f)) => Some(Arc::clone(f)),
            _ => None,
        }
    }

    /// The plain value export named `name`. Functions are not readable.
    pub fn readable(&self, name: &str) -> Option<Value> {
        match self.exports.get(name) {
            Some(Export::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.exports.keys().map(String::as_str)
    }
}

/// Resolves an import path to a module inside the worker.
#[async_trait]
pub trait ModuleLoader: Send + Sync + 'static {
    async fn load(&self, import_path: &str, ctx: WorkerContext) -> Result<Module, RemoteError>;
}

type Factory = Box<dyn Fn(WorkerContext) -> Result<Module, RemoteError> + Send + Sync>;

/// Modules compiled into the worker binary, keyed by import path.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, Factory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, import_path: impl Into<String>, factory: F) -> Self
    where
        F: Fn(WorkerContext) -> Result<Module, RemoteError> + Send + Sync + 'static,
    {
        self.factories.insert(import_path.into(), Box::new(factory));
        self
    }
}

#[async_trait]
impl ModuleLoader for ModuleRegistry {
    async fn load(&self, import_path: &str, ctx: WorkerContext) -> Result<Module, RemoteError> {
        let factory = self.factories.get(import_path).ok_or_else(|| {
            RemoteError::new(format!("Cannot find module '{import_path}'"))
        })?;
        factory(ctx)
    }
}

/// Run one inbound call against `function` and settle it.
///
/// Every failure is folded into the outcome: a missing function, undecodable
/// arguments, an error return, a panic, or an unencodable result.
pub(crate) async fn serve_call(
    function: Option<RemoteFn>,
    name: &str,
    args: Envelope,
) -> CallOutcome {
    let Some(function) = function else {
        return failure(RemoteError::new(format!("'{name}' cannot be called.")));
    };
    let result = AssertUnwindSafe(async move {
        let args = args
            .decode_args()
            .map_err(|e| RemoteError::named("CodecError", e.to_string()))?;
        function(args).await
    })
    .catch_unwind()
    .await;

    match result {
        Ok(Ok(value)) => match Envelope::encode(&value) {
            Ok(payload) => CallOutcome::Success { payload },
            Err(e) => failure(RemoteError::named("CodecError", e.to_string())),
        },
        Ok(Err(error)) => failure(error),
        Err(panic) => {
            let error = panic_envelope(panic);
            tracing::warn!(function = name, panic = ?error.error, "Remote function panicked");
            CallOutcome::Failure { error }
        }
    }
}

fn failure(error: RemoteError) -> CallOutcome {
    CallOutcome::Failure {
        error: error.to_envelope(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::bridge::protocol::ErrorEnvelope;

    fn decode(outcome: CallOutcome) -> Result<Value, ErrorEnvelope> {
        match outcome {
            CallOutcome::Success { payload } => Ok(payload.decode().unwrap()),
            CallOutcome::Failure { error } => Err(error),
        }
    }

    fn concat() -> RemoteFn {
        remote_fn(|args: Vec<Value>| async move {
            let s: String = args.iter().map(|a| a.to_string()).collect();
            Ok(Value::from(s))
        })
    }

    #[tokio::test]
    async fn serve_call_returns_value() {
        let args = Envelope::encode_args(&args!["a", "b"]).unwrap();
        let out = decode(serve_call(Some(concat()), "concat", args).await);
        assert_eq!(out, Ok(Value::from("ab")));
    }

    #[tokio::test]
    async fn missing_function_is_per_call_error() {
        let out = decode(serve_call(None, "nope", Envelope::encode_args(&[]).unwrap()).await);
        let err = RemoteError::from(out.unwrap_err());
        assert_eq!(err.message, "'nope' cannot be called.");
    }

    #[tokio::test]
    async fn error_return_keeps_name_and_message() {
        let f = remote_fn(|_| async { Err(RemoteError::named("RangeError", "too big")) });
        let out = decode(serve_call(Some(f), "f", Envelope::encode_args(&[]).unwrap()).await);
        let err = RemoteError::from(out.unwrap_err());
        assert_eq!((err.name.as_str(), err.message.as_str()), ("RangeError", "too big"));
    }

    #[tokio::test]
    async fn panic_becomes_bare_error() {
        let f = remote_fn(|_| async {
            if true {
                panic!("exploded");
            }
            Ok(Value::Null)
        });
        let out = decode(serve_call(Some(f), "f", Envelope::encode_args(&[]).unwrap()).await);
        assert_eq!(out.unwrap_err(), ErrorEnvelope::bare("exploded"));
    }

    #[tokio::test]
    async fn malformed_args_settle_as_codec_error() {
        let args = Envelope::from_text(r#"{"data":[1],"cycleRefs":[[[18446744073709551615],[]]]}"#)
            .unwrap();
        let task = tokio::spawn(serve_call(Some(concat()), "concat", args));

        let err = decode(task.await.unwrap()).unwrap_err();
        assert_eq!(err.name.as_deref(), Some("CodecError"));
        assert!(err.message.unwrap().contains("invalid"));
    }

    #[test]
    fn later_registration_wins() {
        let mut table = FunctionTable::new().function("f", |_| async { Ok(Value::from(1)) });
        table.insert("f", concat());
        table.insert("g", concat());
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["f", "g"]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn module_exports_split_by_kind() {
        let module = Module::new()
            .function("run", |_| async { Ok(Value::Null) })
            .value("version", "1.2.3");

        assert!(module.callable("run").is_some());
        assert!(module.readable("run").is_none());
        assert!(module.callable("version").is_none());
        assert_eq!(module.readable("version"), Some(Value::from("1.2.3")));
        assert_eq!(module.export_names().collect::<Vec<_>>(), vec!["run", "version"]);
    }
}
