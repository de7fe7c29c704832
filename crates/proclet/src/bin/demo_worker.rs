//! Demo worker: the modules used by the integration tests and examples.
//!
//! Usage: proclet-demo-worker [worker_id]
//! The worker id may also come from PROCLET_WORKER_ID. Frames are read from
//! stdin and written to stdout; logs go to the controller as worker_log frames.

use std::time::Duration;

use anyhow::Context;
use proclet::{Module, ModuleRegistry, RemoteError, Value, WorkerConfig, WorkerContext};

fn demo(ctx: WorkerContext) -> Result<Module, RemoteError> {
    tracing::info!(worker_id = %ctx.worker_id(), "Building demo module");
    let invoke = ctx.invoke().clone();

    // Self-referencing nodes are never freed, so build one per module and share it.
    let cyclic = Value::object([("name", Value::from("root"))]);
    if let Some(obj) = cyclic.as_object() {
        obj.insert("self", cyclic.clone());
    }

    Ok(Module::new()
        .function("foo", |args: Vec<Value>| async move {
            let joined: String = args.iter().map(|a| a.to_string()).collect();
            Ok(Value::from(joined))
        })
        .function("bar", |_| async {
            Err(RemoteError::named("TypeError", "bar is not implemented"))
        })
        .function("baz", |args: Vec<Value>| async move {
            Ok(Value::object([
                ("count", Value::from(args.len() as i64)),
                ("args", Value::array(args)),
            ]))
        })
        .function("qux", |args: Vec<Value>| async move {
            let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
            Ok(Value::from(sum))
        })
        .function("quux", |_| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(Value::from("slow"))
        })
        .function("quuz", move |args: Vec<Value>| {
            let invoke = invoke.clone();
            async move {
                tracing::debug!(args = args.len(), "Calling back into the controller");
                invoke
                    .call("loopback", args)
                    .await
                    .map_err(|e| RemoteError::named("LoopbackError", e.to_string()))
            }
        })
        .function("echo", |args: Vec<Value>| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
        .function("cyclic", move |_| {
            let node = cyclic.clone();
            async move { Ok(node) }
        })
        .function("crash", |_| async { crash(7) })
        .function("panic", |_| async { explode() })
        .value("version", env!("CARGO_PKG_VERSION")))
}

fn crash(code: i32) -> Result<Value, RemoteError> {
    tracing::error!(code, "Crashing on request");
    std::process::exit(code)
}

fn explode() -> Result<Value, RemoteError> {
    panic!("demo panic")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_records = proclet::init_worker_tracing(1024);
    let config = WorkerConfig::from_env()
        .context("demo worker needs a worker id")?
        .with_log_records(log_records);

    let modules = ModuleRegistry::new()
        .register("demo", demo)
        .register("broken", |_| {
            Err(RemoteError::named("SyntaxError", "Unexpected token in broken module"))
        });

    proclet::run_worker(modules, config)
        .await
        .context("worker runtime failed")
}
