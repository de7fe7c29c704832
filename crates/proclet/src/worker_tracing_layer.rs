//! Log forwarding from worker to controller.
//!
//! Inside the worker, [`WorkerTracingLayer`] turns tracing events into
//! [`LogRecord`]s that the runtime ships as `worker_log` frames. The
//! controller re-emits each frame through its own subscriber with
//! [`emit_worker_log`], preserving target and level.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use tokio::sync::mpsc;
use tracing::callsite::{Callsite, Identifier};
use tracing::field::FieldSet;
use tracing::{Level, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::protocol::WorkerMessage;
use crate::id::WorkerId;

/// Targets never forwarded: encoding a forwarded record logs again.
const SUPPRESSED_TARGET_PREFIX: &str = "proclet::bridge";

/// Env var read by [`init_worker_tracing`], before `RUST_LOG`.
pub const LOG_ENV: &str = "PROCLET_LOG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub target: String,
    pub level: String,
    pub message: String,
}

impl LogRecord {
    pub(crate) fn into_message(self, worker_id: &WorkerId) -> WorkerMessage {
        WorkerMessage::WorkerLog {
            worker_id: worker_id.clone(),
            target: self.target,
            level: self.level,
            message: self.message,
        }
    }
}

pub struct WorkerTracingLayer {
    tx: mpsc::Sender<LogRecord>,
}

impl WorkerTracingLayer {
    pub fn new(tx: mpsc::Sender<LogRecord>) -> Self {
        Self { tx }
    }

    fn level_to_string(level: &Level) -> &'static str {
        match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    }
}

impl<S> Layer<S> for WorkerTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target.starts_with(SUPPRESSED_TARGET_PREFIX) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        // Dropped when the channel is full; logging never blocks the worker.
        let _ = self.tx.try_send(LogRecord {
            target: target.to_string(),
            level: Self::level_to_string(metadata.level()).to_string(),
            message: visitor.finish(),
        });
    }
}

/// Collects the message plus any other fields as `key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let fields = self.fields.join(" ");
        if self.message.is_empty() {
            fields
        } else {
            format!("{} {}", self.message, fields)
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }
}

/// Install the worker-side subscriber: env filter plus forwarding layer.
///
/// Returns the receiving end for [`crate::WorkerConfig::with_log_records`].
pub fn init_worker_tracing(capacity: usize) -> mpsc::Receiver<LogRecord> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let (tx, rx) = mpsc::channel(capacity);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(WorkerTracingLayer::new(tx))
        .try_init();
    rx
}

struct ForwardedCallsite;

impl Callsite for ForwardedCallsite {
    fn set_interest(&self, _: tracing::subscriber::Interest) {}
    fn metadata(&self) -> &Metadata<'static> {
        &FORWARDED_METADATA
    }
}

static FORWARDED_CALLSITE: ForwardedCallsite = ForwardedCallsite;
const FORWARDED_FIELDS: &[&str] = &["message", "worker_id"];
static FORWARDED_METADATA: Metadata<'static> = Metadata::new(
    "worker_log",
    "proclet::worker",
    Level::INFO,
    None,
    None,
    None,
    FieldSet::new(FORWARDED_FIELDS, Identifier(&FORWARDED_CALLSITE)),
    tracing::metadata::Kind::EVENT,
);

fn parse_level(level: &str) -> Level {
    match level {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Metadata for a forwarded (target, level), built once and kept for the
/// life of the process.
fn forwarded_metadata(target: &str, level: Level) -> &'static Metadata<'static> {
    static CALLSITES: OnceLock<Mutex<HashMap<(String, Level), &'static Metadata<'static>>>> =
        OnceLock::new();

    let mut map = CALLSITES
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    map.entry((target.to_string(), level)).or_insert_with(|| {
        let target: &'static str = Box::leak(target.to_string().into_boxed_str());
        Box::leak(Box::new(Metadata::new(
            "worker_log",
            target,
            level,
            Some(file!()),
            Some(line!()),
            Some(module_path!()),
            FieldSet::new(FORWARDED_FIELDS, Identifier(&FORWARDED_CALLSITE)),
            tracing::metadata::Kind::EVENT,
        )))
    })
}

/// Re-emit a worker's log record under its original target and level.
pub(crate) fn emit_worker_log(worker_id: &WorkerId, target: &str, level: &str, msg: &str) {
    let meta = forwarded_metadata(target, parse_level(level));
    let worker_id = worker_id.as_str();

    tracing::dispatcher::get_default(|dispatch| {
        if !dispatch.enabled(meta) {
            return;
        }
        let fields = meta.fields();
        if let (Some(message), Some(id)) = (fields.field("message"), fields.field("worker_id")) {
            let values = [
                (&message, Some(&msg as &dyn tracing::Value)),
                (&id, Some(&worker_id as &dyn tracing::Value)),
            ];
            dispatch.event(&tracing::Event::new(meta, &fields.value_set(&values)));
        }
    });
}
