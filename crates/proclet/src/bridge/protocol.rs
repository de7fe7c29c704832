//! Wire protocol types for controller-worker communication.
//!
//! One channel per worker: the child's stdin carries [`ControlRequest`]s,
//! its stdout carries [`WorkerMessage`]s. Every frame is a JSON object tagged
//! by `"type"`. Argument and result values travel as [`Envelope`]s so that
//! shared and cyclic references survive the trip.

use serde::{Deserialize, Serialize};

use crate::cyclic::Envelope;
use crate::id::{ActionId, WorkerId};

/// Messages from controller to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    LoadModule {
        import_path: String,
    },

    Terminate,

    /// Settles a call the worker issued with [`WorkerMessage::Invoke`].
    DeliverCallResult {
        action_id: ActionId,
        outcome: CallOutcome,
    },

    Invoke {
        action_id: ActionId,
        function_name: String,
        args: Envelope,
    },

    /// Read a non-function export of the loaded module.
    Get {
        action_id: ActionId,
        export_name: String,
    },
}

/// Messages from worker to controller. Each carries the sender's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    SubprocessReady {
        worker_id: WorkerId,
    },

    ModuleLoaded {
        worker_id: WorkerId,
    },

    LoadError {
        worker_id: WorkerId,
        error: ErrorEnvelope,
    },

    ActionResult {
        worker_id: WorkerId,
        action_id: ActionId,
        payload: Envelope,
    },

    ActionError {
        worker_id: WorkerId,
        action_id: ActionId,
        error: ErrorEnvelope,
    },

    /// `payload` is absent when the export is missing or is a function.
    GetResult {
        worker_id: WorkerId,
        action_id: ActionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Envelope>,
    },

    /// A call from the worker into the controller's registered API.
    Invoke {
        worker_id: WorkerId,
        action_id: ActionId,
        function_name: String,
        args: Envelope,
    },

    /// Worker tracing event (Rust structured logging).
    WorkerLog {
        worker_id: WorkerId,
        target: String,
        level: String,
        message: String,
    },
}

impl WorkerMessage {
    pub fn worker_id(&self) -> &WorkerId {
        match self {
            Self::SubprocessReady { worker_id }
            | Self::ModuleLoaded { worker_id }
            | Self::LoadError { worker_id, .. }
            | Self::ActionResult { worker_id, .. }
            | Self::ActionError { worker_id, .. }
            | Self::GetResult { worker_id, .. }
            | Self::Invoke { worker_id, .. }
            | Self::WorkerLog { worker_id, .. } => worker_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SubprocessReady { .. } => "subprocess_ready",
            Self::ModuleLoaded { .. } => "module_loaded",
            Self::LoadError { .. } => "load_error",
            Self::ActionResult { .. } => "action_result",
            Self::ActionError { .. } => "action_error",
            Self::GetResult { .. } => "get_result",
            Self::Invoke { .. } => "invoke",
            Self::WorkerLog { .. } => "worker_log",
        }
    }
}

/// Settlement of one remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Success { payload: Envelope },
    Failure { error: ErrorEnvelope },
}

/// Wire form of a failure raised by the callee.
///
/// `{name, message, stack}` for a structured error, `{error}` for anything
/// else (a panic payload, a bare string).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ErrorEnvelope {
    pub fn bare(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::value::{ObjectRef, Value};

    fn wid() -> WorkerId {
        WorkerId::from("org.example.app.client1")
    }

    #[test]
    fn load_module_serializes() {
        let req = ControlRequest::LoadModule {
            import_path: "demo".to_string(),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "load_module",
          "import_path": "demo"
        }
        "#);
    }

    #[test]
    fn terminate_serializes() {
        insta::assert_json_snapshot!(ControlRequest::Terminate, @r#"
        {
          "type": "terminate"
        }
        "#);
    }

    #[test]
    fn invoke_request_serializes() {
        let req = ControlRequest::Invoke {
            action_id: ActionId::from("7"),
            function_name: "foo".to_string(),
            args: Envelope::encode_args(&args!["ab", 2]).unwrap(),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "invoke",
          "action_id": "7",
          "function_name": "foo",
          "args": {
            "data": [
              "ab",
              2
            ],
            "cycleRefs": []
          }
        }
        "#);
    }

    #[test]
    fn cyclic_args_serialize_with_refs() {
        let node = ObjectRef::new();
        node.insert("me", Value::Object(node.clone()));
        let req = ControlRequest::Invoke {
            action_id: ActionId::from("1"),
            function_name: "cyclic".to_string(),
            args: Envelope::encode_args(&[Value::Object(node.clone())]).unwrap(),
        };
        node.clear();

        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "invoke",
          "action_id": "1",
          "function_name": "cyclic",
          "args": {
            "data": [
              {
                "me": null
              }
            ],
            "cycleRefs": [
              [
                [
                  0,
                  "me"
                ],
                [
                  0
                ]
              ]
            ]
          }
        }
        "#);
    }

    #[test]
    fn get_request_serializes() {
        let req = ControlRequest::Get {
            action_id: ActionId::from("3"),
            export_name: "version".to_string(),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "get",
          "action_id": "3",
          "export_name": "version"
        }
        "#);
    }

    #[test]
    fn deliver_failure_serializes() {
        let req = ControlRequest::DeliverCallResult {
            action_id: ActionId::from("2"),
            outcome: CallOutcome::Failure {
                error: ErrorEnvelope::bare("'loopback' cannot be called."),
            },
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "deliver_call_result",
          "action_id": "2",
          "outcome": {
            "status": "failure",
            "error": {
              "error": "'loopback' cannot be called."
            }
          }
        }
        "#);
    }

    #[test]
    fn subprocess_ready_serializes() {
        let msg = WorkerMessage::SubprocessReady { worker_id: wid() };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "subprocess_ready",
          "worker_id": "org.example.app.client1"
        }
        "#);
    }

    #[test]
    fn load_error_serializes() {
        let msg = WorkerMessage::LoadError {
            worker_id: wid(),
            error: ErrorEnvelope {
                name: Some("Error".to_string()),
                message: Some("Cannot find module 'nope'".to_string()),
                stack: None,
                error: None,
            },
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "load_error",
          "worker_id": "org.example.app.client1",
          "error": {
            "name": "Error",
            "message": "Cannot find module 'nope'"
          }
        }
        "#);
    }

    #[test]
    fn action_error_serializes() {
        let msg = WorkerMessage::ActionError {
            worker_id: wid(),
            action_id: ActionId::from("9"),
            error: ErrorEnvelope::bare("Module not loaded."),
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "action_error",
          "worker_id": "org.example.app.client1",
          "action_id": "9",
          "error": {
            "error": "Module not loaded."
          }
        }
        "#);
    }

    #[test]
    fn absent_get_result_omits_payload() {
        let msg = WorkerMessage::GetResult {
            worker_id: wid(),
            action_id: ActionId::from("4"),
            payload: None,
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "get_result",
          "worker_id": "org.example.app.client1",
          "action_id": "4"
        }
        "#);

        let parsed: WorkerMessage = serde_json::from_str(
            r#"{"type":"get_result","worker_id":"w","action_id":"4"}"#,
        )
        .unwrap();
        assert!(matches!(parsed, WorkerMessage::GetResult { payload: None, .. }));
    }

    #[test]
    fn worker_log_serializes() {
        let msg = WorkerMessage::WorkerLog {
            worker_id: wid(),
            target: "demo".to_string(),
            level: "info".to_string(),
            message: "module loaded".to_string(),
        };
        assert_eq!(msg.kind(), "worker_log");
        assert_eq!(msg.worker_id(), &wid());
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "worker_log",
          "worker_id": "org.example.app.client1",
          "target": "demo",
          "level": "info",
          "message": "module loaded"
        }
        "#);
    }

    #[test]
    fn missing_cycle_refs_defaults_to_empty() {
        let parsed: WorkerMessage = serde_json::from_str(
            r#"{"type":"action_result","worker_id":"w","action_id":"1","payload":{"data":"ok"}}"#,
        )
        .unwrap();
        let WorkerMessage::ActionResult { payload, .. } = parsed else {
            panic!("wrong variant");
        };
        assert!(payload.cycle_refs.is_empty());
        assert_eq!(payload.decode().unwrap(), Value::from("ok"));
    }
}
