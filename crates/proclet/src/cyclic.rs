//! Cycle-safe structural codec.
//!
//! Encoding walks a [`Value`] graph depth-first and remembers the path at
//! which each array/object node was first seen. When a node shows up again,
//! either as its own ancestor (a cycle) or in another branch (a shared
//! reference), the second position is written as `null` and a
//! `(target, source)` pair is recorded instead of descending again.
//!
//! Decoding rebuilds a plain tree from `data` and then replays the pairs in
//! recording order, writing the node found at `source` into `target` by
//! reference. Source paths always lead through first-seen nodes, so replay
//! never reads through a placeholder.
//!
//! Traversal is recursive. Graphs nested deeper than [`MAX_DEPTH`] levels
//! are rejected rather than risking the stack (and the frame decoder's own
//! nesting limit on the receiving side).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::{ArrayRef, ObjectRef, Value};

/// Maximum container nesting accepted by [`Envelope::encode`].
pub const MAX_DEPTH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("value nests deeper than {max} levels")]
    TooDeep { max: usize },
    #[error("invalid reference path {path}")]
    InvalidPath { path: String },
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    fn invalid_path(path: &[PathSegment]) -> Self {
        Self::InvalidPath {
            path: format_path(path),
        }
    }
}

/// One accessor step from a container to its child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

pub type Path = Vec<PathSegment>;

fn format_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "<root>".to_string();
    }
    path.iter()
        .map(|seg| match seg {
            PathSegment::Index(i) => format!("[{i}]"),
            PathSegment::Key(k) => format!("{k:?}"),
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// `(target, source)`: on decode, the node at `source` is written at `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRef(pub Path, pub Path);

impl CycleRef {
    pub fn target(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn source(&self) -> &[PathSegment] {
        &self.1
    }
}

/// Wire form of a value: a placeholder-nulled tree plus repair instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub data: serde_json::Value,
    #[serde(default)]
    pub cycle_refs: Vec<CycleRef>,
}

impl Envelope {
    pub fn encode(value: &Value) -> Result<Self, CodecError> {
        let mut encoder = Encoder::default();
        let data = encoder.child(value, 0)?;
        if !encoder.refs.is_empty() {
            tracing::trace!(
                cycles = encoder.cycles,
                shared = encoder.refs.len() - encoder.cycles,
                "Encoded graph with repeated references"
            );
        }
        Ok(Self {
            data,
            cycle_refs: encoder.refs,
        })
    }

    /// Encode an argument list as one array envelope.
    pub fn encode_args(args: &[Value]) -> Result<Self, CodecError> {
        Self::encode(&Value::array(args.to_vec()))
    }

    pub fn null() -> Self {
        Self {
            data: serde_json::Value::Null,
            cycle_refs: Vec::new(),
        }
    }

    pub fn decode(self) -> Result<Value, CodecError> {
        let root = Value::from_json(self.data);
        for cycle_ref in &self.cycle_refs {
            let node = resolve(&root, cycle_ref.source())?;
            assign(&root, cycle_ref.target(), node)?;
        }
        Ok(root)
    }

    /// Decode an argument list. A non-array payload is a single argument.
    pub fn decode_args(self) -> Result<Vec<Value>, CodecError> {
        match self.decode()? {
            Value::Array(items) => Ok(items.snapshot()),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }

    pub fn to_text(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Default)]
struct Encoder {
    /// First-seen path per node; the handle keeps the node (and its address) alive.
    seen: HashMap<usize, (Path, Value)>,
    ancestors: Vec<usize>,
    path: Path,
    refs: Vec<CycleRef>,
    cycles: usize,
}

impl Encoder {
    fn child(&mut self, value: &Value, depth: usize) -> Result<serde_json::Value, CodecError> {
        let id = match value {
            Value::Array(items) => items.node_id(),
            Value::Object(entries) => entries.node_id(),
            scalar => return Ok(scalar_to_json(scalar)),
        };

        if let Some((first, _)) = self.seen.get(&id) {
            if self.ancestors.contains(&id) {
                self.cycles += 1;
            }
            self.refs.push(CycleRef(self.path.clone(), first.clone()));
            return Ok(serde_json::Value::Null);
        }

        if depth >= MAX_DEPTH {
            return Err(CodecError::TooDeep { max: MAX_DEPTH });
        }

        self.seen.insert(id, (self.path.clone(), value.clone()));
        self.ancestors.push(id);
        let out = match value {
            Value::Array(items) => self.array(items, depth),
            Value::Object(entries) => self.object(entries, depth),
            scalar => Ok(scalar_to_json(scalar)),
        };
        self.ancestors.pop();
        out
    }

    fn array(&mut self, items: &ArrayRef, depth: usize) -> Result<serde_json::Value, CodecError> {
        let items = items.snapshot();
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            self.path.push(PathSegment::Index(i));
            let encoded = self.child(item, depth + 1);
            self.path.pop();
            out.push(encoded?);
        }
        Ok(serde_json::Value::Array(out))
    }

    fn object(
        &mut self,
        entries: &ObjectRef,
        depth: usize,
    ) -> Result<serde_json::Value, CodecError> {
        let mut out = serde_json::Map::new();
        for (key, item) in entries.snapshot() {
            self.path.push(PathSegment::Key(key.clone()));
            let encoded = self.child(&item, depth + 1);
            self.path.pop();
            out.insert(key, encoded?);
        }
        Ok(serde_json::Value::Object(out))
    }
}

fn scalar_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Value::Number(n.clone()),
        Value::String(s) => serde_json::Value::String(s.clone()),
        _ => serde_json::Value::Null,
    }
}

fn step(node: &Value, seg: &PathSegment) -> Option<Value> {
    match (node, seg) {
        (Value::Array(items), PathSegment::Index(i)) => items.get(*i),
        (Value::Object(entries), PathSegment::Key(k)) => entries.get(k),
        (Value::Object(entries), PathSegment::Index(i)) => entries.get(&i.to_string()),
        _ => None,
    }
}

fn resolve(root: &Value, path: &[PathSegment]) -> Result<Value, CodecError> {
    let mut node = root.clone();
    for seg in path {
        node = step(&node, seg).ok_or_else(|| CodecError::invalid_path(path))?;
    }
    Ok(node)
}

fn assign(root: &Value, path: &[PathSegment], node: Value) -> Result<(), CodecError> {
    let Some((last, parent_path)) = path.split_last() else {
        return Err(CodecError::invalid_path(path));
    };
    match (resolve(root, parent_path)?, last) {
        (Value::Array(items), PathSegment::Index(i)) => {
            if !items.set(*i, node) {
                return Err(CodecError::invalid_path(path));
            }
        }
        (Value::Object(entries), PathSegment::Key(k)) => {
            entries.insert(k.clone(), node);
        }
        (Value::Object(entries), PathSegment::Index(i)) => {
            entries.insert(i.to_string(), node);
        }
        _ => return Err(CodecError::invalid_path(path)),
    }
    Ok(())
}
