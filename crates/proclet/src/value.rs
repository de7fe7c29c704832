//! Dynamic values with shared, reference-identified containers.
//!
//! Arrays and objects are reference-counted nodes behind a lock, so a graph
//! can hold the same node in several places (shared references) or inside
//! itself (cycles). Cloning a [`Value`] clones the handle, not the node.
//!
//! Cyclic graphs are never freed by reference counting alone. Break the
//! cycle (e.g. [`ArrayRef::clear`]) when the graph is no longer needed.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(ArrayRef),
    Object(ObjectRef),
}

/// Shared handle to an array node.
#[derive(Clone, Default)]
pub struct ArrayRef(Arc<RwLock<Vec<Value>>>);

/// Shared handle to an object node. Keys keep insertion order.
#[derive(Clone, Default)]
pub struct ObjectRef(Arc<RwLock<IndexMap<String, Value>>>);

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ArrayRef {
    pub fn new(items: Vec<Value>) -> Self {
        Self(Arc::new(RwLock::new(items)))
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.0).is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        read(&self.0).get(index).cloned()
    }

    pub fn push(&self, value: Value) {
        write(&self.0).push(value);
    }

    /// Replace the item at `index`. Returns `false`, leaving the array as is,
    /// when `index` is out of range.
    pub fn set(&self, index: usize, value: Value) -> bool {
        match write(&self.0).get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        write(&self.0).clear();
    }

    /// Copy of the element handles. Never hold the lock while walking a graph.
    pub fn snapshot(&self) -> Vec<Value> {
        read(&self.0).clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address of the node, stable for the node's lifetime.
    pub fn node_id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl ObjectRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self(Arc::new(RwLock::new(entries.into_iter().collect())))
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.0).is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        read(&self.0).get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        read(&self.0).contains_key(key)
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        write(&self.0).insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        write(&self.0).shift_remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        read(&self.0).keys().cloned().collect()
    }

    pub fn clear(&self) {
        write(&self.0).clear();
    }

    pub fn snapshot(&self) -> Vec<(String, Value)> {
        read(&self.0)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn node_id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(ArrayRef::new(items))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(ObjectRef::from_entries(
            entries.into_iter().map(|(k, v)| (k.into(), v)),
        ))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Node address for arrays and objects; `None` for scalars.
    pub fn node_id(&self) -> Option<usize> {
        match self {
            Value::Array(a) => Some(a.node_id()),
            Value::Object(o) => Some(o.node_id()),
            _ => None,
        }
    }

    /// Reference identity for containers, value equality for scalars.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
                false
            }
            (a, b) => a == b,
        }
    }

    /// Build a tree (no shared nodes) from plain JSON.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(ObjectRef::from_entries(
                map.into_iter().map(|(k, v)| (k, Value::from_json(v))),
            )),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

impl PartialEq for Value {
    /// Structural equality. Pairs of nodes already under comparison are
    /// assumed equal, so cyclic graphs compare without looping.
    fn eq(&self, other: &Self) -> bool {
        fn eq_inner(a: &Value, b: &Value, stack: &mut Vec<(usize, usize)>) -> bool {
            match (a, b) {
                (Value::Null, Value::Null) => true,
                (Value::Bool(x), Value::Bool(y)) => x == y,
                (Value::Number(x), Value::Number(y)) => {
                    x == y || matches!((x.as_f64(), y.as_f64()), (Some(p), Some(q)) if p == q)
                }
                (Value::String(x), Value::String(y)) => x == y,
                (Value::Array(x), Value::Array(y)) => {
                    let pair = (x.node_id(), y.node_id());
                    if x.ptr_eq(y) || stack.contains(&pair) {
                        return true;
                    }
                    let (xs, ys) = (x.snapshot(), y.snapshot());
                    if xs.len() != ys.len() {
                        return false;
                    }
                    stack.push(pair);
                    let equal = xs.iter().zip(&ys).all(|(p, q)| eq_inner(p, q, stack));
                    stack.pop();
                    equal
                }
                (Value::Object(x), Value::Object(y)) => {
                    let pair = (x.node_id(), y.node_id());
                    if x.ptr_eq(y) || stack.contains(&pair) {
                        return true;
                    }
                    let (xs, ys) = (x.snapshot(), y.snapshot());
                    if xs.len() != ys.len() {
                        return false;
                    }
                    stack.push(pair);
                    let equal = xs.iter().all(|(k, p)| {
                        ys.iter()
                            .find(|(key, _)| key == k)
                            .is_some_and(|(_, q)| eq_inner(p, q, stack))
                    });
                    stack.pop();
                    equal
                }
                _ => false,
            }
        }

        eq_inner(self, other, &mut Vec::new())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render(v: &Value, f: &mut fmt::Formatter<'_>, stack: &mut Vec<usize>) -> fmt::Result {
            match v {
                Value::Null => f.write_str("null"),
                Value::Bool(b) => write!(f, "{b}"),
                Value::Number(n) => write!(f, "{n}"),
                Value::String(s) => write!(f, "{s:?}"),
                Value::Array(a) => {
                    if stack.contains(&a.node_id()) {
                        return f.write_str("[<cycle>]");
                    }
                    stack.push(a.node_id());
                    f.write_str("[")?;
                    for (i, item) in a.snapshot().iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        render(item, f, stack)?;
                    }
                    stack.pop();
                    f.write_str("]")
                }
                Value::Object(o) => {
                    if stack.contains(&o.node_id()) {
                        return f.write_str("{<cycle>}");
                    }
                    stack.push(o.node_id());
                    f.write_str("{")?;
                    for (i, (k, item)) in o.snapshot().iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{k:?}: ")?;
                        render(item, f, stack)?;
                    }
                    stack.pop();
                    f.write_str("}")
                }
            }
        }

        render(self, f, &mut Vec::new())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Array(_) | Value::Object(_) => write!(f, "[{}]", self.kind()),
            other => write!(f, "{other:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number((n as u64).into())
    }
}

/// Non-finite floats have no JSON form and become `null`.
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

impl From<ArrayRef> for Value {
    fn from(a: ArrayRef) -> Self {
        Value::Array(a)
    }
}

impl From<ObjectRef> for Value {
    fn from(o: ObjectRef) -> Self {
        Value::Object(o)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Build an argument list: `args!["ab", 2]` is `vec![Value::from("ab"), Value::from(2)]`.
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::Value>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::Value::from($arg)),+]
    };
}
