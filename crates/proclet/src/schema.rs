//! Declarative API shapes.
//!
//! An [`ApiSchema`] lists the methods (with arity) and readable properties a
//! worker module is expected to export. Binding it to a proxy compiles a
//! [`BoundApi`]: a per-name table of [`RemoteMethod`]s that rejects unknown
//! names and wrong argument counts before anything is sent.

use std::fmt;

use indexmap::{IndexMap, IndexSet};

use crate::rpc::{CallError, Get, Invoke, RemoteMethod, RemoteProperty};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
            Arity::Any => true,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(k) => write!(f, "{k}"),
            Arity::AtLeast(k) => write!(f, "at least {k}"),
            Arity::Any => f.write_str("any number of"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiSchema {
    methods: IndexMap<String, Arity>,
    properties: IndexSet<String>,
}

impl ApiSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, name: impl Into<String>, arity: Arity) -> Self {
        self.methods.insert(name.into(), arity);
        self
    }

    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.insert(name.into());
        self
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, Arity)> {
        self.methods.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(String::as_str)
    }

    pub fn bind(&self, invoke: &Invoke, get: &Get) -> BoundApi {
        BoundApi {
            methods: self
                .methods
                .iter()
                .map(|(name, arity)| (name.clone(), (*arity, invoke.method(name.clone()))))
                .collect(),
            properties: self
                .properties
                .iter()
                .map(|name| (name.clone(), get.property(name.clone())))
                .collect(),
        }
    }
}

/// Method table compiled from an [`ApiSchema`].
#[derive(Clone)]
pub struct BoundApi {
    methods: IndexMap<String, (Arity, RemoteMethod)>,
    properties: IndexMap<String, RemoteProperty>,
}

impl BoundApi {
    pub fn method(&self, name: &str) -> Option<&RemoteMethod> {
        self.methods.get(name).map(|(_, m)| m)
    }

    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, CallError> {
        let (arity, method) = self
            .methods
            .get(name)
            .ok_or_else(|| CallError::UnknownMethod(name.to_string()))?;
        if !arity.accepts(args.len()) {
            return Err(CallError::Arity {
                name: name.to_string(),
                expected: *arity,
                got: args.len(),
            });
        }
        method.call(args).await
    }

    pub async fn get(&self, name: &str) -> Result<Value, CallError> {
        let property = self
            .properties
            .get(name)
            .ok_or_else(|| CallError::UnknownMethod(name.to_string()))?;
        property.fetch().await
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_accepts() {
        assert!(Arity::Exact(2).accepts(2));
        assert!(!Arity::Exact(2).accepts(1));
        assert!(Arity::AtLeast(1).accepts(3));
        assert!(!Arity::AtLeast(1).accepts(0));
        assert!(Arity::Any.accepts(0));
    }

    #[test]
    fn schema_keeps_declaration_order() {
        let schema = ApiSchema::new()
            .method("foo", Arity::Exact(2))
            .method("bar", Arity::Any)
            .property("version")
            .method("foo", Arity::AtLeast(1));

        assert_eq!(
            schema.methods().collect::<Vec<_>>(),
            vec![("foo", Arity::AtLeast(1)), ("bar", Arity::Any)]
        );
        assert_eq!(schema.properties().collect::<Vec<_>>(), vec!["version"]);
    }

    #[test]
    fn arity_error_message() {
        let err = CallError::Arity {
            name: "foo".into(),
            expected: Arity::Exact(2),
            got: 3,
        };
        assert_eq!(err.to_string(), "'foo' takes 2 argument(s), got 3");
    }
}
