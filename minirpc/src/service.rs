use std::{collections::HashMap, sync::Arc};

use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{
    codec::{Reply, Request},
    error::{Error, ErrorKind, Result},
};

/// Name of the introspection method every server answers unless a user
/// method is registered under the same name.
pub const LIST_METHODS: &str = "list_methods";

/// Decoded call arguments handed to a method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

pub type Method = Box<dyn Fn(Args) -> Result<Value> + Send + Sync>;

/// Declared argument names of a method, reported by `list_methods`.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Signature {
    pub method_args: Vec<String>,
    /// Keyword arguments and their defaults.
    pub method_kwargs: Map<String, Value>,
}

struct Entry {
    method: Method,
    signature: Signature,
}

/// Map from method name to callable. Registration happens before the
/// server starts; afterwards the table is shared read-only.
#[derive(Default)]
pub struct ServiceTable {
    methods: HashMap<String, Entry, RandomState>,
}

impl Args {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Positional argument `index` as `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.args.get(index).ok_or_else(|| {
            Error::new(
                ErrorKind::ArgumentMismatch,
                format!("missing positional argument {index}"),
            )
        })?;
        T::deserialize(value).map_err(|e| {
            Error::new(
                ErrorKind::ArgumentMismatch,
                format!("positional argument {index}: {e}"),
            )
        })
    }

    /// Argument `name`, looked up in the keywords first and then at
    /// positional `index`, falling back to `default`.
    pub fn arg_or<T: DeserializeOwned>(&self, index: usize, name: &str, default: T) -> Result<T> {
        if let Some(value) = self.kwargs.get(name) {
            return T::deserialize(value).map_err(|e| {
                Error::new(
                    ErrorKind::ArgumentMismatch,
                    format!("keyword argument {name}: {e}"),
                )
            });
        }
        if index < self.args.len() {
            return self.arg(index);
        }
        Ok(default)
    }

    /// Rejects calls carrying more than `max` positional arguments or any
    /// keyword not listed in `keywords`.
    pub fn expect_at_most(&self, max: usize, keywords: &[&str]) -> Result<()> {
        if self.args.len() > max {
            return Err(Error::new(
                ErrorKind::ArgumentMismatch,
                format!("takes at most {max} positional arguments but {} were given", self.args.len()),
            ));
        }
        if let Some(key) = self.kwargs.keys().find(|k| !keywords.contains(&k.as_str())) {
            return Err(Error::new(
                ErrorKind::ArgumentMismatch,
                format!("got an unexpected keyword argument '{key}'"),
            ));
        }
        Ok(())
    }
}

impl ServiceTable {
    /// Registers a method working on raw [`Args`]. A later registration
    /// under the same name replaces the earlier one.
    pub fn add_raw<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(Args) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::info!("register method: {name}");
        self.methods.insert(
            name,
            Entry {
                method: Box::new(func),
                signature: Signature::default(),
            },
        );
        self
    }

    /// Registers a typed method. The positional arguments are decoded as
    /// the tuple `A`, so arity and type mismatches are reported before the
    /// method runs. Keyword arguments are rejected.
    ///
    /// ```rust
    /// # use minirpc::ServiceTable;
    /// let mut table = ServiceTable::default();
    /// table.add_method("hi", |(user,): (String,)| {
    ///     Ok::<_, String>(format!("hi {user}, welcome"))
    /// });
    /// ```
    pub fn add_method<A, R, E, F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        E: std::fmt::Display,
        F: Fn(A) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        self.add_raw(name, move |args: Args| {
            if let Some(key) = args.kwargs.keys().next() {
                return Err(Error::new(
                    ErrorKind::ArgumentMismatch,
                    format!("got an unexpected keyword argument '{key}'"),
                ));
            }
            let input = A::deserialize(Value::Array(args.args))
                .map_err(|e| Error::new(ErrorKind::ArgumentMismatch, e.to_string()))?;
            let output = func(input).map_err(|e| Error::new(ErrorKind::MethodFailed, e.to_string()))?;
            Ok(serde_json::to_value(output)?)
        })
    }

    /// Attaches argument names to a registered method. Returns `false` if
    /// no method is registered under `name`.
    pub fn describe(&mut self, name: &str, signature: Signature) -> bool {
        match self.methods.get_mut(name) {
            Some(entry) => {
                entry.signature = signature;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Calls `name` synchronously.
    pub fn invoke(&self, name: &str, args: Args) -> Result<Value> {
        if let Some(entry) = self.methods.get(name) {
            return (entry.method)(args).map_err(|e| describe_failure(name, e));
        }
        if name == LIST_METHODS {
            return Ok(self.list_methods());
        }
        Err(Error::new(
            ErrorKind::MethodNotFound,
            format!("no such method: {name}"),
        ))
    }

    fn list_methods(&self) -> Value {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        Value::Array(
            names
                .into_iter()
                .map(|name| {
                    let signature = &self.methods[name].signature;
                    serde_json::json!({
                        "method_name": name,
                        "method_args": signature.method_args,
                        "method_kwargs": signature.method_kwargs,
                    })
                })
                .collect(),
        )
    }

    /// Runs one request on the blocking pool and always produces a reply.
    /// A panicking method yields an error reply like any other failure.
    pub async fn dispatch(self: &Arc<Self>, req: Request) -> Reply {
        let name = req.method_name;
        if !self.contains(&name) && name != LIST_METHODS {
            let msg = format!("no such method: {name}");
            tracing::error!("{msg}");
            return Reply::err(msg);
        }

        let this = self.clone();
        let args = Args::new(req.method_args, req.method_kwargs);
        let result = tokio::task::spawn_blocking({
            let name = name.clone();
            move || this.invoke(&name, args)
        })
        .await;

        let result = result.unwrap_or_else(|join_err| {
            Err(Error::new(
                ErrorKind::MethodFailed,
                format!("error calling {name}: {join_err}"),
            ))
        });
        if let Err(err) = &result {
            tracing::error!("call {name} failed: {err}");
        }
        Reply::from(result)
    }
}

fn describe_failure(name: &str, err: Error) -> Error {
    let msg = match err.kind {
        ErrorKind::ArgumentMismatch => format!("argument error for {name}: {}", err.msg),
        _ => format!("error calling {name}: {}", err.msg),
    };
    Error::new(err.kind, msg)
}

impl std::fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTable")
            .field("methods", &self.methods.keys())
            .finish()
    }
}
