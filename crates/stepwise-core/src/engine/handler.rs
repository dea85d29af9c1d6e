//! Machine-node handlers and their registry.
//!
//! `MachineHandler` uses RPITIT for async methods, so it cannot be a trait
//! object directly. `MachineHandlerDyn` is the object-safe twin with boxed
//! futures, blanket-implemented for every `MachineHandler`, and is what the
//! `HandlerRegistry` stores.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::Arc;

use stepwise_types::task::{ErrorInfo, Task, short_type_name};

// ---------------------------------------------------------------------------
// Handler outcome
// ---------------------------------------------------------------------------

/// Where a successful handler sends the process next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextNodes {
    /// Follow the graph's declared successors.
    Declared,
    /// Schedule exactly these nodes, in order.
    Explicit(Vec<String>),
}

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// A handler failure, with the source location that raised it.
///
/// Any `std::error::Error` converts into `HandlerError` through `?`, which
/// records the location of the `?`. Like `anyhow::Error`, this type does not
/// itself implement `std::error::Error`.
#[derive(Debug)]
pub struct HandlerError {
    error_type: String,
    message: String,
    causes: Vec<String>,
    location: &'static Location<'static>,
}

impl HandlerError {
    #[track_caller]
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            causes: Vec::new(),
            location: Location::caller(),
        }
    }

    pub fn error_type(&self) -> &str {
        &self.error_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Type, message, and a trace naming the raise site and every cause.
    pub fn to_error_info(&self) -> ErrorInfo {
        let mut trace = String::from("Trace (most recent call last):\n");
        trace.push_str(&format!("  raised at {}\n", self.location));
        for cause in &self.causes {
            trace.push_str(&format!("  caused by: {cause}\n"));
        }
        trace.push_str(&format!("{}: {}\n", self.error_type, self.message));
        ErrorInfo::new(&self.error_type, &self.message, trace)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl<E: StdError + 'static> From<E> for HandlerError {
    #[track_caller]
    fn from(err: E) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            error_type: short_type_name(std::any::type_name::<E>()).to_string(),
            message: err.to_string(),
            causes,
            location: Location::caller(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// Code run for a `Machine` node.
pub trait MachineHandler: Send + Sync {
    fn run(&self, task: &Task) -> impl Future<Output = Result<NextNodes, HandlerError>> + Send;
}

/// Object-safe version of [`MachineHandler`] with boxed futures.
pub trait MachineHandlerDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        task: &'a Task,
    ) -> Pin<Box<dyn Future<Output = Result<NextNodes, HandlerError>> + Send + 'a>>;
}

impl<T: MachineHandler> MachineHandlerDyn for T {
    fn run_boxed<'a>(
        &'a self,
        task: &'a Task,
    ) -> Pin<Box<dyn Future<Output = Result<NextNodes, HandlerError>> + Send + 'a>> {
        Box::pin(self.run(task))
    }
}

/// Adapts an async closure taking an owned `Task` into a `MachineHandler`.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> MachineHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NextNodes, HandlerError>> + Send,
{
    fn run(&self, task: &Task) -> impl Future<Output = Result<NextNodes, HandlerError>> + Send {
        (self.f)(task.clone())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps callable descriptors to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MachineHandlerDyn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: MachineHandler + 'static>(&mut self, callable: impl Into<String>, handler: H) {
        self.handlers.insert(callable.into(), Arc::new(handler));
    }

    pub fn register_fn<F, Fut>(&mut self, callable: impl Into<String>, f: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NextNodes, HandlerError>> + Send + 'static,
    {
        self.register(callable, FnHandler::new(f));
    }

    pub fn get(&self, callable: &str) -> Option<Arc<dyn MachineHandlerDyn>> {
        self.handlers.get(callable).cloned()
    }

    pub fn contains(&self, callable: &str) -> bool {
        self.handlers.contains_key(callable)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut callables: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        callables.sort();
        f.debug_struct("HandlerRegistry")
            .field("callables", &callables)
            .finish()
    }
}
