use crate::{errors::HandlerError, server::context::Context};
use parking_lot::RwLock;
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error};

/// Callback serving one path.
///
/// Implemented for every `Fn(&mut Context) -> Result<(), HandlerError>`, so
/// closures can be registered directly.
///
/// A returned error or a panic does not reach the client: the response is
/// reset to its defaults and sent as is.
///
/// # Examples
/// ```
/// use wireline::{Context, Handler, HandlerError, HandlerRegistry};
///
/// struct Version(&'static str);
///
/// impl Handler for Version {
///     fn handle(&self, ctx: &mut Context) -> Result<(), HandlerError> {
///         ctx.response_mut().content_type(mime::TEXT_PLAIN).body(self.0);
///         Ok(())
///     }
/// }
///
/// let registry = HandlerRegistry::new();
/// registry.register("/version", Version("1.4.2"));
/// registry.register("/ping", |ctx: &mut Context| -> Result<(), HandlerError> {
///     ctx.response_mut().body("pong");
///     Ok(())
/// });
///
/// assert_eq!(registry.len(), 2);
/// ```
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, ctx: &mut Context) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&mut Context) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    #[inline]
    fn handle(&self, ctx: &mut Context) -> Result<(), HandlerError> {
        self(ctx)
    }
}

/// Outcome of [`HandlerRegistry::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The handler ran and returned normally.
    Handled,
    /// No handler is registered for the path.
    NotFound,
    /// The handler failed or panicked; the response was reset.
    Failed,
    /// The registry is stopped.
    Unavailable,
}

/// Path to handler table shared by the server workers.
///
/// Paths match exactly, byte for byte. Registration can change at any time;
/// a dispatch already under way keeps the handler it looked up.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    running: AtomicBool,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry that is already running.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            running: AtomicBool::new(true),
        }
    }

    /// Registers `handler` for `path`, replacing any previous one.
    ///
    /// Returns `true` if a handler was replaced.
    pub fn register<P: Into<String>, H: Handler>(&self, path: P, handler: H) -> bool {
        let path = path.into();
        debug!(path = %path, "handler registered");

        self.handlers.write().insert(path, Arc::new(handler)).is_some()
    }

    /// Removes the handler for `path`. Absent paths are ignored.
    pub fn unregister(&self, path: &str) -> bool {
        let removed = self.handlers.write().remove(path).is_some();
        if removed {
            debug!(path, "handler unregistered");
        }
        removed
    }

    #[inline]
    pub fn contains(&self, path: &str) -> bool {
        self.handlers.read().contains_key(path)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.handlers.read().keys().cloned().collect();
        paths.sort_unstable();
        paths
    }

    /// Resumes dispatching.
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Stops dispatching and drops every registration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.handlers.write().clear();
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs the handler registered for the request path.
    ///
    /// The lock is released before the handler runs, so handlers may
    /// register or unregister paths themselves.
    pub fn dispatch(&self, ctx: &mut Context) -> Dispatch {
        if !self.is_running() {
            return Dispatch::Unavailable;
        }

        let Some(handler) = self.handlers.read().get(ctx.path()).cloned() else {
            return Dispatch::NotFound;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(ctx)));
        let cause = match outcome {
            Ok(Ok(())) => return Dispatch::Handled,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        error!(path = ctx.path(), cause = %cause, "handler failed");
        ctx.response_mut().reset();
        Dispatch::Failed
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("paths", &self.paths())
            .field("running", &self.is_running())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}
