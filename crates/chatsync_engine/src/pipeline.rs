//! Ordered, serialized event dispatch.
//!
//! An [`EventPipeline`] holds an ordered list of async handlers. Each call to
//! [`EventPipeline::run`] executes every handler in list order, and runs on
//! the same pipeline never interleave: the second run starts only once the
//! first has finished, whatever its outcome.
//!
//! A run takes its snapshot of the handler list when it starts executing,
//! not when it is queued, so handlers added while an event is processed only
//! see later events.

use crate::error::{HandlerFailure, PipelineError};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Error returned by a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a handler invocation.
pub type HandlerResult = Result<Flow, HandlerError>;

/// Future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// An event handler.
pub type Handler<E, C> = Arc<dyn Fn(Arc<E>, C) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure as a [`Handler`].
pub fn handler<E, C, F, Fut>(f: F) -> Handler<E, C>
where
    F: Fn(Arc<E>, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |event, ctx| Box::pin(f(event, ctx)))
}

/// What the pipeline does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next handler.
    Continue,
    /// Skip the remaining handlers for this event.
    Stop,
}

/// Where and how [`EventPipeline::insert`] places a handler.
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    /// Target position, clamped to the list size. Appends when `None`.
    pub index: Option<usize>,
    /// Handler id used in logs and by [`HandlerMatch::Id`]. Generated when `None`.
    pub id: Option<String>,
    /// Substitute the handler at `index` instead of shifting it.
    pub replace: bool,
    /// On unsubscribe, put the substituted handler back.
    pub revert_on_unsubscribe: bool,
}

impl InsertOptions {
    /// Creates options that append with a generated id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target position.
    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    /// Sets the handler id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Substitutes the handler at the target position.
    pub fn replacing(mut self, revert_on_unsubscribe: bool) -> Self {
        self.replace = true;
        self.revert_on_unsubscribe = revert_on_unsubscribe;
        self
    }
}

/// Selects handlers for [`EventPipeline::remove`].
pub enum HandlerMatch<'a, E, C> {
    /// Every handler with this id.
    Id(&'a str),
    /// Every entry holding this exact handler.
    Handler(&'a Handler<E, C>),
}

struct Entry<E, C> {
    id: String,
    handler: Handler<E, C>,
}

type Entries<E, C> = RwLock<Vec<Arc<Entry<E, C>>>>;

/// Removes a handler added with [`EventPipeline::insert`].
#[must_use = "dropping the handle keeps the handler installed"]
pub struct PipelineUnsubscribe<E, C> {
    entries: Weak<Entries<E, C>>,
    entry: Arc<Entry<E, C>>,
    previous: Option<Arc<Entry<E, C>>>,
}

impl<E, C> PipelineUnsubscribe<E, C> {
    /// Returns the id of the inserted handler.
    pub fn id(&self) -> &str {
        &self.entry.id
    }

    /// Removes the inserted handler, restoring the one it replaced if requested.
    pub fn unsubscribe(self) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let mut entries = entries.write();
        let Some(position) = entries.iter().position(|e| Arc::ptr_eq(e, &self.entry)) else {
            return;
        };
        match self.previous {
            Some(previous) => entries[position] = previous,
            None => {
                entries.remove(position);
            }
        }
    }
}

impl<E, C> fmt::Debug for PipelineUnsubscribe<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineUnsubscribe")
            .field("id", &self.entry.id)
            .field("restores", &self.previous.as_ref().map(|e| e.id.as_str()))
            .finish()
    }
}

/// Completion of one [`EventPipeline::run`].
///
/// Awaiting is optional; the run proceeds either way.
#[derive(Debug)]
pub struct RunHandle {
    state: RunState,
}

#[derive(Debug)]
enum RunState {
    Spawned(JoinHandle<Result<(), PipelineError>>),
    Rejected(Option<PipelineError>),
}

impl Future for RunHandle {
    type Output = Result<(), PipelineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            RunState::Spawned(join) => match Pin::new(join).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(error)) => Poll::Ready(Err(PipelineError::Aborted(error.to_string()))),
                Poll::Pending => Poll::Pending,
            },
            RunState::Rejected(error) => Poll::Ready(Err(error
                .take()
                .unwrap_or_else(|| PipelineError::Aborted("run already completed".into())))),
        }
    }
}

/// An ordered handler list with serialized runs.
pub struct EventPipeline<E, C> {
    name: Arc<str>,
    entries: Arc<Entries<E, C>>,
    tail: Arc<Mutex<watch::Receiver<bool>>>,
}

impl<E, C> Clone for EventPipeline<E, C> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            entries: Arc::clone(&self.entries),
            tail: Arc::clone(&self.tail),
        }
    }
}

impl<E, C> fmt::Debug for EventPipeline<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPipeline")
            .field("name", &self.name)
            .field("handlers", &self.entries.read().len())
            .finish()
    }
}

impl<E, C> EventPipeline<E, C>
where
    E: Send + Sync + 'static,
    C: Clone + Send + 'static,
{
    /// Creates an empty pipeline. The name tags its log lines.
    pub fn new(name: impl Into<String>) -> Self {
        let (_, idle) = watch::channel(true);
        Self {
            name: Arc::from(name.into()),
            entries: Arc::new(RwLock::new(Vec::new())),
            tail: Arc::new(Mutex::new(idle)),
        }
    }

    /// Returns the pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of handlers.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if there are no handlers.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns handler ids in execution order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.id.clone()).collect()
    }

    /// Inserts a handler.
    ///
    /// `replace` only substitutes when the clamped index points at an
    /// existing handler; past the end it is a plain insert and unsubscribe
    /// restores nothing.
    pub fn insert(&self, handler: Handler<E, C>, options: InsertOptions) -> PipelineUnsubscribe<E, C> {
        let entry = Arc::new(Entry {
            id: options
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            handler,
        });

        let mut entries = self.entries.write();
        let index = options.index.unwrap_or(entries.len()).min(entries.len());
        let previous = if options.replace && index < entries.len() {
            let previous = std::mem::replace(&mut entries[index], Arc::clone(&entry));
            options.revert_on_unsubscribe.then_some(previous)
        } else {
            entries.insert(index, Arc::clone(&entry));
            None
        };
        debug!(pipeline = %self.name, handler_id = %entry.id, index, "handler inserted");

        PipelineUnsubscribe {
            entries: Arc::downgrade(&self.entries),
            entry,
            previous,
        }
    }

    /// Appends a handler with the given id.
    pub fn append(&self, id: impl Into<String>, handler: Handler<E, C>) -> PipelineUnsubscribe<E, C> {
        self.insert(handler, InsertOptions::new().with_id(id))
    }

    /// Removes matching handlers. Returns true if any was removed.
    pub fn remove(&self, target: HandlerMatch<'_, E, C>) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| match &target {
            HandlerMatch::Id(id) => entry.id != *id,
            HandlerMatch::Handler(handler) => !Arc::ptr_eq(&entry.handler, handler),
        });
        before != entries.len()
    }

    /// Replaces the whole handler list.
    pub fn replace_all(&self, handlers: impl IntoIterator<Item = (String, Handler<E, C>)>) {
        let replacement = handlers
            .into_iter()
            .map(|(id, handler)| Arc::new(Entry { id, handler }))
            .collect();
        *self.entries.write() = replacement;
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Queues `event` behind every earlier run and returns its completion.
    ///
    /// Outside a Tokio runtime nothing is queued and the handle resolves to
    /// [`PipelineError::Aborted`].
    pub fn run(&self, event: E, ctx: C) -> RunHandle {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(pipeline = %self.name, error = %err, "no async runtime; event dropped");
                return RunHandle {
                    state: RunState::Rejected(Some(PipelineError::Aborted(err.to_string()))),
                };
            }
        };
        let (done, done_rx) = watch::channel(false);
        let mut previous = std::mem::replace(&mut *self.tail.lock(), done_rx);
        let entries = Arc::clone(&self.entries);
        let name = Arc::clone(&self.name);
        let event = Arc::new(event);

        let join = runtime.spawn(async move {
            // A closed channel means the previous run is gone; proceed either way.
            let _ = previous.wait_for(|finished| *finished).await;
            let snapshot: Vec<Arc<Entry<E, C>>> = entries.read().clone();
            let result = dispatch(&name, &snapshot, event, ctx).await;
            done.send_replace(true);
            result
        });

        RunHandle {
            state: RunState::Spawned(join),
        }
    }

    /// Resolves once every run queued so far has completed.
    pub async fn drain(&self) {
        let mut tail = self.tail.lock().clone();
        let _ = tail.wait_for(|finished| *finished).await;
    }
}

async fn dispatch<E, C: Clone>(
    name: &str,
    snapshot: &[Arc<Entry<E, C>>],
    event: Arc<E>,
    ctx: C,
) -> Result<(), PipelineError> {
    let mut failures = Vec::new();

    for (index, entry) in snapshot.iter().enumerate() {
        match (entry.handler)(Arc::clone(&event), ctx.clone()).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => {
                debug!(pipeline = %name, handler_id = %entry.id, index, "handler stopped the run");
                break;
            }
            Err(err) => {
                error!(pipeline = %name, handler_id = %entry.id, index, error = %err, "pipeline handler failed");
                failures.push(HandlerFailure {
                    handler_id: entry.id.clone(),
                    index,
                    message: err.to_string(),
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::HandlerFailures(failures))
    }
}
