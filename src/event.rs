//! Monitoring events for connection pools and the commands sent over their connections.
//!
//! Pool events are configured per pool through
//! [`ConnectionPoolOptions::cmap_event_handler`](crate::options::ConnectionPoolOptions), and
//! command events per executor through
//! [`ExecutorOptions::command_event_handler`](crate::options::ExecutorOptions).

pub mod cmap;
pub mod command;

use std::{fmt, sync::Arc};

use futures_core::future::BoxFuture;

#[cfg(feature = "tracing-unstable")]
use crate::trace::TracingMirror;

/// Where events are delivered. A `tokio` channel sender converts into a handler directly:
///
/// ```rust
/// # use mongowire::{event::cmap::CmapEvent, options::ConnectionPoolOptions};
/// # async fn example() {
/// let (tx, mut rx) = tokio::sync::mpsc::channel::<CmapEvent>(100);
/// tokio::spawn(async move {
///     while let Some(event) = rx.recv().await {
///         println!("{event:?}");
///     }
/// });
/// let options = ConnectionPoolOptions::builder().cmap_event_handler(tx).build();
/// # }
/// ```
///
/// Closures go through [`EventHandler::callback`]:
///
/// ```rust
/// # use mongowire::{event::{command::CommandEvent, EventHandler}, options::ExecutorOptions};
/// let options = ExecutorOptions::builder()
///     .command_event_handler(EventHandler::callback(|event: CommandEvent| {
///         println!("{event:?}")
///     }))
///     .build();
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub enum EventHandler<T> {
    /// Called inline on the task that produced the event.
    Callback(Arc<dyn Fn(T) + Sync + Send>),
    /// The returned future is spawned onto the runtime.
    AsyncCallback(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Sync + Send>),
    /// Events are sent from a spawned task, so a full channel never blocks the pool.
    TokioMpsc(tokio::sync::mpsc::Sender<T>),
}

impl<T> fmt::Debug for EventHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Callback(_) => "Callback",
            Self::AsyncCallback(_) => "AsyncCallback",
            Self::TokioMpsc(_) => "TokioMpsc",
        };
        f.debug_tuple("EventHandler").field(&kind).finish()
    }
}

impl<T> From<tokio::sync::mpsc::Sender<T>> for EventHandler<T> {
    fn from(sender: tokio::sync::mpsc::Sender<T>) -> Self {
        Self::TokioMpsc(sender)
    }
}

impl<T: Send + Sync + 'static> EventHandler<T> {
    /// Wraps a synchronous callback.
    pub fn callback(f: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    /// Wraps a callback returning a future.
    pub fn async_callback(f: impl Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Self {
        Self::AsyncCallback(Arc::new(f))
    }

    fn deliver(&self, event: T) {
        match self {
            Self::Callback(cb) => cb(event),
            Self::AsyncCallback(cb) => crate::runtime::execute(cb(event)),
            Self::TokioMpsc(sender) => {
                let sender = sender.clone();
                crate::runtime::execute(async move {
                    // A closed receiver just means nobody is listening anymore.
                    let _ = sender.send(event).await;
                });
            }
        }
    }
}

/// An event kind an [`Emitter`] can fan out.
pub(crate) trait MonitoringEvent: Clone + Send + Sync + 'static {
    /// Whether a subscriber wants debug records for this kind.
    #[cfg(feature = "tracing-unstable")]
    fn tracing_enabled() -> bool;

    #[cfg(feature = "tracing-unstable")]
    fn mirror(&self, tracer: &TracingMirror);
}

/// Sends events to the user's handler and, when a subscriber is listening, to `tracing`.
///
/// Events are built lazily so that nothing is allocated when no one is listening.
#[derive(Clone)]
pub(crate) struct Emitter<T> {
    user_handler: Option<EventHandler<T>>,

    #[cfg(feature = "tracing-unstable")]
    tracer: TracingMirror,
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("user_handler", &self.user_handler)
            .finish_non_exhaustive()
    }
}

impl<T: MonitoringEvent> Emitter<T> {
    pub(crate) fn new(user_handler: Option<EventHandler<T>>) -> Self {
        Self {
            user_handler,
            #[cfg(feature = "tracing-unstable")]
            tracer: TracingMirror::default(),
        }
    }

    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> T) {
        #[cfg(feature = "tracing-unstable")]
        let traced = T::tracing_enabled();
        #[cfg(not(feature = "tracing-unstable"))]
        let traced = false;

        if !traced && self.user_handler.is_none() {
            return;
        }

        let event = generate_event();
        #[cfg(feature = "tracing-unstable")]
        if traced {
            event.mirror(&self.tracer);
        }
        if let Some(ref handler) = self.user_handler {
            handler.deliver(event);
        }
    }
}
