//! Connections and the pools that own them.

#[cfg(test)]
mod test;

pub mod conn;
mod connection_requester;
pub mod establish;
pub(crate) mod manager;
pub mod options;
mod status;
mod worker;

use std::time::{Duration, Instant};

use derive_where::derive_where;

pub use self::{
    conn::{
        Command,
        Connection,
        ConnectionInfo,
        ExhaustStream,
        PinnedConnectionHandle,
        RawCommandResponse,
        StreamDescription,
    },
    worker::PoolGeneration,
};
pub(crate) use self::conn::PooledConnection;
use self::{
    connection_requester::{ConnectionRequestResult, ConnectionRequester},
    establish::ConnectionEstablisher,
    manager::PoolManager,
    options::ConnectionPoolOptions,
    status::PoolGenerationSubscriber,
    worker::ConnectionPoolWorker,
};
use crate::{
    bson::oid::ObjectId,
    error::{Error, Result},
    event::cmap::{
        CmapEvent,
        CmapEventEmitter,
        ConnectionCheckoutFailedEvent,
        ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent,
        PoolCreatedEvent,
    },
    options::ServerAddress,
    runtime,
};

/// A pool of connections to a single server.
///
/// This type is a handle to a task that manages the connections, so it is cheap to clone and pass
/// around. The pool shuts down once every handle has been dropped.
#[derive(Clone)]
#[derive_where(Debug)]
pub struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    connection_requester: ConnectionRequester,
    generation_subscriber: PoolGenerationSubscriber,
    wait_queue_timeout: Option<Duration>,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
}

impl ConnectionPool {
    /// Creates a pool for `address` whose connections are opened by `establisher`.
    ///
    /// The pool starts out paused unless it is load balanced; call
    /// [`ConnectionPool::mark_as_ready`] before checking anything out.
    pub fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        options: Option<ConnectionPoolOptions>,
    ) -> Result<Self> {
        if let Some(ref options) = options {
            options.validate()?;
        }

        let event_handler = options
            .as_ref()
            .and_then(|opts| opts.cmap_event_handler.clone());
        let event_emitter = CmapEventEmitter::new(event_handler);

        // Zero means wait forever.
        let wait_queue_timeout = options
            .as_ref()
            .and_then(|opts| opts.wait_queue_timeout)
            .filter(|timeout| !timeout.is_zero());

        let (manager, connection_requester, generation_subscriber) = ConnectionPoolWorker::start(
            address.clone(),
            establisher,
            event_emitter.clone(),
            options.clone(),
        );

        event_emitter.emit_event(|| {
            CmapEvent::PoolCreated(PoolCreatedEvent {
                address: address.clone(),
                options: options.map(|o| o.to_event_options()),
            })
        });

        Ok(Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            wait_queue_timeout,
            event_emitter,
        })
    }

    /// The address of the server this pool connects to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Checks out a connection from the pool. Requests are served in the order they were made;
    /// if no connection is available and the pool is at capacity, this waits for one to be
    /// checked in, up to the configured wait queue timeout.
    ///
    /// The connection returns to the pool when dropped.
    pub async fn check_out(&self) -> Result<PooledConnection> {
        let time_started = Instant::now();
        self.event_emitter.emit_event(|| {
            ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        let response = match self.wait_queue_timeout {
            Some(timeout) => {
                match runtime::timeout(timeout, self.connection_requester.request()).await {
                    Ok(response) => response,
                    Err(_) => {
                        let error = Error::wait_queue_timeout(&self.address);
                        self.emit_checkout_failed(
                            ConnectionCheckoutFailedReason::Timeout,
                            &error,
                            time_started,
                        );
                        return Err(error);
                    }
                }
            }
            None => self.connection_requester.request().await,
        };

        let conn = match response {
            ConnectionRequestResult::Pooled(c) => Ok(*c),
            ConnectionRequestResult::Establishing(task) => task.await,
            ConnectionRequestResult::PoolCleared(e) => {
                Err(Error::pool_cleared_error(&self.address, &e))
            }
            ConnectionRequestResult::PoolClosed => Err(Error::pool_closed_error(&self.address)),
        };

        match conn {
            Ok(ref conn) => {
                self.event_emitter
                    .emit_event(|| conn.checked_out_event(time_started).into());
            }
            Err(ref err) => {
                let reason = if err.is_pool_closed() {
                    ConnectionCheckoutFailedReason::PoolClosed
                } else {
                    ConnectionCheckoutFailedReason::ConnectionError
                };
                self.emit_checkout_failed(reason, err, time_started);
            }
        }

        conn
    }

    fn emit_checkout_failed(
        &self,
        reason: ConnectionCheckoutFailedReason,
        error: &Error,
        time_started: Instant,
    ) {
        self.event_emitter.emit_event(|| {
            ConnectionCheckoutFailedEvent {
                address: self.address.clone(),
                reason,
                error: Some(error.clone()),
                duration: time_started.elapsed(),
            }
            .into()
        });
    }

    /// Increments the generation of the pool so its current connections are no longer reused.
    /// Idle connections are closed lazily.
    ///
    /// Outside load-balanced mode the pool is also paused, failing waiting checkouts with a
    /// pool-cleared error until [`ConnectionPool::mark_as_ready`] is called. In load-balanced mode
    /// only the connections to `service_id` are affected.
    ///
    /// With `interrupt_in_use_connections`, connections that are checked out fail their current
    /// and next I/O with a network error.
    pub async fn clear(
        &self,
        cause: Error,
        service_id: Option<ObjectId>,
        interrupt_in_use_connections: bool,
    ) {
        self.manager
            .clear(cause, service_id, interrupt_in_use_connections)
            .await
    }

    /// Allows connections to be checked out and created again after a clear.
    pub async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().await
    }

    /// Closes the pool. Idle connections are closed, waiting checkouts fail and any later checkout
    /// fails with a pool-closed error. Connections still checked out are closed when returned.
    pub async fn close(&self) {
        self.manager.close().await
    }

    /// The current generation of the pool.
    pub fn generation(&self) -> PoolGeneration {
        self.generation_subscriber.generation()
    }
}
