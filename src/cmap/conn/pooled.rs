use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
    time::{Duration, Instant},
};

use derive_where::derive_where;
use tokio::sync::{mpsc, Mutex};

use super::{
    Connection,
    ConnectionGeneration,
    ConnectionInfo,
    PendingConnection,
    PinnedConnectionHandle,
};
use crate::{
    bson::oid::ObjectId,
    cmap::{manager::PoolManager, PoolGeneration},
    error::{Error, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionReadyEvent,
    },
    runtime::AsyncStream,
};

/// A [`Connection`] owned by a pool. Derefs to the connection, and returns it to the pool (or to
/// its pinner) when dropped while checked out.
#[derive_where(Debug)]
pub struct PooledConnection {
    connection: Connection,

    /// The pool generation this connection belongs to.
    pub(crate) generation: ConnectionGeneration,

    /// When the connection was last checked in. Unset while checked out.
    ready_and_available_time: Option<Instant>,

    /// Set while checked out; used to check the connection back in on drop.
    pool_manager: Option<PoolManager>,

    /// Set while pinned; the connection goes back through here instead of to the pool.
    pinned_sender: Option<mpsc::Sender<PooledConnection>>,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl PooledConnection {
    pub(crate) fn new(pending_connection: PendingConnection, stream: AsyncStream) -> Self {
        let connection = Connection::new(
            pending_connection.address,
            stream,
            pending_connection.id,
            pending_connection.time_created,
        );
        let generation = match pending_connection.generation {
            PoolGeneration::Normal(generation) => ConnectionGeneration::Normal(generation),
            PoolGeneration::LoadBalanced(_) => ConnectionGeneration::LoadBalanced(None),
        };
        Self {
            connection,
            generation,
            ready_and_available_time: None,
            pool_manager: None,
            pinned_sender: None,
            event_emitter: pending_connection.event_emitter,
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        self.connection.info()
    }

    /// The ID of the backend behind the load balancer, if this connection is to one.
    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        self.stream_description
            .as_ref()
            .and_then(|sd| sd.service_id)
    }

    pub(crate) fn mark_as_available(&mut self) {
        self.pool_manager.take();
        self.ready_and_available_time = Some(Instant::now());
    }

    pub(crate) fn mark_as_in_use(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
        self.ready_and_available_time.take();
    }

    /// Whether the connection has sat in the pool for at least `max_idle_time`.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match (self.ready_and_available_time, max_idle_time) {
            (Some(available_since), Some(max_idle_time)) => {
                available_since.elapsed() >= max_idle_time
            }
            _ => false,
        }
    }

    fn take(&mut self) -> Self {
        Self {
            connection: self.connection.take(),
            generation: self.generation,
            event_emitter: self.event_emitter.clone(),
            pool_manager: None,
            ready_and_available_time: None,
            pinned_sender: self.pinned_sender.clone(),
        }
    }

    /// Binds this checked-out connection to the returned handle. Until every replica of the
    /// handle is dropped, the connection goes back to the handle rather than the pool.
    pub(crate) fn pin(&mut self) -> Result<PinnedConnectionHandle> {
        if self.pinned_sender.is_some() {
            return Err(Error::internal(format!(
                "cannot pin an already-pinned connection (id = {})",
                self.id
            )));
        }
        if self.pool_manager.is_none() {
            return Err(Error::internal(format!(
                "cannot pin a checked-in connection (id = {})",
                self.id
            )));
        }
        let (tx, rx) = mpsc::channel(1);
        self.pinned_sender = Some(tx);
        Ok(PinnedConnectionHandle {
            id: self.id,
            receiver: Arc::new(Mutex::new(rx)),
        })
    }

    /// Destroys the connection, emitting a [`ConnectionClosedEvent`] with the supplied reason.
    pub(crate) fn close_and_drop(mut self, reason: ConnectionClosedReason) {
        self.close(reason);
    }

    fn close(&mut self, reason: ConnectionClosedReason) {
        self.pool_manager.take();
        self.connection.destroy();
        self.event_emitter
            .emit_event(|| self.closed_event(reason).into());
    }

    pub(crate) fn supports_sessions(&self) -> bool {
        self.stream_description
            .as_ref()
            .is_some_and(|sd| sd.supports_sessions())
    }

    pub(crate) fn checked_out_event(&self, time_started: Instant) -> ConnectionCheckedOutEvent {
        ConnectionCheckedOutEvent {
            address: self.address.clone(),
            connection_id: self.id,
            duration: time_started.elapsed(),
        }
    }

    pub(crate) fn checked_in_event(&self) -> ConnectionCheckedInEvent {
        ConnectionCheckedInEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    pub(crate) fn ready_event(&self) -> ConnectionReadyEvent {
        ConnectionReadyEvent {
            address: self.address.clone(),
            connection_id: self.id,
            duration: self.time_created.elapsed(),
        }
    }

    pub(crate) fn closed_event(&self, reason: ConnectionClosedReason) -> ConnectionClosedEvent {
        ConnectionClosedEvent {
            address: self.address.clone(),
            connection_id: self.id,
            reason,
            error: self.connection.error.clone(),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Only a checked-out connection has a manager. Connections the pool itself drops have
        // already gone through `close_and_drop`.
        let Some(pool_manager) = self.pool_manager.take() else {
            return;
        };

        let mut dropped_connection = self.take();
        let result = match self.pinned_sender.as_mut() {
            Some(sender) => {
                dropped_connection.pool_manager = Some(pool_manager.clone());
                match sender.try_send(dropped_connection) {
                    Ok(()) => Ok(()),
                    // Unpinned since it was checked out; back to the pool.
                    Err(mpsc::error::TrySendError::Closed(mut conn))
                    | Err(mpsc::error::TrySendError::Full(mut conn)) => {
                        debug_assert!(
                            sender.is_closed(),
                            "pinned connection {} returned while another was buffered",
                            conn.id
                        );
                        conn.pinned_sender = None;
                        conn.pool_manager = None;
                        pool_manager.check_in(conn)
                    }
                }
            }
            None => pool_manager.check_in(dropped_connection),
        };

        if let Err(mut conn) = result {
            // The pool is gone.
            conn.close(ConnectionClosedReason::PoolClosed);
        }
    }
}
