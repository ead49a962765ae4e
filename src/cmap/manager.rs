use tokio::sync::mpsc;

use super::conn::PooledConnection;
use crate::{
    bson::oid::ObjectId,
    error::Error,
    runtime::AcknowledgedMessage,
};

pub(super) fn channel() -> (PoolManager, ManagementRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        PoolManager { sender },
        ManagementRequestReceiver { receiver },
    )
}

/// Sends management requests (check-in, clear, ...) to the pool worker. Holding one does not
/// keep the pool alive.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    /// Bumps the generation and pauses the pool, returning once the worker has done so.
    pub(super) async fn clear(
        &self,
        cause: Error,
        service_id: Option<ObjectId>,
        interrupt_in_use_connections: bool,
    ) {
        let (message, acknowledgment_receiver) = AcknowledgedMessage::package(());
        if self
            .sender
            .send(PoolManagementRequest::Clear {
                completion_handler: message,
                cause,
                service_id,
                interrupt_in_use_connections,
            })
            .is_ok()
        {
            acknowledgment_receiver.wait_for_acknowledgment().await;
        }
    }

    pub(super) async fn mark_as_ready(&self) {
        let (message, listener) = AcknowledgedMessage::package(());
        if self
            .sender
            .send(PoolManagementRequest::MarkAsReady {
                completion_handler: message,
            })
            .is_ok()
        {
            let _ = listener.wait_for_acknowledgment().await;
        }
    }

    /// Closes the pool, returning once idle connections are gone and waiters have been failed.
    pub(super) async fn close(&self) {
        let (message, listener) = AcknowledgedMessage::package(());
        if self
            .sender
            .send(PoolManagementRequest::Close {
                completion_handler: message,
            })
            .is_ok()
        {
            let _ = listener.wait_for_acknowledgment().await;
        }
    }

    /// Returns the connection to the pool. Hands it back if the pool no longer exists.
    #[allow(clippy::result_large_err)]
    pub(crate) fn check_in(
        &self,
        connection: PooledConnection,
    ) -> std::result::Result<(), PooledConnection> {
        if let Err(mpsc::error::SendError(PoolManagementRequest::CheckIn(connection))) = self
            .sender
            .send(PoolManagementRequest::CheckIn(Box::new(connection)))
        {
            return Err(*connection);
        }
        Ok(())
    }

    /// Reports a failed establishment.
    pub(super) fn handle_connection_failed(&self) {
        let _ = self
            .sender
            .send(PoolManagementRequest::HandleConnectionFailed);
    }

    pub(super) fn handle_connection_succeeded(&self, conn: ConnectionSucceeded) {
        let _ = self
            .sender
            .send(PoolManagementRequest::HandleConnectionSucceeded(conn));
    }
}

#[derive(Debug)]
pub(super) struct ManagementRequestReceiver {
    receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}

#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    /// Bump the generation and transition to Paused.
    Clear {
        completion_handler: AcknowledgedMessage<()>,
        cause: Error,
        service_id: Option<ObjectId>,
        interrupt_in_use_connections: bool,
    },

    /// Transition from Paused to Ready.
    MarkAsReady {
        completion_handler: AcknowledgedMessage<()>,
    },

    /// Transition to Closed.
    Close {
        completion_handler: AcknowledgedMessage<()>,
    },

    CheckIn(Box<PooledConnection>),

    HandleConnectionFailed,

    HandleConnectionSucceeded(ConnectionSucceeded),
}

/// A connection finished establishing.
#[derive(Debug)]
pub(super) enum ConnectionSucceeded {
    /// Made in the background; the pool should keep it.
    ForPool(Box<PooledConnection>),
    /// Made for a checkout request that now owns it.
    Used,
}
