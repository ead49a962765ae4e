use tokio::sync::{mpsc, oneshot};

use super::conn::PooledConnection;
use crate::{
    error::{Error, Result},
    runtime::{AsyncJoinHandle, WorkerHandle},
};

/// Returns a new requester/receiver pair.
pub(super) fn channel(handle: WorkerHandle) -> (ConnectionRequester, ConnectionRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ConnectionRequester {
            sender,
            _handle: handle,
        },
        ConnectionRequestReceiver { receiver },
    )
}

/// Handle for requesting connections from the pool.
///
/// Requesters keep the pool worker alive. Once all of them have been dropped, the worker stops
/// servicing requests, drops its available connections, and exits.
#[derive(Clone, Debug)]
pub(super) struct ConnectionRequester {
    sender: mpsc::UnboundedSender<ConnectionRequest>,
    _handle: WorkerHandle,
}

impl ConnectionRequester {
    /// Enqueues a request and waits for the worker to answer it. Dropping the returned future
    /// withdraws the request from the wait queue.
    pub(super) async fn request(&self) -> ConnectionRequestResult {
        let (sender, receiver) = oneshot::channel();

        if self.sender.send(ConnectionRequest { sender }).is_err() {
            return ConnectionRequestResult::PoolClosed;
        }

        receiver.await.unwrap_or(ConnectionRequestResult::PoolClosed)
    }
}

/// Receiving end of a given ConnectionRequester.
#[derive(Debug)]
pub(super) struct ConnectionRequestReceiver {
    receiver: mpsc::UnboundedReceiver<ConnectionRequest>,
}

impl ConnectionRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<ConnectionRequest> {
        self.receiver.recv().await
    }
}

/// An entry in the pool's wait queue.
#[derive(Debug)]
pub(super) struct ConnectionRequest {
    sender: oneshot::Sender<ConnectionRequestResult>,
}

impl ConnectionRequest {
    /// Answers the request. Hands the result back if the requester has stopped waiting.
    pub(super) fn fulfill(
        self,
        result: ConnectionRequestResult,
    ) -> std::result::Result<(), ConnectionRequestResult> {
        self.sender.send(result)
    }

    /// Whether the requester gave up, e.g. because its wait queue timeout elapsed.
    pub(super) fn is_cancelled(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug)]
pub(super) enum ConnectionRequestResult {
    /// A connection that was already established and was simply checked out of the pool.
    Pooled(Box<PooledConnection>),

    /// A new connection in the process of being established.
    /// The handle can be awaited upon to receive the established connection.
    Establishing(AsyncJoinHandle<Result<PooledConnection>>),

    /// The pool was cleared before the request could be fulfilled. Carries the error that caused
    /// the clear.
    PoolCleared(Error),

    /// The pool has been closed.
    PoolClosed,
}
