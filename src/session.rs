//! Logical sessions and the cluster time they gossip.


use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp},
    cmap::PinnedConnectionHandle,
    executor::Retryability,
    options::ServerAddress,
};

/// Struct modeling a cluster time reported by the server.
///
/// Cluster times are immutable snapshots; a newer one replaces an older one wholesale.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    pub(crate) signature: Document,
}

impl PartialEq for ClusterTime {
    fn eq(&self, other: &Self) -> bool {
        self.cluster_time == other.cluster_time
    }
}

impl Eq for ClusterTime {}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The state of the transaction, if any, running on a session.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum TransactionState {
    /// No transaction has been started.
    None,
    /// A transaction was started but no operation has run in it yet.
    Starting,
    /// At least one operation has run in the current transaction.
    InProgress,
    /// The transaction was committed.
    Committed,
    /// The transaction was aborted.
    Aborted,
}

/// What a transaction running on a session is bound to.
#[derive(Debug)]
pub(crate) enum TransactionPin {
    /// A mongos, for sharded transactions.
    Mongos(ServerAddress),
    /// A connection, for transactions through a load balancer.
    Connection(PinnedConnectionHandle),
}

/// A logical session used for ordering sequential operations and for retryable writes.
///
/// A `ClientSession` can only be used by one operation at a time, which the executor enforces by
/// borrowing it mutably.
#[derive(Debug)]
pub struct ClientSession {
    id: Document,
    cluster_time: Option<ClusterTime>,
    txn_number: i64,
    last_use: Instant,
    dirty: bool,
    pub(crate) transaction_state: TransactionState,
    pub(crate) pinned: Option<TransactionPin>,
    pub(crate) operation_time: Option<Timestamp>,
}

impl ClientSession {
    /// Creates a session with a fresh random identifier.
    pub fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            cluster_time: None,
            txn_number: 0,
            last_use: Instant::now(),
            dirty: false,
            transaction_state: TransactionState::None,
            pinned: None,
            operation_time: None,
        }
    }

    /// The id of this session, sent as `lsid`.
    pub fn id(&self) -> &Document {
        &self.id
    }

    /// The highest cluster time this session has seen.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Set the cluster time to the provided one if it is greater than this session's highest seen
    /// cluster time or if this session's cluster time is `None`.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Advance operation time for this session. If the provided timestamp is earlier than this
    /// session's current operation time, then the operation time is unchanged.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        self.operation_time = match self.operation_time {
            Some(current) if current >= ts => Some(current),
            _ => Some(ts),
        }
    }

    /// The operation time returned by the last operation executed in this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Marks the start of a transaction. Subsequent operations run inside it until it is
    /// committed or aborted.
    pub fn start_transaction(&mut self) {
        self.increment_txn_number();
        self.transaction_state = TransactionState::Starting;
        self.pinned = None;
    }

    /// Marks the current transaction as committed.
    pub fn commit_transaction(&mut self) {
        self.transaction_state = TransactionState::Committed;
    }

    /// Marks the current transaction as aborted and releases any pin it held.
    pub fn abort_transaction(&mut self) {
        self.transaction_state = TransactionState::Aborted;
        self.pinned = None;
    }

    /// The state of the current transaction.
    pub fn transaction_state(&self) -> &TransactionState {
        &self.transaction_state
    }

    /// Whether a transaction is started or in progress.
    pub fn in_transaction(&self) -> bool {
        matches!(
            self.transaction_state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    /// Whether the session saw a network error and should be discarded rather than reused.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn update_last_use(&mut self) {
        self.last_use = Instant::now();
    }

    /// When the session was last used.
    pub fn last_use(&self) -> Instant {
        self.last_use
    }

    pub(crate) fn txn_number(&self) -> i64 {
        self.txn_number
    }

    pub(crate) fn increment_txn_number(&mut self) {
        self.txn_number += 1;
    }

    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        self.increment_txn_number();
        self.txn_number
    }

    /// The transaction number to send with an operation. A retryable write outside a transaction
    /// gets a fresh one; operations in a transaction reuse the transaction's.
    pub(crate) fn txn_number_for_operation(&mut self, retryability: Retryability) -> Option<i64> {
        if self.transaction_state != TransactionState::None {
            Some(self.txn_number())
        } else if retryability == Retryability::Write {
            Some(self.get_and_increment_txn_number())
        } else {
            None
        }
    }

    pub(crate) fn pin_mongos(&mut self, address: ServerAddress) {
        self.pinned = Some(TransactionPin::Mongos(address));
    }

    /// Binds this session to a connection. Subsequent operations run on it until unpinned.
    pub fn pin_connection(&mut self, handle: PinnedConnectionHandle) {
        self.pinned = Some(TransactionPin::Connection(handle));
    }

    /// Releases the mongos or connection this session is bound to, if any.
    pub fn unpin(&mut self) {
        self.pinned = None;
    }

    pub(crate) fn pinned_mongos(&self) -> Option<&ServerAddress> {
        match self.pinned {
            Some(TransactionPin::Mongos(ref address)) => Some(address),
            _ => None,
        }
    }

    pub(crate) fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        match self.pinned {
            Some(TransactionPin::Connection(ref handle)) => Some(handle),
            _ => None,
        }
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}
