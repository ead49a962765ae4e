use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use tokio::sync::broadcast;

use super::{
    conn::{PendingConnection, PooledConnection},
    connection_requester,
    connection_requester::{
        ConnectionRequest,
        ConnectionRequestReceiver,
        ConnectionRequestResult,
        ConnectionRequester,
    },
    establish::ConnectionEstablisher,
    manager,
    manager::{ConnectionSucceeded, ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    options::ConnectionPoolOptions,
    status,
    status::{PoolGenerationPublisher, PoolGenerationSubscriber},
};
use crate::{
    bson::oid::ObjectId,
    error::{load_balanced_mode_mismatch, Error, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolReadyEvent,
    },
    options::ServerAddress,
    runtime::{self, WorkerHandleListener},
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 100;
const DEFAULT_MAX_CONNECTING: u32 = 2;
const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// A worker task that manages the shared state of the pool.
///
/// All of the pool's bookkeeping lives here and is only touched from the worker's own loop, so
/// none of it needs locking. Handles talk to the worker over channels.
#[derive(Debug)]
pub(crate) struct ConnectionPoolWorker {
    /// The address the pool's connections will connect to.
    address: ServerAddress,

    /// Current state of the pool. Determines if connections may be checked out
    /// and if min_pool_size connection creation should continue.
    state: PoolState,

    /// The total number of connections managed by the pool, including connections which are
    /// currently checked out of the pool or have yet to be established.
    total_connection_count: u32,

    /// The number of connections currently being established by this pool.
    pending_connection_count: u32,

    /// The ID of the next connection created by the pool.
    next_connection_id: u32,

    /// The current generation of the pool. The generation is incremented whenever the pool is
    /// cleared. Connections belonging to a previous generation are considered stale and will be
    /// closed when checked back in or when popped off of the set of available connections.
    generation: PoolGeneration,

    /// The established connections that are currently checked into the pool and awaiting usage in
    /// future operations. The most recently checked in connection is at the back.
    available_connections: VecDeque<PooledConnection>,

    /// Contains the logic for "establishing" a connection. This includes handshaking and
    /// authenticating a connection when it's first created.
    establisher: ConnectionEstablisher,

    /// Emits CMAP events to the user's handler and to tracing.
    event_emitter: CmapEventEmitter,

    /// The time between maintenance tasks.
    maintenance_frequency: Duration,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time` will
    /// be closed either by the background thread or when popped off of the set of available
    /// connections. If `max_idle_time` is `None`, then connections will not be closed due to being
    /// idle.
    max_idle_time: Option<Duration>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. If fewer than `min_pool_size`
    /// connections are in the pool, the background thread will create more connections and add
    /// them to the pool.
    min_pool_size: Option<u32>,

    /// The maximum number of connections that the pool can manage, including connections checked
    /// out of the pool. If a thread requests a connection and the pool is empty + there are
    /// already max_pool_size connections in use, it will block until one is returned or the
    /// wait_queue_timeout is exceeded. `None` means unbounded.
    max_pool_size: Option<u32>,

    /// The maximum number of connections that may be establishing at once.
    max_connecting: u32,

    /// Receiver used to determine if any threads hold references to this pool. If all the
    /// sender ends of this receiver drop, this worker will be notified and drop too.
    handle_listener: WorkerHandleListener,

    /// Receiver for incoming connection check out requests.
    request_receiver: ConnectionRequestReceiver,

    /// Ordered queue of incoming requests waiting for connections.
    wait_queue: VecDeque<ConnectionRequest>,

    /// Receiver for incoming pool management requests (e.g. checking in a connection).
    management_receiver: ManagementRequestReceiver,

    /// Sender used to publish the latest generation.
    generation_publisher: PoolGenerationPublisher,

    /// Publishes the generation as of the last clear that interrupted in-use connections.
    interrupt_publisher: PoolGenerationPublisher,

    /// Handed to new connections so they notice interrupting clears.
    interrupt_subscriber: PoolGenerationSubscriber,

    /// A pool manager that can be cloned and attached to connections checked out of the pool.
    manager: PoolManager,

    /// Fires when the pool is closed, aborting connections that are still establishing.
    cancellation_sender: broadcast::Sender<()>,
}

impl ConnectionPoolWorker {
    /// Starts a worker and returns a manager and connection requester.
    /// Once all connection requesters are dropped, the worker will stop executing
    /// and close the pool.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        event_emitter: CmapEventEmitter,
        options: Option<ConnectionPoolOptions>,
    ) -> (PoolManager, ConnectionRequester, PoolGenerationSubscriber) {
        // A max idle time of zero means that connections should not be closed due to idleness.
        let mut max_idle_time = options.as_ref().and_then(|opts| opts.max_idle_time);
        if max_idle_time == Some(Duration::ZERO) {
            max_idle_time = None;
        }

        let max_pool_size = match options.as_ref().and_then(|opts| opts.max_pool_size) {
            Some(0) => None,
            Some(size) => Some(size),
            None => Some(DEFAULT_MAX_POOL_SIZE),
        };
        let min_pool_size = options.as_ref().and_then(|opts| opts.min_pool_size);
        let max_connecting = options
            .as_ref()
            .and_then(|opts| opts.max_connecting)
            .unwrap_or(DEFAULT_MAX_CONNECTING);
        let load_balanced = options
            .as_ref()
            .and_then(|opts| opts.load_balanced)
            .unwrap_or(false);

        let (handle, handle_listener) = runtime::WorkerHandleListener::channel();
        let (connection_requester, request_receiver) = connection_requester::channel(handle);
        let (manager, management_receiver) = manager::channel();

        let generation = if load_balanced {
            PoolGeneration::load_balanced()
        } else {
            PoolGeneration::normal()
        };
        let (generation_publisher, generation_subscriber) = status::channel(generation.clone());
        let (interrupt_publisher, interrupt_subscriber) = status::channel(generation.clone());

        // Nothing monitors a load balancer, so its pool is ready from the start.
        #[cfg(test)]
        let mut state = if options.as_ref().and_then(|opts| opts.ready) == Some(true) {
            PoolState::Ready
        } else {
            PoolState::New
        };
        #[cfg(test)]
        let maintenance_frequency = options
            .as_ref()
            .and_then(|opts| opts.maintenance_frequency)
            .unwrap_or(MAINTENANCE_FREQUENCY);

        #[cfg(not(test))]
        let (mut state, maintenance_frequency) = (PoolState::New, MAINTENANCE_FREQUENCY);

        if load_balanced {
            state = PoolState::Ready;
        }

        let (cancellation_sender, _) = broadcast::channel(1);

        let worker = ConnectionPoolWorker {
            address,
            event_emitter,
            max_idle_time,
            min_pool_size,
            establisher,
            next_connection_id: 1,
            total_connection_count: 0,
            pending_connection_count: 0,
            generation,
            available_connections: VecDeque::new(),
            max_pool_size,
            max_connecting,
            request_receiver,
            wait_queue: Default::default(),
            management_receiver,
            manager: manager.clone(),
            handle_listener,
            state,
            generation_publisher,
            interrupt_publisher,
            interrupt_subscriber,
            maintenance_frequency,
            cancellation_sender,
        };

        runtime::execute(async move {
            worker.execute().await;
        });

        (manager, connection_requester, generation_subscriber)
    }

    /// Run the worker thread, listening on the various receivers until all handles have been
    /// dropped. Once all handles are dropped, the pool will close any available connections and
    /// emit a pool closed event.
    async fn execute(mut self) {
        let mut maintenance_interval = tokio::time::interval(self.maintenance_frequency);
        maintenance_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let task = tokio::select! {
                // This marker indicates that the futures will be polled in order from top to
                // bottom, so check-ins and clears are seen before new requests.
                biased;

                Some(request) = self.management_receiver.recv() => request.into(),
                Some(request) = self.request_receiver.recv() => {
                    PoolTask::CheckOut(request)
                },
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    // all worker handles have been dropped meaning this
                    // pool has no more references and can be dropped itself.
                    break
                },
                _ = maintenance_interval.tick() => {
                    PoolTask::Maintenance
                },
                else => {
                    break
                }
            };

            match task {
                PoolTask::CheckOut(request) => match self.state {
                    PoolState::Ready => {
                        self.wait_queue.push_back(request);
                    }
                    PoolState::New => {
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(
                            Error::internal("check out attempted from a pool that is not ready yet"),
                        ));
                    }
                    PoolState::Paused(ref cause) => {
                        // if receiver doesn't listen to error that's ok.
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(cause.clone()));
                    }
                    PoolState::Closed => {
                        let _ = request.fulfill(ConnectionRequestResult::PoolClosed);
                    }
                },
                PoolTask::HandleManagementRequest(request) => match *request {
                    PoolManagementRequest::CheckIn(connection) => self.check_in(*connection),
                    PoolManagementRequest::Clear {
                        completion_handler,
                        cause,
                        service_id,
                        interrupt_in_use_connections,
                    } => {
                        self.clear(cause, service_id, interrupt_in_use_connections);
                        completion_handler.acknowledge(());
                    }
                    PoolManagementRequest::MarkAsReady { completion_handler } => {
                        self.mark_as_ready();
                        completion_handler.acknowledge(());
                    }
                    PoolManagementRequest::Close { completion_handler } => {
                        self.close();
                        completion_handler.acknowledge(());
                    }
                    PoolManagementRequest::HandleConnectionSucceeded(conn) => {
                        self.handle_connection_succeeded(conn);
                    }
                    PoolManagementRequest::HandleConnectionFailed => {
                        self.handle_connection_failed();
                    }
                },
                PoolTask::Maintenance => {
                    self.perform_maintenance();
                }
            }

            // Serve waiters strictly in order. A request that can't be served yet goes back to
            // the front of the queue.
            while self.can_service_connection_request() {
                let Some(request) = self.wait_queue.pop_front() else {
                    break;
                };
                if request.is_cancelled() {
                    continue;
                }
                if !self.check_out(request) {
                    break;
                }
            }
        }

        while let Some(connection) = self.available_connections.pop_front() {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }

        if !matches!(self.state, PoolState::Closed) {
            self.event_emitter.emit_event(|| {
                PoolClosedEvent {
                    address: self.address.clone(),
                }
                .into()
            });
        }
    }

    fn below_max_pool_size(&self) -> bool {
        self.max_pool_size
            .is_none_or(|max| self.total_connection_count < max)
    }

    fn can_service_connection_request(&self) -> bool {
        if !matches!(self.state, PoolState::Ready) {
            return false;
        }

        if !self.available_connections.is_empty() {
            return true;
        }

        self.below_max_pool_size() && self.pending_connection_count < self.max_connecting
    }

    /// Attempts to satisfy `request`. Returns false if it had to be requeued.
    fn check_out(&mut self, request: ConnectionRequest) -> bool {
        // first attempt to check out an available connection
        while let Some(mut conn) = self.available_connections.pop_back() {
            // Close the connection if it's stale.
            if conn.generation.is_stale(&self.generation) {
                self.close_connection(conn, ConnectionClosedReason::Stale);
                continue;
            }

            // Close the connection if it's idle.
            if conn.is_idle(self.max_idle_time) {
                self.close_connection(conn, ConnectionClosedReason::Idle);
                continue;
            }

            conn.mark_as_in_use(self.manager.clone());
            if let Err(result) = request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn))) {
                // The requester stopped listening, e.g. because its wait queue timeout fired, so
                // the connection goes back into the pool.
                if let ConnectionRequestResult::Pooled(mut connection) = result {
                    connection.mark_as_available();
                    self.available_connections.push_back(*connection);
                }
            }

            return true;
        }

        // otherwise, attempt to create a connection.
        if self.below_max_pool_size() && self.pending_connection_count < self.max_connecting {
            let event_emitter = self.event_emitter.clone();
            let establisher = self.establisher.clone();
            let pending_connection = self.create_pending_connection();
            let manager = self.manager.clone();

            let handle = runtime::spawn(async move {
                let mut establish_result = establish_connection(
                    &establisher,
                    pending_connection,
                    &manager,
                    &event_emitter,
                )
                .await;

                if let Ok(ref mut c) = establish_result {
                    c.mark_as_in_use(manager.clone());
                    manager.handle_connection_succeeded(ConnectionSucceeded::Used);
                }

                establish_result
            });

            // this only fails if the other end stopped listening (e.g. due to timeout), in
            // which case we just let the connection establish in the background.
            let _: std::result::Result<_, _> =
                request.fulfill(ConnectionRequestResult::Establishing(handle));
            true
        } else {
            // put the request to the front of the wait queue so that it will be processed
            // next time a request can be processed.
            self.wait_queue.push_front(request);
            false
        }
    }

    fn create_pending_connection(&mut self) -> PendingConnection {
        self.total_connection_count += 1;
        self.pending_connection_count += 1;

        let pending_connection = PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.generation.clone(),
            event_emitter: self.event_emitter.clone(),
            time_created: std::time::Instant::now(),
            cancellation_receiver: Some(self.cancellation_sender.subscribe()),
            interrupt_subscriber: Some(self.interrupt_subscriber.clone()),
        };
        self.next_connection_id += 1;
        self.event_emitter
            .emit_event(|| pending_connection.created_event().into());

        pending_connection
    }

    /// Process a connection establishment failure.
    fn handle_connection_failed(&mut self) {
        // Establishing a pending connection failed, so that must be reflected in to total
        // connection count.
        self.total_connection_count -= 1;
        self.pending_connection_count -= 1;
    }

    /// Process a successful connection establishment, optionally populating the pool with the
    /// resulting connection.
    fn handle_connection_succeeded(&mut self, connection: ConnectionSucceeded) {
        self.pending_connection_count -= 1;
        if let ConnectionSucceeded::ForPool(connection) = connection {
            let mut connection = *connection;
            if matches!(self.state, PoolState::Closed) {
                self.close_connection(connection, ConnectionClosedReason::PoolClosed);
                return;
            }
            connection.mark_as_available();
            self.available_connections.push_back(connection);
        }
    }

    fn check_in(&mut self, mut conn: PooledConnection) {
        self.event_emitter
            .emit_event(|| conn.checked_in_event().into());

        conn.mark_as_available();

        if conn.has_errored() {
            self.close_connection(conn, ConnectionClosedReason::Error);
        } else if conn.generation.is_stale(&self.generation) {
            self.close_connection(conn, ConnectionClosedReason::Stale);
        } else if conn.is_executing() || conn.is_streaming() || conn.is_closed() {
            self.close_connection(conn, ConnectionClosedReason::Dropped);
        } else if matches!(self.state, PoolState::Closed) {
            self.close_connection(conn, ConnectionClosedReason::PoolClosed);
        } else {
            self.available_connections.push_back(conn);
        }
    }

    fn clear(&mut self, cause: Error, service_id: Option<ObjectId>, interrupt_in_use: bool) {
        if matches!(self.state, PoolState::Closed) {
            return;
        }

        let was_ready = match (&mut self.generation, service_id) {
            (PoolGeneration::Normal(gen), None) => {
                *gen += 1;
                let prev = std::mem::replace(&mut self.state, PoolState::Paused(cause.clone()));
                matches!(prev, PoolState::Ready)
            }
            // Load-balanced pools are never paused; only the service's connections go stale.
            (PoolGeneration::LoadBalanced(gen_map), Some(service_id)) => {
                *gen_map.entry(service_id).or_insert(0) += 1;
                true
            }
            (_, _) => load_balanced_mode_mismatch!(),
        };
        self.generation_publisher.publish(self.generation.clone());
        if interrupt_in_use {
            self.interrupt_publisher.publish(self.generation.clone());
        }

        if was_ready {
            self.event_emitter.emit_event(|| {
                PoolClearedEvent {
                    address: self.address.clone(),
                    service_id,
                    interrupt_in_use_connections: interrupt_in_use,
                }
                .into()
            });

            if !matches!(self.generation, PoolGeneration::LoadBalanced(_)) {
                for request in self.wait_queue.drain(..) {
                    // an error means the other end hung up already, which is okay because we were
                    // returning an error anyways
                    let _: std::result::Result<_, _> =
                        request.fulfill(ConnectionRequestResult::PoolCleared(cause.clone()));
                }
            }
        }
    }

    fn mark_as_ready(&mut self) {
        if !matches!(self.state, PoolState::New | PoolState::Paused(_)) {
            return;
        }

        self.state = PoolState::Ready;
        self.event_emitter.emit_event(|| {
            PoolReadyEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    fn close(&mut self) {
        if matches!(self.state, PoolState::Closed) {
            return;
        }
        self.state = PoolState::Closed;

        // Nobody may be establishing, which is fine.
        let _ = self.cancellation_sender.send(());

        while let Some(connection) = self.available_connections.pop_front() {
            self.close_connection(connection, ConnectionClosedReason::PoolClosed);
        }
        for request in self.wait_queue.drain(..) {
            let _: std::result::Result<_, _> = request.fulfill(ConnectionRequestResult::PoolClosed);
        }

        self.event_emitter.emit_event(|| {
            PoolClosedEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    /// Close a connection, emit the event for it being closed, and decrement the
    /// total connection count. Per-service generations outlive the service's last connection.
    fn close_connection(&mut self, connection: PooledConnection, reason: ConnectionClosedReason) {
        connection.close_and_drop(reason);
        self.total_connection_count -= 1;
    }

    /// Ensure all connections in the pool are valid and that the pool is managing at least
    /// min_pool_size connections.
    fn perform_maintenance(&mut self) {
        self.remove_perished_connections();
        if matches!(self.state, PoolState::Ready) {
            self.ensure_min_connections();
        }
    }

    /// Iterate over the connections and remove any that are stale or idle.
    fn remove_perished_connections(&mut self) {
        while let Some(connection) = self.available_connections.pop_front() {
            if connection.generation.is_stale(&self.generation) {
                self.close_connection(connection, ConnectionClosedReason::Stale);
            } else if connection.is_idle(self.max_idle_time) {
                self.close_connection(connection, ConnectionClosedReason::Idle);
            } else if connection.is_closed() {
                self.close_connection(connection, ConnectionClosedReason::Error);
            } else {
                self.available_connections.push_front(connection);
                // All subsequent connections are either not idle or not stale since they were
                // checked into the pool later, so we can just quit early.
                break;
            };
        }
    }

    /// Starts one more connection when the pool is below `min_pool_size`, so the pool grows by at
    /// most one connection per maintenance tick and never exceeds `max_connecting` in flight.
    fn ensure_min_connections(&mut self) {
        if let Some(min_pool_size) = self.min_pool_size {
            if self.total_connection_count < min_pool_size
                && self.pending_connection_count < self.max_connecting
            {
                let pending_connection = self.create_pending_connection();
                let event_emitter = self.event_emitter.clone();
                let manager = self.manager.clone();
                let establisher = self.establisher.clone();
                runtime::execute(async move {
                    let connection = establish_connection(
                        &establisher,
                        pending_connection,
                        &manager,
                        &event_emitter,
                    )
                    .await;

                    if let Ok(connection) = connection {
                        manager
                            .handle_connection_succeeded(ConnectionSucceeded::ForPool(Box::new(
                                connection,
                            )))
                    }
                });
            }
        }
    }
}

/// Helper covering the common connection establishment behavior between
/// connections established in check_out and those established as part of
/// satisfying min_pool_size.
async fn establish_connection(
    establisher: &ConnectionEstablisher,
    pending_connection: PendingConnection,
    manager: &PoolManager,
    event_emitter: &CmapEventEmitter,
) -> Result<PooledConnection> {
    let connection_id = pending_connection.id;
    let address = pending_connection.address.clone();

    let establish_result = establisher.establish_connection(pending_connection).await;

    match establish_result {
        Err(ref e) => {
            event_emitter.emit_event(|| {
                ConnectionClosedEvent {
                    address,
                    reason: ConnectionClosedReason::Error,
                    connection_id,
                    error: Some(e.clone()),
                }
                .into()
            });
            manager.handle_connection_failed();
        }
        Ok(ref connection) => {
            event_emitter.emit_event(|| connection.ready_event().into());
        }
    }

    establish_result
}

/// The generation of a pool, bumped on every clear. In load-balanced mode each backend service
/// has its own counter.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum PoolGeneration {
    /// The pool's single counter.
    Normal(u32),

    /// Counters per backend service. A service with no entry is at generation 0.
    LoadBalanced(HashMap<ObjectId, u32>),
}

impl PoolGeneration {
    pub(crate) fn normal() -> Self {
        Self::Normal(0)
    }

    pub(crate) fn load_balanced() -> Self {
        Self::LoadBalanced(HashMap::new())
    }
}

/// The states a pool moves through.
#[derive(Debug)]
enum PoolState {
    /// Not marked ready since it was created. Behaves like `Paused`.
    New,

    /// Connections may not be checked out nor created in the background to satisfy minPoolSize.
    /// Carries the error that caused the last clear.
    Paused(Error),

    /// Pool is operational.
    Ready,

    /// The pool was closed; nothing may be checked out any more.
    Closed,
}

/// Task to process by the worker.
#[derive(Debug)]
enum PoolTask {
    /// Handle a management request from a `PoolManager`.
    HandleManagementRequest(Box<PoolManagementRequest>),

    /// Fulfill the given connection request.
    CheckOut(ConnectionRequest),

    /// Perform pool maintenance (ensure min connections, remove stale or idle connections).
    Maintenance,
}

impl From<PoolManagementRequest> for PoolTask {
    fn from(request: PoolManagementRequest) -> Self {
        PoolTask::HandleManagementRequest(Box::new(request))
    }
}
