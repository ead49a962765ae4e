//! Runs operations against the servers a [`ServerSelector`] picks, retrying once when the
//! operation, the session and the error all allow it.

#[cfg(test)]
mod test;

use std::{sync::Arc, time::Instant};

use derive_where::derive_where;
use futures_util::{future::BoxFuture, FutureExt};
use serde::Deserialize;
use tokio::sync::watch;
use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, Document},
    cmap::{
        conn::wire::next_request_id,
        Command,
        ConnectionPool,
        PooledConnection,
        RawCommandResponse,
        StreamDescription,
    },
    error::{
        Error,
        ErrorKind,
        Result,
        NO_WRITES_PERFORMED,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    event::{
        command::{
            CommandEvent,
            CommandEventEmitter,
            CommandFailedEvent,
            CommandStartedEvent,
            CommandSucceededEvent,
        },
        EventHandler,
    },
    hello::ServerType,
    options::{SelectionCriteria, ServerAddress, ServerApi},
    session::{ClientSession, ClusterTime, TransactionState},
};

const COMMIT_TRANSACTION: &str = "commitTransaction";
const ABORT_TRANSACTION: &str = "abortTransaction";

/// Options for an [`Executor`].
#[derive(Clone, Default, Deserialize, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ExecutorOptions {
    /// Whether reads that fail with a retryable error are retried once.
    ///
    /// The default is true.
    pub retry_reads: Option<bool>,

    /// Whether writes that fail with a retryable error are retried once. Retryable writes need a
    /// session and a server that supports them.
    ///
    /// The default is true.
    pub retry_writes: Option<bool>,

    /// The declared API version sent with every command.
    #[serde(skip)]
    pub server_api: Option<ServerApi>,

    /// Receives the command monitoring events.
    #[derive_where(skip)]
    #[builder(setter(strip_option))]
    #[serde(skip)]
    pub command_event_handler: Option<EventHandler<CommandEvent>>,
}

/// How an operation may be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retryability {
    /// Retried once on a retryable write error.
    Write,
    /// Retried once on a retryable read error.
    Read,
    /// Never retried.
    None,
}

impl Retryability {
    /// Returns this level of retryability in tandem with the executor's options.
    pub(crate) fn with_options(&self, options: &ExecutorOptions) -> Self {
        match self {
            Self::Write if options.retry_writes != Some(false) => Self::Write,
            Self::Read if options.retry_reads != Some(false) => Self::Read,
            _ => Self::None,
        }
    }

    pub(crate) fn can_retry_error(&self, error: &Error) -> bool {
        match self {
            Self::Write => error.is_write_retryable(),
            Self::Read => error.is_read_retryable(),
            Self::None => false,
        }
    }
}

/// A logical operation: a command to build for a particular server plus the rules for
/// interpreting the reply.
pub trait Operation: Send {
    /// The output type of this operation.
    type O;

    /// The name of the server-side command this operation runs.
    fn name(&self) -> &str;

    /// Returns the command that should be sent to the server as part of this operation.
    /// Called once per attempt.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server's reply to the command.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Interprets an error the command failed with. The default propagates it.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether this operation may be retried.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    /// Whether this operation may run with a session.
    fn supports_sessions(&self) -> bool {
        true
    }
}

/// Picks the server an operation runs on.
pub trait ServerSelector: Send + Sync {
    /// Selects a server matching `criteria`. Servers in `deprioritized` already failed the
    /// current operation and should only be returned when no other server is suitable.
    fn select_server<'a>(
        &'a self,
        criteria: Option<&'a SelectionCriteria>,
        deprioritized: &'a [ServerAddress],
    ) -> BoxFuture<'a, Result<SelectedServer>>;

    /// Called with every error an operation hit on a selected server, after the executor has
    /// done its own bookkeeping. Topology owners use this to mark servers unknown and clear
    /// their pools.
    fn handle_application_error<'a>(
        &'a self,
        _address: &'a ServerAddress,
        _error: &'a Error,
    ) -> BoxFuture<'a, ()> {
        async {}.boxed()
    }
}

/// A single pool is a deployment of one server.
impl ServerSelector for ConnectionPool {
    fn select_server<'a>(
        &'a self,
        criteria: Option<&'a SelectionCriteria>,
        _deprioritized: &'a [ServerAddress],
    ) -> BoxFuture<'a, Result<SelectedServer>> {
        async move {
            if let Some(SelectionCriteria::Predicate(predicate)) = criteria {
                if !predicate(self.address()) {
                    return Err(ErrorKind::ServerSelection {
                        message: format!(
                            "{} does not match the selection criteria",
                            self.address()
                        ),
                    }
                    .into());
                }
            }
            Ok(SelectedServer::new(self.clone()))
        }
        .boxed()
    }
}

/// The server an operation was routed to.
#[derive(Clone, Debug)]
pub struct SelectedServer {
    pool: ConnectionPool,
}

impl SelectedServer {
    /// Wraps the pool of the selected server.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// The address of the selected server.
    pub fn address(&self) -> &ServerAddress {
        self.pool.address()
    }

    /// The pool connections to the selected server come from.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

/// Executes operations: selects a server, checks out a connection, sends the command, emits
/// command events and decides whether a failure is retried.
///
/// Cheap to clone; clones share the highest cluster time seen.
#[derive(Clone, Debug)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

#[derive_where(Debug)]
struct ExecutorInner {
    #[derive_where(skip)]
    selector: Box<dyn ServerSelector>,

    options: ExecutorOptions,

    #[derive_where(skip)]
    command_events: CommandEventEmitter,

    cluster_time: watch::Sender<Option<ClusterTime>>,
}

impl Executor {
    /// Creates an executor that routes operations through `selector`.
    pub fn new(
        selector: impl ServerSelector + 'static,
        options: impl Into<Option<ExecutorOptions>>,
    ) -> Self {
        let options = options.into().unwrap_or_default();
        let command_events = CommandEventEmitter::new(options.command_event_handler.clone());
        let (cluster_time, _) = watch::channel(None);

        Self {
            inner: Arc::new(ExecutorInner {
                selector: Box::new(selector),
                options,
                command_events,
                cluster_time,
            }),
        }
    }

    /// The options this executor was created with.
    pub fn options(&self) -> &ExecutorOptions {
        &self.inner.options
    }

    /// The highest cluster time any reply has carried.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.inner.cluster_time.borrow().clone()
    }

    /// Replaces the gossiped cluster time if `to` is newer.
    pub fn advance_cluster_time(&self, to: &ClusterTime) {
        self.inner.cluster_time.send_if_modified(|current| {
            if current.as_ref().is_none_or(|current| current < to) {
                *current = Some(to.clone());
                true
            } else {
                false
            }
        });
    }

    /// Executes `op`.
    ///
    /// Without a session the operation runs exactly once. With one, an operation that is
    /// retryable under the executor's options is retried once on a retryable error, preferring a
    /// different server than the one that failed. A failed retry returns its own error, unless
    /// that error carries the `NoWritesPerformed` label, in which case the original error is
    /// returned instead.
    pub async fn execute<T: Operation>(
        &self,
        op: &mut T,
        session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        let mut session = session;
        let mut retry: Option<ExecutionRetry> = None;

        loop {
            if retry.is_some() {
                op.update_for_retry();
            }

            let pinned_criteria = session
                .as_ref()
                .and_then(|s| s.pinned_mongos())
                .map(pinned_to);
            let criteria = pinned_criteria
                .as_ref()
                .or_else(|| op.selection_criteria());
            let deprioritized: &[ServerAddress] = match retry {
                Some(ref r) => std::slice::from_ref(&r.first_server),
                None => &[],
            };

            let selected = self
                .inner
                .selector
                .select_server(criteria, deprioritized)
                .await;
            let server = match selected {
                Ok(server) => server,
                Err(mut err) => {
                    err.add_labels_and_update_pin(None, &mut session, None);
                    return Err(retry.surface(err));
                }
            };
            let server_address = server.address().clone();

            let mut conn = match get_connection(&session, server.pool()).await {
                Ok(conn) => conn,
                Err(mut err) => {
                    err.add_labels_and_update_pin(None, &mut session, None);
                    if err.is_read_retryable() && self.inner.options.retry_writes != Some(false) {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }
                    if retry.is_some() {
                        return Err(retry.surface(err));
                    }

                    let retryability = match session {
                        Some(_) => op.retryability().with_options(&self.inner.options),
                        None => Retryability::None,
                    };
                    let can_retry = match retryability {
                        // A cleared pool never ran the read, even in a transaction.
                        Retryability::Read if err.is_pool_cleared() => true,
                        _ => {
                            retryability.can_retry_error(&err)
                                && !session.as_ref().is_some_and(|s| s.in_transaction())
                        }
                    };
                    if can_retry {
                        retry = Some(ExecutionRetry {
                            prior_txn_number: None,
                            first_error: err,
                            first_server: server_address,
                        });
                        continue;
                    }
                    return Err(err);
                }
            };

            let description = conn.stream_description()?.clone();
            if session.is_some() && op.supports_sessions() && !description.supports_sessions() {
                return Err(ErrorKind::SessionsNotSupported.into());
            }

            let retryability = match session {
                Some(ref s) => self.get_retryability(op, s, &description),
                None => Retryability::None,
            };
            if retryability == Retryability::None {
                retry.first_error()?;
            }

            let txn_number = match retry.as_ref().and_then(|r| r.prior_txn_number) {
                Some(txn_number) => Some(txn_number),
                None => session
                    .as_deref_mut()
                    .and_then(|s| s.txn_number_for_operation(retryability)),
            };

            let result = self
                .execute_on_connection(
                    op,
                    &mut conn,
                    &mut session,
                    txn_number,
                    retryability,
                    &description,
                )
                .await;

            let mut err = match result {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            err.wire_version = description.max_wire_version;
            let unsupported_retryable_write = err.is_unsupported_retryable_write();
            if unsupported_retryable_write {
                err.rewrite_unsupported_retryable_write();
            }

            if err.is_network_error() {
                handle_network_error(&conn, &server, &mut session, &err).await;
            }
            self.inner
                .selector
                .handle_application_error(&server_address, &err)
                .await;
            // Return the connection before the retry checks one out.
            drop(conn);

            if retry.is_some() {
                return Err(retry.surface(err));
            }

            if retryability.can_retry_error(&err)
                && !unsupported_retryable_write
                && !err.is_partial_write_failure()
            {
                #[cfg(feature = "tracing-unstable")]
                tracing::debug!(
                    operation = op.name(),
                    address = %server_address,
                    error = %err,
                    "retrying operation"
                );
                retry = Some(ExecutionRetry {
                    prior_txn_number: txn_number,
                    first_error: err,
                    first_server: server_address,
                });
                continue;
            }
            return Err(err);
        }
    }

    /// Runs one attempt of `op` on `connection`, emitting the command events around it.
    async fn execute_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut PooledConnection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
        retryability: Retryability,
        description: &StreamDescription,
    ) -> Result<T::O> {
        let cmd = self.build_command(op, connection, session, txn_number, description)?;

        let connection_info = connection.info();
        let service_id = connection.service_id();
        let request_id = next_request_id();
        let should_redact = cmd.should_redact();
        let command_name = cmd.name().to_string();

        self.inner.command_events.emit_event(|| {
            let command = if should_redact {
                Document::new()
            } else {
                cmd.clone()
                    .into_document()
                    .ok()
                    .and_then(|raw| raw.to_document().ok())
                    .unwrap_or_default()
            };
            CommandEvent::Started(CommandStartedEvent {
                command,
                db: cmd.target_db().to_string(),
                command_name: command_name.clone(),
                request_id,
                connection: connection_info.clone(),
                service_id,
            })
        });

        let start_time = Instant::now();
        let command_result = match connection.send_command(cmd, request_id).await {
            Ok(response) => self.parse_response(session, &response).map(|()| response),
            Err(err) => Err(err),
        };
        let duration = start_time.elapsed();

        match command_result {
            Err(mut err) => {
                self.inner.command_events.emit_event(|| {
                    let mut err = err.clone();
                    if should_redact {
                        err.redact();
                    }
                    CommandEvent::Failed(CommandFailedEvent {
                        duration,
                        command_name: command_name.clone(),
                        failure: err,
                        request_id,
                        connection: connection_info.clone(),
                        service_id,
                    })
                });

                if let Some(session) = session.as_deref_mut() {
                    if err.is_network_error() {
                        session.mark_dirty();
                    }
                }

                err.add_labels_and_update_pin(Some(description), session, Some(retryability));
                op.handle_error(err)
            }
            Ok(response) => {
                self.inner.command_events.emit_event(|| {
                    let reply = if should_redact {
                        Document::new()
                    } else {
                        response
                            .body::<Document>()
                            .unwrap_or_else(|e| doc! { "deserialization error": e.to_string() })
                    };
                    CommandEvent::Succeeded(CommandSucceededEvent {
                        duration,
                        reply,
                        command_name: command_name.clone(),
                        request_id,
                        connection: connection_info.clone(),
                        service_id,
                    })
                });

                op.handle_response(response, description).map_err(|mut err| {
                    err.add_labels_and_update_pin(Some(description), session, Some(retryability));
                    err
                })
            }
        }
    }

    fn build_command<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut PooledConnection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
        description: &StreamDescription,
    ) -> Result<Command> {
        let mut cmd = op.build(description)?;

        let routed = matches!(
            description.initial_server_type,
            ServerType::Mongos | ServerType::LoadBalancer
        );
        if let Some(read_preference) = op
            .selection_criteria()
            .filter(|criteria| routed && !criteria.is_read_pref_primary())
            .and_then(|criteria| criteria.as_read_pref())
        {
            cmd.set_read_preference(read_preference.clone());
        }

        if let Some(session) = session.as_deref_mut() {
            if op.supports_sessions() {
                cmd.set_session(session);
                if let Some(txn_number) = txn_number {
                    cmd.set_txn_number(txn_number);
                }

                match session.transaction_state {
                    TransactionState::Starting => {
                        cmd.set_start_transaction();
                        cmd.set_autocommit();
                        match description.initial_server_type {
                            ServerType::Mongos => session.pin_mongos(connection.address().clone()),
                            ServerType::LoadBalancer => session.pin_connection(connection.pin()?),
                            _ => {}
                        }
                        session.transaction_state = TransactionState::InProgress;
                    }
                    TransactionState::InProgress => cmd.set_autocommit(),
                    TransactionState::Committed | TransactionState::Aborted
                        if ends_transaction(op.name()) =>
                    {
                        cmd.set_autocommit()
                    }
                    _ => {}
                }
                session.update_last_use();
            }
        }

        let session_cluster_time = session.as_ref().and_then(|s| s.cluster_time());
        let gossiped_cluster_time = self.cluster_time();
        if let Some(cluster_time) =
            std::cmp::max(session_cluster_time, gossiped_cluster_time.as_ref())
        {
            cmd.set_cluster_time(cluster_time);
        }

        if let Some(ref server_api) = self.inner.options.server_api {
            cmd.set_server_api(server_api);
        }

        Ok(cmd)
    }

    /// Gossips the cluster and operation times of a reply, then checks it for a command error.
    fn parse_response(
        &self,
        session: &mut Option<&mut ClientSession>,
        response: &RawCommandResponse,
    ) -> Result<()> {
        if let Some(cluster_time) = response.cluster_time() {
            self.advance_cluster_time(&cluster_time);
            if let Some(session) = session.as_deref_mut() {
                session.advance_cluster_time(&cluster_time);
            }
        }
        if let Some(operation_time) = response.operation_time() {
            if let Some(session) = session.as_deref_mut() {
                session.advance_operation_time(operation_time);
            }
        }

        response.validate()
    }

    /// Returns the retryability level for the execution of this operation with the given session
    /// and connection stream description.
    fn get_retryability<T: Operation>(
        &self,
        op: &T,
        session: &ClientSession,
        description: &StreamDescription,
    ) -> Retryability {
        // Ending a transaction is always retried, regardless of retry_writes.
        if ends_transaction(op.name()) {
            return Retryability::Write;
        }

        if session.in_transaction() {
            return Retryability::None;
        }

        match op.retryability().with_options(&self.inner.options) {
            Retryability::Write if description.supports_retryable_writes() => Retryability::Write,
            Retryability::Read => Retryability::Read,
            _ => Retryability::None,
        }
    }
}

fn ends_transaction(name: &str) -> bool {
    name == COMMIT_TRANSACTION || name == ABORT_TRANSACTION
}

fn pinned_to(address: &ServerAddress) -> SelectionCriteria {
    let address = address.clone();
    SelectionCriteria::Predicate(Arc::new(move |candidate: &ServerAddress| {
        candidate == &address
    }))
}

async fn get_connection(
    session: &Option<&mut ClientSession>,
    pool: &ConnectionPool,
) -> Result<PooledConnection> {
    match session.as_ref().and_then(|s| s.pinned_connection()) {
        Some(handle) => handle.take_connection().await,
        None => pool.check_out().await,
    }
}

/// A network error on a connection unpins it from the session and, behind a load balancer, clears
/// the pool for the service it was talking to.
async fn handle_network_error(
    conn: &PooledConnection,
    server: &SelectedServer,
    session: &mut Option<&mut ClientSession>,
    error: &Error,
) {
    if let Some(session) = session.as_deref_mut() {
        if session
            .pinned_connection()
            .is_some_and(|handle| handle.id() == conn.id())
        {
            session.unpin();
        }
    }

    let Some(service_id) = conn.service_id() else {
        return;
    };
    if error.is_network_timeout() || conn.generation.is_stale(&server.pool().generation()) {
        return;
    }
    server
        .pool()
        .clear(error.clone(), Some(service_id), false)
        .await;
}

impl Error {
    /// Adds the necessary labels to this Error, and unpins the session if needed.
    ///
    /// A TransientTransactionError label should be added if a transaction is in progress and the
    /// error is a network or server selection error.
    ///
    /// On a pre-4.4 connection, a RetryableWriteError label should be added to any write-retryable
    /// error. On a 4.4+ connection, a label should only be added to network errors. Regardless of
    /// server version, a label should only be added if the operation is write-retryable under the
    /// executor's options and a TransientTransactionError label has not already been added.
    ///
    /// If the TransientTransactionError or UnknownTransactionCommitResult labels are added, the
    /// ClientSession should be unpinned.
    fn add_labels_and_update_pin(
        &mut self,
        description: Option<&StreamDescription>,
        session: &mut Option<&mut ClientSession>,
        retryability: Option<Retryability>,
    ) {
        let transaction_state = session
            .as_ref()
            .map_or(&TransactionState::None, |session| session.transaction_state());
        let max_wire_version = description.and_then(|sd| sd.max_wire_version);
        let server_type = description.map(|sd| sd.initial_server_type);

        match transaction_state {
            TransactionState::Starting | TransactionState::InProgress => {
                if self.is_network_error() || self.is_server_selection_error() {
                    self.add_label(TRANSIENT_TRANSACTION_ERROR);
                }
            }
            TransactionState::Committed => {
                if let Some(max_wire_version) = max_wire_version {
                    if self.should_add_retryable_write_label(max_wire_version, server_type) {
                        self.add_label(RETRYABLE_WRITE_ERROR);
                    }
                }
                if self.should_add_unknown_transaction_commit_result_label() {
                    self.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                }
            }
            TransactionState::Aborted => {
                if let Some(max_wire_version) = max_wire_version {
                    if self.should_add_retryable_write_label(max_wire_version, server_type) {
                        self.add_label(RETRYABLE_WRITE_ERROR);
                    }
                }
            }
            TransactionState::None => {
                if retryability == Some(Retryability::Write) {
                    if let Some(max_wire_version) = max_wire_version {
                        if self.should_add_retryable_write_label(max_wire_version, server_type) {
                            self.add_label(RETRYABLE_WRITE_ERROR);
                        }
                    }
                }
            }
        }

        if let Some(session) = session.as_deref_mut() {
            if self.contains_label(TRANSIENT_TRANSACTION_ERROR)
                || self.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
            {
                session.unpin();
            }
        }
    }

    /// Servers whose storage engine lacks document-level locking reject retryable writes with a
    /// message that does not say how to fix it.
    fn rewrite_unsupported_retryable_write(&mut self) {
        if let ErrorKind::Command(ref mut command_error) = *self.kind {
            command_error.message = "This deployment does not support retryable writes. Please \
                                     set retry_writes to false."
                .to_string();
        }
    }
}

#[derive(Debug)]
struct ExecutionRetry {
    prior_txn_number: Option<i64>,
    first_error: Error,
    first_server: ServerAddress,
}

trait RetryHelper {
    fn first_error(&mut self) -> Result<()>;

    /// The error to report for an attempt that failed with `error`. A failed retry reports its
    /// own error unless it never performed a write.
    fn surface(&mut self, error: Error) -> Error;
}

impl RetryHelper for Option<ExecutionRetry> {
    fn first_error(&mut self) -> Result<()> {
        match self.take() {
            Some(r) => Err(r.first_error),
            None => Ok(()),
        }
    }

    fn surface(&mut self, error: Error) -> Error {
        match self.take() {
            Some(r) if error.contains_label(NO_WRITES_PERFORMED) => r.first_error,
            _ => error,
        }
    }
}
