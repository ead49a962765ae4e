use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use pretty_assertions::assert_eq;

use super::{
    Executor,
    ExecutorOptions,
    Operation,
    Retryability,
    SelectedServer,
    ServerSelector,
};
use crate::{
    bson::{doc, oid::ObjectId, Document, RawDocumentBuf, Timestamp},
    cmap::{
        establish::{ConnectionEstablisher, EstablisherOptions, TestEstablish},
        options::ConnectionPoolOptions,
        Command,
        ConnectionPool,
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
    },
    event::{cmap::CmapEvent, command::CommandEvent},
    hello::ServerType,
    options::{SelectionCriteria, ServerAddress},
    session::{ClientSession, TransactionState},
    test_util::{
        duplex,
        expect_err,
        serve,
        CmapEventBuffer,
        CommandEventBuffer,
        RequestLog,
        ServerAction,
    },
};

type Respond = Arc<dyn Fn(&Document) -> ServerAction + Send + Sync>;

fn hang_up() -> Respond {
    Arc::new(|_| ServerAction::Hangup)
}

fn reply(document: Document) -> Respond {
    Arc::new(move |_| ServerAction::Reply(document.clone()))
}

fn address(host: &str) -> ServerAddress {
    ServerAddress::Tcp {
        host: host.to_string(),
        port: Some(27017),
    }
}

/// A ready pool whose connections skip the handshake and are answered by `respond`.
fn scripted_pool(
    address: ServerAddress,
    description: StreamDescription,
    log: RequestLog,
    respond: Respond,
    events: Option<&CmapEventBuffer>,
) -> ConnectionPool {
    let load_balanced = description.initial_server_type == ServerType::LoadBalancer;
    let establish: TestEstablish = Arc::new(move |_address: &ServerAddress| {
        let (stream, server) = duplex();
        let respond = respond.clone();
        serve(server, log.clone(), move |command| respond(command));
        let description = description.clone();
        async move { Ok((stream, description)) }.boxed()
    });

    let mut establisher_options = EstablisherOptions::builder()
        .load_balanced(load_balanced)
        .build();
    establisher_options.test_establish = Some(establish);

    let mut pool_options = ConnectionPoolOptions::builder()
        .load_balanced(load_balanced)
        .build();
    pool_options.ready = Some(true);
    pool_options.cmap_event_handler = events.map(|events| events.handler());

    ConnectionPool::new(
        address,
        ConnectionEstablisher::new(establisher_options).unwrap(),
        Some(pool_options),
    )
    .unwrap()
}

/// Picks the first server that matches the criteria and has not failed the operation yet,
/// recording what it was asked to avoid.
#[derive(Clone)]
struct TestSelector {
    pools: Vec<ConnectionPool>,
    deprioritized: Arc<Mutex<Vec<Vec<ServerAddress>>>>,
}

impl TestSelector {
    fn deprioritized(&self) -> Vec<Vec<ServerAddress>> {
        self.deprioritized.lock().unwrap().clone()
    }
}

impl ServerSelector for TestSelector {
    fn select_server<'a>(
        &'a self,
        criteria: Option<&'a SelectionCriteria>,
        deprioritized: &'a [ServerAddress],
    ) -> BoxFuture<'a, Result<SelectedServer>> {
        self.deprioritized
            .lock()
            .unwrap()
            .push(deprioritized.to_vec());

        let suitable: Vec<&ConnectionPool> = self
            .pools
            .iter()
            .filter(|pool| match criteria {
                Some(SelectionCriteria::Predicate(predicate)) => predicate(pool.address()),
                _ => true,
            })
            .collect();
        let selected = suitable
            .iter()
            .find(|pool| !deprioritized.contains(pool.address()))
            .or_else(|| suitable.first())
            .map(|pool| SelectedServer::new((*pool).clone()));

        async move {
            selected.ok_or_else(|| {
                ErrorKind::ServerSelection {
                    message: "no suitable servers".to_string(),
                }
                .into()
            })
        }
        .boxed()
    }
}

/// Servers `a.test` and `b.test`, each answering with its own script.
struct Deployment {
    selector: TestSelector,
    logs: Vec<RequestLog>,
}

impl Deployment {
    fn new(responders: Vec<Respond>) -> Self {
        Self::with_description(StreamDescription::new_testing(), responders)
    }

    fn with_description(description: StreamDescription, responders: Vec<Respond>) -> Self {
        let mut pools = Vec::new();
        let mut logs = Vec::new();
        for (host, respond) in ["a.test", "b.test"].into_iter().zip(responders) {
            let log = RequestLog::default();
            pools.push(scripted_pool(
                address(host),
                description.clone(),
                log.clone(),
                respond,
                None,
            ));
            logs.push(log);
        }
        Self {
            selector: TestSelector {
                pools,
                deprioritized: Default::default(),
            },
            logs,
        }
    }

    fn requests(&self, server: usize) -> Vec<Document> {
        self.logs[server].lock().unwrap().clone()
    }

    fn total_requests(&self) -> usize {
        self.logs.iter().map(|log| log.lock().unwrap().len()).sum()
    }
}

/// Sends `{ <name>: 1 }` to the `test` database and returns the reply.
struct TestOp {
    name: &'static str,
    retryability: Retryability,
    attempts: usize,
    /// Treat every reply as malformed.
    reject_replies: bool,
}

impl TestOp {
    fn read() -> Self {
        Self::new("find", Retryability::Read)
    }

    fn write() -> Self {
        Self::new("insert", Retryability::Write)
    }

    fn new(name: &'static str, retryability: Retryability) -> Self {
        Self {
            name,
            retryability,
            attempts: 0,
            reject_replies: false,
        }
    }
}

impl Operation for TestOp {
    type O = Document;

    fn name(&self) -> &str {
        self.name
    }

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        self.attempts += 1;
        let mut body = RawDocumentBuf::new();
        body.append(self.name, 1);
        Ok(Command::new(self.name, "test", body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Document> {
        if self.reject_replies {
            return Err(Error::invalid_response("unexpected reply shape"));
        }
        response.body()
    }

    fn retryability(&self) -> Retryability {
        self.retryability
    }
}

fn executor(selector: impl ServerSelector + 'static) -> Executor {
    Executor::new(selector, ExecutorOptions::default())
}

fn shutting_down(labels: &[&str]) -> Document {
    doc! {
        "ok": 0,
        "code": 91,
        "codeName": "ShutdownInProgress",
        "errmsg": "shutting down",
        "errorLabels": labels.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
    }
}

#[test]
fn retryability_respects_options() {
    let defaults = ExecutorOptions::default();
    assert_eq!(Retryability::Read.with_options(&defaults), Retryability::Read);
    assert_eq!(Retryability::Write.with_options(&defaults), Retryability::Write);

    let disabled = ExecutorOptions::builder()
        .retry_reads(false)
        .retry_writes(false)
        .build();
    assert_eq!(Retryability::Read.with_options(&disabled), Retryability::None);
    assert_eq!(Retryability::Write.with_options(&disabled), Retryability::None);
    assert_eq!(Retryability::None.with_options(&defaults), Retryability::None);
}

#[tokio::test]
async fn retryable_network_error_is_attempted_exactly_twice() {
    let deployment = Deployment::new(vec![hang_up(), hang_up()]);
    let executor = executor(deployment.selector.clone());
    let mut session = ClientSession::new();
    let mut op = TestOp::read();

    let error = expect_err(executor.execute(&mut op, Some(&mut session)).await);

    assert!(error.is_network_error());
    assert_eq!(op.attempts, 2);
    assert_eq!(deployment.requests(0).len(), 1);
    assert_eq!(deployment.requests(1).len(), 1);
    assert_eq!(
        deployment.selector.deprioritized(),
        vec![vec![], vec![address("a.test")]]
    );
    assert!(session.is_dirty());
}

#[tokio::test]
async fn without_a_session_nothing_is_retried() {
    let deployment = Deployment::new(vec![hang_up(), hang_up()]);
    let executor = executor(deployment.selector.clone());
    let mut op = TestOp::read();

    let error = expect_err(executor.execute(&mut op, None).await);

    assert!(error.is_network_error());
    assert_eq!(op.attempts, 1);
    assert_eq!(deployment.total_requests(), 1);
}

#[tokio::test]
async fn disabled_retry_writes_are_attempted_once() {
    let deployment = Deployment::new(vec![hang_up(), hang_up()]);
    let executor = Executor::new(
        deployment.selector.clone(),
        ExecutorOptions::builder().retry_writes(false).build(),
    );
    let mut session = ClientSession::new();

    let error = expect_err(
        executor
            .execute(&mut TestOp::write(), Some(&mut session))
            .await,
    );

    assert!(error.is_network_error());
    assert!(!error.contains_label(RETRYABLE_WRITE_ERROR));
    assert_eq!(deployment.total_requests(), 1);
}

#[tokio::test]
async fn retried_write_reuses_its_transaction_number() {
    let deployment = Deployment::new(vec![hang_up(), reply(doc! { "ok": 1, "n": 1 })]);
    let executor = executor(deployment.selector.clone());
    let mut session = ClientSession::new();

    let reply = executor
        .execute(&mut TestOp::write(), Some(&mut session))
        .await
        .unwrap();
    assert_eq!(reply.get_i32("n").unwrap(), 1);

    let first = deployment.requests(0);
    let second = deployment.requests(1);
    assert_eq!(first[0].get_i64("txnNumber").unwrap(), 1);
    assert_eq!(second[0].get_i64("txnNumber").unwrap(), 1);
    assert_eq!(first[0].get_document("lsid").unwrap(), session.id());
    assert_eq!(second[0].get_document("lsid").unwrap(), session.id());
}

#[tokio::test]
async fn no_writes_performed_on_retry_surfaces_the_first_error() {
    let deployment = Deployment::new(vec![
        hang_up(),
        reply(shutting_down(&[RETRYABLE_WRITE_ERROR, NO_WRITES_PERFORMED])),
    ]);
    let executor = executor(deployment.selector.clone());
    let mut session = ClientSession::new();

    let error = expect_err(
        executor
            .execute(&mut TestOp::write(), Some(&mut session))
            .await,
    );

    assert!(error.is_network_error());
    assert!(error.contains_label(RETRYABLE_WRITE_ERROR));
    assert_eq!(deployment.total_requests(), 2);
}

#[tokio::test]
async fn failed_retry_surfaces_its_own_error() {
    let deployment = Deployment::new(vec![
        hang_up(),
        reply(shutting_down(&[RETRYABLE_WRITE_ERROR])),
    ]);
    let executor = executor(deployment.selector.clone());
    let mut session = ClientSession::new();

    let error = expect_err(
        executor
            .execute(&mut TestOp::write(), Some(&mut session))
            .await,
    );

    assert_eq!(error.code(), Some(91));
    assert_eq!(deployment.total_requests(), 2);
}

#[tokio::test]
async fn retry_failing_for_other_reasons_surfaces_its_own_error() {
    let deployment = Deployment::new(vec![hang_up(), reply(doc! { "ok": 1 })]);
    let executor = executor(deployment.selector.clone());
    let mut session = ClientSession::new();
    let mut op = TestOp::read();
    op.reject_replies = true;

    let error = expect_err(executor.execute(&mut op, Some(&mut session)).await);

    assert!(
        matches!(*error.kind, ErrorKind::InvalidResponse { .. }),
        "{error:?}"
    );
    assert!(!error.is_network_error());
    assert_eq!(op.attempts, 2);
}

#[tokio::test]
async fn unsupported_retryable_write_is_not_retried() {
    let deployment = Deployment::new(vec![
        reply(doc! {
            "ok": 0,
            "code": 20,
            "codeName": "IllegalOperation",
            "errmsg": "Transaction numbers are only allowed on storage engines that support \
                       document-level locking",
        }),
        reply(doc! { "ok": 1 }),
    ]);
    let executor = executor(deployment.selector.clone());
    let mut session = ClientSession::new();

    let error = expect_err(
        executor
            .execute(&mut TestOp::write(), Some(&mut session))
            .await,
    );

    assert_eq!(error.code(), Some(20));
    match *error.kind {
        ErrorKind::Command(ref command_error) => {
            assert!(command_error.message.contains("retry_writes"));
        }
        ref other => panic!("expected a command error, got {other:?}"),
    }
    assert_eq!(deployment.total_requests(), 1);
}

#[tokio::test]
async fn operations_in_a_transaction_are_not_retried() {
    let deployment = Deployment::new(vec![hang_up(), hang_up()]);
    let executor = executor(deployment.selector.clone());
    let mut session = ClientSession::new();
    session.start_transaction();

    let error = expect_err(
        executor
            .execute(&mut TestOp::read(), Some(&mut session))
            .await,
    );

    assert!(error.contains_label(TRANSIENT_TRANSACTION_ERROR));
    assert_eq!(deployment.total_requests(), 1);
    assert_eq!(session.transaction_state(), &TransactionState::InProgress);

    let command = &deployment.requests(0)[0];
    assert_eq!(command.get_bool("startTransaction").unwrap(), true);
    assert_eq!(command.get_bool("autocommit").unwrap(), false);
    assert_eq!(command.get_i64("txnNumber").unwrap(), 1);
}

#[tokio::test]
async fn read_is_retried_when_checkout_finds_the_pool_cleared() {
    let deployment = Deployment::new(vec![
        reply(doc! { "ok": 1 }),
        reply(doc! { "ok": 1, "from": "b" }),
    ]);
    deployment.selector.pools[0]
        .clear(Error::internal("server marked unknown"), None, false)
        .await;
    let executor = executor(deployment.selector.clone());
    let mut session = ClientSession::new();

    let reply = executor
        .execute(&mut TestOp::read(), Some(&mut session))
        .await
        .unwrap();

    assert_eq!(reply.get_str("from").unwrap(), "b");
    assert!(deployment.requests(0).is_empty());
    assert_eq!(deployment.requests(1).len(), 1);
}

#[tokio::test]
async fn command_events_redact_sensitive_commands() {
    let deployment = Deployment::new(vec![reply(doc! { "ok": 1, "payload": "secret" })]);
    let events = CommandEventBuffer::default();
    let executor = Executor::new(
        deployment.selector.clone(),
        ExecutorOptions::builder()
            .command_event_handler(events.handler())
            .build(),
    );

    executor
        .execute(&mut TestOp::new("saslStart", Retryability::None), None)
        .await
        .unwrap();
    executor
        .execute(&mut TestOp::new("ping", Retryability::None), None)
        .await
        .unwrap();

    let events = events.all();
    assert_eq!(events.len(), 4);
    match (&events[0], &events[1]) {
        (CommandEvent::Started(started), CommandEvent::Succeeded(succeeded)) => {
            assert_eq!(started.command_name, "saslStart");
            assert_eq!(started.command, Document::new());
            assert_eq!(succeeded.reply, Document::new());
            assert_eq!(started.request_id, succeeded.request_id);
        }
        other => panic!("unexpected events {other:?}"),
    }
    match (&events[2], &events[3]) {
        (CommandEvent::Started(started), CommandEvent::Succeeded(succeeded)) => {
            assert_eq!(started.db, "test");
            assert_eq!(started.command.get_i32("ping").unwrap(), 1);
            assert_eq!(succeeded.reply.get_str("payload").unwrap(), "secret");
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test]
async fn command_failure_emits_a_failed_event() {
    let deployment = Deployment::new(vec![reply(shutting_down(&[]))]);
    let events = CommandEventBuffer::default();
    let executor = Executor::new(
        deployment.selector.clone(),
        ExecutorOptions::builder()
            .command_event_handler(events.handler())
            .build(),
    );

    let error = expect_err(
        executor
            .execute(&mut TestOp::new("ping", Retryability::None), None)
            .await,
    );
    assert_eq!(error.code(), Some(91));

    let events = events.all();
    assert_eq!(events.len(), 2);
    match events[1] {
        CommandEvent::Failed(ref failed) => assert_eq!(failed.failure.code(), Some(91)),
        ref other => panic!("expected a failed event, got {other:?}"),
    }
}

#[tokio::test]
async fn cluster_time_is_gossiped() {
    let timestamp = Timestamp {
        time: 10,
        increment: 1,
    };
    let deployment = Deployment::new(vec![reply(doc! {
        "ok": 1,
        "$clusterTime": { "clusterTime": timestamp, "signature": { "keyId": 1i64 } },
        "operationTime": timestamp,
    })]);
    let executor = executor(deployment.selector.clone());
    let mut session = ClientSession::new();

    executor
        .execute(&mut TestOp::read(), Some(&mut session))
        .await
        .unwrap();

    let gossiped = executor.cluster_time().unwrap();
    assert_eq!(gossiped.cluster_time, timestamp);
    assert_eq!(session.cluster_time(), Some(&gossiped));
    assert_eq!(session.operation_time(), Some(timestamp));

    executor.execute(&mut TestOp::read(), None).await.unwrap();

    let requests = deployment.requests(0);
    assert!(!requests[0].contains_key("$clusterTime"));
    assert_eq!(
        requests[1]
            .get_document("$clusterTime")
            .unwrap()
            .get_timestamp("clusterTime")
            .unwrap(),
        timestamp
    );
}

#[tokio::test]
async fn sharded_transaction_pins_the_mongos() {
    let mut description = StreamDescription::new_testing();
    description.initial_server_type = ServerType::Mongos;
    let deployment = Deployment::with_description(
        description,
        vec![reply(doc! { "ok": 1 }), reply(doc! { "ok": 1 })],
    );
    let executor = executor(deployment.selector.clone());
    let mut session = ClientSession::new();
    session.start_transaction();

    executor
        .execute(&mut TestOp::read(), Some(&mut session))
        .await
        .unwrap();
    assert_eq!(session.pinned_mongos(), Some(&address("a.test")));

    executor
        .execute(&mut TestOp::read(), Some(&mut session))
        .await
        .unwrap();
    assert_eq!(deployment.requests(0).len(), 2);
    assert!(deployment.requests(1).is_empty());
}

#[tokio::test]
async fn network_error_on_pinned_connection_unpins_and_clears_the_service() {
    let service_id = ObjectId::new();
    let mut description = StreamDescription::new_testing();
    description.initial_server_type = ServerType::LoadBalancer;
    description.service_id = Some(service_id);

    let requests = Arc::new(AtomicUsize::new(0));
    let respond: Respond = Arc::new(move |_| {
        if requests.fetch_add(1, Ordering::SeqCst) == 0 {
            ServerAction::Reply(doc! { "ok": 1 })
        } else {
            ServerAction::Hangup
        }
    });
    let cmap_events = CmapEventBuffer::default();
    let pool = scripted_pool(
        address("lb.test"),
        description,
        RequestLog::default(),
        respond,
        Some(&cmap_events),
    );
    let executor = executor(pool.clone());
    let mut session = ClientSession::new();
    session.start_transaction();

    executor
        .execute(&mut TestOp::read(), Some(&mut session))
        .await
        .unwrap();
    assert!(session.pinned_connection().is_some());

    let error = expect_err(
        executor
            .execute(&mut TestOp::read(), Some(&mut session))
            .await,
    );
    assert!(error.is_network_error());
    assert!(error.contains_label(TRANSIENT_TRANSACTION_ERROR));
    assert!(session.pinned_connection().is_none());

    let cleared = cmap_events
        .wait_for(1, Duration::from_secs(5), |event| {
            matches!(event, CmapEvent::PoolCleared(_))
        })
        .await;
    match cleared.first() {
        Some(CmapEvent::PoolCleared(event)) => {
            assert_eq!(event.service_id, Some(service_id));
            assert!(!event.interrupt_in_use_connections);
        }
        other => panic!("expected a pool cleared event, got {other:?}"),
    }
}

#[tokio::test]
async fn single_pool_selector_honors_predicates() {
    let pool = scripted_pool(
        address("a.test"),
        StreamDescription::new_testing(),
        RequestLog::default(),
        reply(doc! { "ok": 1 }),
        None,
    );

    let other = address("b.test");
    let criteria = SelectionCriteria::Predicate(Arc::new(move |a: &ServerAddress| a == &other));
    let error = expect_err(pool.select_server(Some(&criteria), &[]).await);
    assert!(matches!(*error.kind, ErrorKind::ServerSelection { .. }));

    let selected = pool.select_server(None, &[]).await.unwrap();
    assert_eq!(selected.address(), &address("a.test"));
}
