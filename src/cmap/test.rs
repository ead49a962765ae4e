use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::{Duration, Instant},
};

use futures_util::FutureExt;
use pretty_assertions::assert_eq;

use super::{
    establish::{ConnectionEstablisher, EstablisherOptions, TestEstablish},
    options::ConnectionPoolOptions,
    ConnectionPool,
    PoolGeneration,
    StreamDescription,
};
use crate::{
    bson::{doc, oid::ObjectId},
    error::Error,
    event::cmap::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason},
    options::ServerAddress,
    runtime,
    test_util::{duplex, expect_err, serve, CmapEventBuffer, RequestLog, ServerAction},
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections that skip the handshake and talk to an in-memory server answering `ok: 1`.
fn in_memory() -> TestEstablish {
    in_memory_with(|_| Ok(StreamDescription::new_testing()))
}

fn in_memory_with(
    describe: impl Fn(usize) -> crate::error::Result<StreamDescription> + Send + Sync + 'static,
) -> TestEstablish {
    let attempts = Arc::new(AtomicUsize::new(0));
    Arc::new(move |_address: &ServerAddress| {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        let result = describe(attempt).map(|description| {
            let (stream, server) = duplex();
            serve(server, RequestLog::default(), |_| {
                ServerAction::Reply(doc! { "ok": 1 })
            });
            (stream, description)
        });
        async move { result }.boxed()
    })
}

/// Like `in_memory`, but every connect takes `delay` and the highest number of connects in
/// flight at once is recorded.
fn slow_in_memory(delay: Duration, in_flight: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> TestEstablish {
    Arc::new(move |_address: &ServerAddress| {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            runtime::delay_for(delay).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);

            let (stream, server) = duplex();
            serve(server, RequestLog::default(), |_| {
                ServerAction::Reply(doc! { "ok": 1 })
            });
            Ok((stream, StreamDescription::new_testing()))
        }
        .boxed()
    })
}

fn establisher(establish: TestEstablish, load_balanced: bool) -> ConnectionEstablisher {
    let mut options = EstablisherOptions::builder()
        .load_balanced(load_balanced)
        .build();
    options.test_establish = Some(establish);
    ConnectionEstablisher::new(options).unwrap()
}

fn ready_options(events: &CmapEventBuffer) -> ConnectionPoolOptions {
    let mut options = ConnectionPoolOptions::builder()
        .cmap_event_handler(events.handler())
        .build();
    options.ready = Some(true);
    options
}

fn new_pool(establish: TestEstablish, options: ConnectionPoolOptions) -> ConnectionPool {
    ConnectionPool::new(
        ServerAddress::default(),
        establisher(establish, options.load_balanced.unwrap_or(false)),
        Some(options),
    )
    .unwrap()
}

fn closed_reasons(events: &[CmapEvent]) -> Vec<ConnectionClosedReason> {
    events
        .iter()
        .filter_map(|e| match e {
            CmapEvent::ConnectionClosed(event) => Some(event.reason),
            _ => None,
        })
        .collect()
}

#[test]
fn min_pool_size_above_max_is_rejected() {
    let options = ConnectionPoolOptions::builder()
        .min_pool_size(5)
        .max_pool_size(2)
        .build();
    assert!(options.validate().is_err());

    let options = ConnectionPoolOptions::builder().max_connecting(0).build();
    assert!(options.validate().is_err());

    // Zero means unbounded, so any minimum is fine.
    let options = ConnectionPoolOptions::builder()
        .min_pool_size(5)
        .max_pool_size(0)
        .build();
    assert!(options.validate().is_ok());
}

#[tokio::test]
async fn new_pool_is_paused_until_ready() {
    let events = CmapEventBuffer::default();
    let options = ConnectionPoolOptions::builder()
        .cmap_event_handler(events.handler())
        .build();
    let pool = new_pool(in_memory(), options);

    let error = expect_err(pool.check_out().await);
    assert!(error.is_pool_cleared());

    pool.mark_as_ready().await;
    pool.check_out().await.unwrap();

    let all = events.all();
    assert!(matches!(all[0], CmapEvent::PoolCreated(_)));
    assert!(all.iter().any(|e| matches!(e, CmapEvent::PoolReady(_))));
}

#[tokio::test]
async fn checked_in_connection_is_reused() {
    let events = CmapEventBuffer::default();
    let pool = new_pool(in_memory(), ready_options(&events));

    let conn = pool.check_out().await.unwrap();
    let first_id = conn.id;
    drop(conn);

    events
        .wait_for(1, EVENT_TIMEOUT, |e| {
            matches!(e, CmapEvent::ConnectionCheckedIn(_))
        })
        .await;

    let conn = pool.check_out().await.unwrap();
    assert_eq!(conn.id, first_id);

    let created = events
        .all()
        .into_iter()
        .filter(|e| matches!(e, CmapEvent::ConnectionCreated(_)))
        .count();
    assert_eq!(created, 1);
}

#[tokio::test]
async fn exhausted_pool_times_out_waiters() {
    let events = CmapEventBuffer::default();
    let mut options = ready_options(&events);
    options.max_pool_size = Some(1);
    options.wait_queue_timeout = Some(Duration::from_millis(50));
    let pool = new_pool(in_memory(), options);

    let _held = pool.check_out().await.unwrap();

    let start = Instant::now();
    let error = expect_err(pool.check_out().await);
    let elapsed = start.elapsed();

    assert!(error.is_wait_queue_timeout());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2));

    let failed: Vec<_> = events
        .all()
        .into_iter()
        .filter_map(|e| match e {
            CmapEvent::ConnectionCheckoutFailed(event) => Some(event.reason),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![ConnectionCheckoutFailedReason::Timeout]);
}

#[tokio::test]
async fn pool_never_exceeds_max_size() {
    let events = CmapEventBuffer::default();
    let mut options = ready_options(&events);
    options.max_pool_size = Some(3);
    let pool = new_pool(in_memory(), options);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        tasks.push(runtime::spawn(async move {
            let conn = pool.check_out().await.unwrap();
            runtime::delay_for(Duration::from_millis(10)).await;
            drop(conn);
        }));
    }
    for task in tasks {
        task.await;
    }

    let created = events
        .all()
        .into_iter()
        .filter(|e| matches!(e, CmapEvent::ConnectionCreated(_)))
        .count();
    assert!(created <= 3, "created {created} connections");
}

#[tokio::test]
async fn waiters_are_served_in_order() {
    let events = CmapEventBuffer::default();
    let mut options = ready_options(&events);
    options.max_pool_size = Some(1);
    let pool = new_pool(in_memory(), options);

    let held = pool.check_out().await.unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for i in 0..5 {
        let pool = pool.clone();
        let order = order.clone();
        tasks.push(runtime::spawn(async move {
            let conn = pool.check_out().await.unwrap();
            order.lock().unwrap().push(i);
            drop(conn);
        }));
        // Let each waiter enqueue before the next one.
        events
            .wait_for(i + 2, EVENT_TIMEOUT, |e| {
                matches!(e, CmapEvent::ConnectionCheckoutStarted(_))
            })
            .await;
        runtime::delay_for(Duration::from_millis(5)).await;
    }

    drop(held);
    for task in tasks {
        task.await;
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn max_connecting_limits_concurrent_connects() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let events = CmapEventBuffer::default();
    let options = ready_options(&events);
    let pool = new_pool(
        slow_in_memory(Duration::from_millis(30), in_flight, peak.clone()),
        options,
    );

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let pool = pool.clone();
        tasks.push(runtime::spawn(async move { pool.check_out().await.unwrap() }));
    }
    let mut connections = Vec::new();
    for task in tasks {
        connections.push(task.await);
    }

    assert_eq!(connections.len(), 6);
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "{peak} connects in flight at once");
}

#[tokio::test]
async fn stale_connection_is_closed_on_check_in() {
    let events = CmapEventBuffer::default();
    let pool = new_pool(in_memory(), ready_options(&events));

    let conn = pool.check_out().await.unwrap();
    pool.clear(Error::internal("test clear"), None, false).await;
    assert_eq!(pool.generation(), PoolGeneration::Normal(1));
    drop(conn);

    let closed = events
        .wait_for(1, EVENT_TIMEOUT, |e| matches!(e, CmapEvent::ConnectionClosed(_)))
        .await;
    assert_eq!(closed_reasons(&closed), vec![ConnectionClosedReason::Stale]);
}

#[tokio::test]
async fn clear_then_ready_checks_out_a_new_generation() {
    let events = CmapEventBuffer::default();
    let pool = new_pool(in_memory(), ready_options(&events));

    let a = pool.check_out().await.unwrap();
    let b = pool.check_out().await.unwrap();
    let old_ids = [a.id, b.id];
    drop(a);
    drop(b);
    events
        .wait_for(2, EVENT_TIMEOUT, |e| {
            matches!(e, CmapEvent::ConnectionCheckedIn(_))
        })
        .await;

    pool.clear(Error::internal("test clear"), None, false).await;

    // Paused pools fail checkouts with a retryable pool-cleared error.
    let error = expect_err(pool.check_out().await);
    assert!(error.is_pool_cleared());
    assert!(error.is_network_error());

    pool.mark_as_ready().await;
    let conn = pool.check_out().await.unwrap();

    assert!(!old_ids.contains(&conn.id));
    assert!(!conn.generation.is_stale(&pool.generation()));

    let closed = events
        .wait_for(2, EVENT_TIMEOUT, |e| matches!(e, CmapEvent::ConnectionClosed(_)))
        .await;
    assert_eq!(
        closed_reasons(&closed),
        vec![ConnectionClosedReason::Stale, ConnectionClosedReason::Stale]
    );
}

#[tokio::test]
async fn clear_fails_waiting_checkouts() {
    let events = CmapEventBuffer::default();
    let mut options = ready_options(&events);
    options.max_pool_size = Some(1);
    let pool = new_pool(in_memory(), options);

    let held = pool.check_out().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        runtime::spawn(async move { pool.check_out().await })
    };
    events
        .wait_for(2, EVENT_TIMEOUT, |e| {
            matches!(e, CmapEvent::ConnectionCheckoutStarted(_))
        })
        .await;
    runtime::delay_for(Duration::from_millis(10)).await;

    pool.clear(Error::internal("test clear"), None, false).await;
    let error = expect_err(waiter.await);
    assert!(error.is_pool_cleared());

    let cleared = events
        .all()
        .into_iter()
        .filter(|e| matches!(e, CmapEvent::PoolCleared(_)))
        .count();
    assert_eq!(cleared, 1);
    drop(held);
}

#[tokio::test]
async fn close_fails_waiters_and_later_checkouts() {
    let events = CmapEventBuffer::default();
    let mut options = ready_options(&events);
    options.max_pool_size = Some(1);
    let pool = new_pool(in_memory(), options);

    let held = pool.check_out().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        runtime::spawn(async move { pool.check_out().await })
    };
    events
        .wait_for(2, EVENT_TIMEOUT, |e| {
            matches!(e, CmapEvent::ConnectionCheckoutStarted(_))
        })
        .await;
    runtime::delay_for(Duration::from_millis(10)).await;

    pool.close().await;

    assert!(expect_err(waiter.await).is_pool_closed());
    assert!(expect_err(pool.check_out().await).is_pool_closed());

    drop(held);
    let closed = events
        .wait_for(1, EVENT_TIMEOUT, |e| matches!(e, CmapEvent::ConnectionClosed(_)))
        .await;
    assert_eq!(
        closed_reasons(&closed),
        vec![ConnectionClosedReason::PoolClosed]
    );

    let all = events.all();
    assert_eq!(
        all.iter()
            .filter(|e| matches!(e, CmapEvent::PoolClosed(_)))
            .count(),
        1
    );
    assert!(all.iter().any(|e| matches!(
        e,
        CmapEvent::ConnectionCheckoutFailed(event)
            if event.reason == ConnectionCheckoutFailedReason::PoolClosed
    )));
}

#[tokio::test]
async fn establishment_failure_is_reported_and_frees_capacity() {
    let events = CmapEventBuffer::default();
    let mut options = ready_options(&events);
    options.max_pool_size = Some(1);
    let establish = in_memory_with(|attempt| {
        if attempt == 0 {
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into())
        } else {
            Ok(StreamDescription::new_testing())
        }
    });
    let pool = new_pool(establish, options);

    let error = expect_err(pool.check_out().await);
    assert!(error.is_network_error());

    // The failed connect no longer counts against max_pool_size.
    pool.check_out().await.unwrap();

    let all = events.all();
    assert!(all.iter().any(|e| matches!(
        e,
        CmapEvent::ConnectionClosed(event) if event.reason == ConnectionClosedReason::Error
    )));
    assert!(all.iter().any(|e| matches!(
        e,
        CmapEvent::ConnectionCheckoutFailed(event)
            if event.reason == ConnectionCheckoutFailedReason::ConnectionError
    )));
}

#[tokio::test]
async fn close_cancels_a_stalled_connect() {
    let events = CmapEventBuffer::default();
    let pool = new_pool(
        Arc::new(|_address: &ServerAddress| futures_util::future::pending().boxed()),
        ready_options(&events),
    );

    let waiter = {
        let pool = pool.clone();
        runtime::spawn(async move { pool.check_out().await })
    };
    events
        .wait_for(1, EVENT_TIMEOUT, |e| {
            matches!(e, CmapEvent::ConnectionCreated(_))
        })
        .await;

    pool.close().await;

    let result = runtime::timeout(EVENT_TIMEOUT, waiter).await.unwrap();
    assert!(expect_err(result).is_pool_closed());
}

#[tokio::test]
async fn min_pool_size_is_maintained_in_background() {
    let events = CmapEventBuffer::default();
    let mut options = ready_options(&events);
    options.min_pool_size = Some(3);
    options.maintenance_frequency = Some(Duration::from_millis(10));
    let _pool = new_pool(in_memory(), options);

    let ready = events
        .wait_for(3, EVENT_TIMEOUT, |e| matches!(e, CmapEvent::ConnectionReady(_)))
        .await;
    assert_eq!(ready.len(), 3);
}

#[tokio::test]
async fn min_pool_size_is_approached_one_connection_per_tick() {
    let events = CmapEventBuffer::default();
    let mut options = ready_options(&events);
    options.min_pool_size = Some(3);
    options.maintenance_frequency = Some(Duration::from_millis(200));
    let start = Instant::now();
    let _pool = new_pool(in_memory(), options);

    events
        .wait_for(1, EVENT_TIMEOUT, |e| matches!(e, CmapEvent::ConnectionReady(_)))
        .await;
    runtime::delay_for(Duration::from_millis(50)).await;
    let created = |events: &CmapEventBuffer| {
        events
            .all()
            .into_iter()
            .filter(|e| matches!(e, CmapEvent::ConnectionCreated(_)))
            .count()
    };
    assert_eq!(created(&events), 1);

    let ready = events
        .wait_for(3, EVENT_TIMEOUT, |e| matches!(e, CmapEvent::ConnectionReady(_)))
        .await;
    assert_eq!(ready.len(), 3);
    assert!(start.elapsed() >= Duration::from_millis(400));
    assert_eq!(created(&events), 3);
}

#[tokio::test]
async fn idle_connections_are_pruned() {
    let events = CmapEventBuffer::default();
    let mut options = ready_options(&events);
    options.max_idle_time = Some(Duration::from_millis(20));
    options.maintenance_frequency = Some(Duration::from_millis(10));
    let pool = new_pool(in_memory(), options);

    drop(pool.check_out().await.unwrap());

    let closed = events
        .wait_for(1, EVENT_TIMEOUT, |e| matches!(e, CmapEvent::ConnectionClosed(_)))
        .await;
    assert_eq!(closed_reasons(&closed), vec![ConnectionClosedReason::Idle]);
}

#[tokio::test]
async fn load_balanced_clear_only_affects_one_service() {
    let first = ObjectId::new();
    let second = ObjectId::new();
    let establish = in_memory_with(move |attempt| {
        let mut description = StreamDescription::new_testing();
        description.service_id = Some(if attempt == 0 { first } else { second });
        Ok(description)
    });
    let events = CmapEventBuffer::default();
    let mut options = ready_options(&events);
    options.load_balanced = Some(true);
    let pool = new_pool(establish, options);

    let a = pool.check_out().await.unwrap();
    let b = pool.check_out().await.unwrap();
    assert_eq!(a.generation.service_id(), Some(first));
    assert_eq!(b.generation.service_id(), Some(second));

    pool.clear(Error::internal("test clear"), Some(first), false).await;
    assert!(a.generation.is_stale(&pool.generation()));
    assert!(!b.generation.is_stale(&pool.generation()));

    // The pool is not paused.
    drop(b);
    events
        .wait_for(1, EVENT_TIMEOUT, |e| {
            matches!(e, CmapEvent::ConnectionCheckedIn(_))
        })
        .await;
    let reused = pool.check_out().await.unwrap();
    assert_eq!(reused.generation.service_id(), Some(second));

    let cleared: Vec<_> = events
        .all()
        .into_iter()
        .filter_map(|e| match e {
            CmapEvent::PoolCleared(event) => Some(event.service_id),
            _ => None,
        })
        .collect();
    assert_eq!(cleared, vec![Some(first)]);
    drop(a);
}

#[tokio::test]
async fn load_balanced_generation_outlives_last_connection() {
    let service = ObjectId::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    // The second connect stalls so that it is still pending when the service is cleared.
    let establish: TestEstablish = Arc::new(move |_address: &ServerAddress| {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 1 {
                runtime::delay_for(Duration::from_millis(200)).await;
            }
            let (stream, server) = duplex();
            serve(server, RequestLog::default(), |_| {
                ServerAction::Reply(doc! { "ok": 1 })
            });
            let mut description = StreamDescription::new_testing();
            description.service_id = Some(service);
            Ok((stream, description))
        }
        .boxed()
    });
    let events = CmapEventBuffer::default();
    let mut options = ready_options(&events);
    options.load_balanced = Some(true);
    let pool = new_pool(establish, options);

    let first = pool.check_out().await.unwrap();
    let pending = {
        let pool = pool.clone();
        runtime::spawn(async move { pool.check_out().await.unwrap() })
    };
    events
        .wait_for(2, EVENT_TIMEOUT, |e| {
            matches!(e, CmapEvent::ConnectionCreated(_))
        })
        .await;

    pool.clear(Error::internal("test clear"), Some(service), false).await;
    drop(first);
    events
        .wait_for(1, EVENT_TIMEOUT, |e| {
            matches!(e, CmapEvent::ConnectionClosed(_))
        })
        .await;

    // The service has no connections left but keeps its generation.
    let current = PoolGeneration::LoadBalanced(HashMap::from([(service, 1)]));
    assert_eq!(pool.generation(), current);

    let second = pending.await;
    assert_eq!(second.generation.service_id(), Some(service));
    assert!(second.generation.is_stale(&pool.generation()));

    drop(second);
    events
        .wait_for(2, EVENT_TIMEOUT, |e| {
            matches!(e, CmapEvent::ConnectionClosed(_))
        })
        .await;
    assert_eq!(
        closed_reasons(&events.all()),
        vec![ConnectionClosedReason::Stale, ConnectionClosedReason::Stale]
    );

    let fresh = pool.check_out().await.unwrap();
    assert!(!fresh.generation.is_stale(&pool.generation()));
}

#[tokio::test]
async fn interrupting_clear_fails_in_use_connections() {
    let events = CmapEventBuffer::default();
    let pool = new_pool(
        Arc::new(|_address: &ServerAddress| {
            let (stream, mut server) = duplex();
            // Read requests but never answer them.
            runtime::execute(async move { while server.receive().await.is_some() {} });
            async move { Ok((stream, StreamDescription::new_testing())) }.boxed()
        }),
        ready_options(&events),
    );

    let mut conn = pool.check_out().await.unwrap();
    pool.clear(Error::internal("test clear"), None, true).await;

    let error = expect_err(
        conn.send_command(
            super::Command::new("ping", "admin", crate::bson::rawdoc! { "ping": 1 }),
            None,
        )
        .await,
    );
    assert!(error.is_network_error());
    assert!(conn.is_closed());

    let cleared = events
        .all()
        .into_iter()
        .find_map(|e| match e {
            CmapEvent::PoolCleared(event) => Some(event.interrupt_in_use_connections),
            _ => None,
        });
    assert_eq!(cleared, Some(true));
}
