mod common;

use common::{Add, WAIT, dead_address, router, serve, silent_address, start};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether_client::{Network, Pool, PoolConfig, PoolError};
use tether_server::{Server, ServerConfig};
use tokio::time::{Instant, timeout};

fn quiet() -> PoolConfig {
    PoolConfig::default()
        .with_ping_interval(Duration::ZERO)
        .with_dial_timeout(Duration::from_millis(500))
}

#[tokio::test]
async fn test_checkout_and_return() {
    let endpoints = serve(ServerConfig::default()).await;
    let pool = Pool::connect(
        [endpoints.tcp.to_string()],
        quiet().with_initial_cap(2).with_max_cap(4),
    )
    .await
    .unwrap();
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.idle_len(), 2);

    {
        let session = pool.session().await.unwrap();
        assert_eq!(pool.idle_len(), 1);
        let sum: i64 = session.call("/v1/add", &Add { a: 3, b: 4 }, WAIT).await.unwrap();
        assert_eq!(sum, 7);
    }
    assert_eq!(pool.idle_len(), 2);
    assert_eq!(pool.len(), 2);

    pool.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_dials_past_dead_address() {
    let endpoints = serve(ServerConfig::default()).await;
    let dead = dead_address().await;
    let good = endpoints.tcp.to_string();

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    let config = quiet()
        .with_initial_cap(2)
        .on_error(move |err| {
            assert!(matches!(err, PoolError::Session(_)));
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let pool = Pool::connect([dead, good.clone()], config).await.unwrap();
    assert_eq!(pool.len(), 2);
    assert!(failures.load(Ordering::SeqCst) >= 1);

    let session = pool.session().await.unwrap();
    assert_eq!(session.address(), good);
    session.ping("", WAIT).await.unwrap();

    drop(session);
    pool.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_dial_timeout_bounds_stalled_handshake() {
    let endpoints = serve(ServerConfig::default()).await;
    let (silent, listener) = silent_address().await;
    let good = endpoints.websocket.to_string();

    let config = quiet()
        .with_network(Network::WebSocket {
            path: "/ws".to_string(),
        })
        .with_dial_timeout(Duration::from_millis(300))
        .with_initial_cap(1);

    let started = Instant::now();
    let pool = Pool::connect([silent, good.clone()], config).await.unwrap();
    let session = pool.session().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "took {:?}",
        started.elapsed()
    );
    assert_eq!(session.address(), good);

    drop(session);
    pool.close();
    listener.abort();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_dropped_pool_closes_its_sessions() {
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let server = Server::builder(router())
        .on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let endpoints = start(server).await;

    let pool = Pool::connect([endpoints.tcp.to_string()], quiet().with_initial_cap(3))
        .await
        .unwrap();
    assert_eq!(pool.idle_len(), 3);
    drop(pool);

    timeout(WAIT, async {
        while closes.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_every_address_dead() {
    let dead = dead_address().await;
    let err = Pool::connect([dead], quiet().with_initial_cap(1))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Session(_)));
}

#[tokio::test]
async fn test_empty_addresses() {
    let err = Pool::connect(Vec::<String>::new(), quiet()).await.unwrap_err();
    assert!(matches!(err, PoolError::NoAddress(_)));
}

#[tokio::test]
async fn test_exhausted_then_returned() {
    let endpoints = serve(ServerConfig::default()).await;
    let pool = Pool::connect(
        [endpoints.tcp.to_string()],
        quiet().with_initial_cap(1).with_max_cap(1),
    )
    .await
    .unwrap();

    let held = pool.session().await.unwrap();
    let err = pool.session().await.unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { live: 1, max: 1 }));

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.session().await.map(|session| session.address().to_string()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);

    let address = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap();
    assert_eq!(address, endpoints.tcp.to_string());
    assert_eq!(pool.len(), 1);

    pool.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_closed_session_is_replaced() {
    let endpoints = serve(ServerConfig::default()).await;
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let pool = Pool::connect(
        [endpoints.tcp.to_string()],
        quiet()
            .with_initial_cap(1)
            .with_max_cap(1)
            .on_close(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .await
    .unwrap();

    let session = pool.session().await.unwrap();
    session.close();
    drop(session);
    assert_eq!(pool.len(), 0);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    let session = pool.session().await.unwrap();
    assert!(session.is_open());
    let sum: i64 = session.call("/v1/add", &Add { a: 1, b: 2 }, WAIT).await.unwrap();
    assert_eq!(sum, 3);

    session.discard();
    assert!(pool.is_empty());

    pool.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_maintenance_evicts_expired_sessions() {
    let endpoints = serve(ServerConfig::default()).await;
    let opens = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let opened = Arc::clone(&opens);
    let closed = Arc::clone(&closes);

    let pool = Pool::connect(
        [endpoints.tcp.to_string()],
        PoolConfig::default()
            .with_initial_cap(2)
            .with_idle_timeout(Some(Duration::from_millis(50)))
            .with_ping_interval(Duration::from_millis(100))
            .on_open(move |_| {
                opened.fetch_add(1, Ordering::SeqCst);
            })
            .on_close(move |_| {
                closed.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .await
    .unwrap();

    timeout(WAIT, async {
        while closes.load(Ordering::SeqCst) < 2 || opens.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    pool.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_closed_pool_refuses_checkout() {
    let endpoints = serve(ServerConfig::default()).await;
    let pool = Pool::connect([endpoints.tcp.to_string()], quiet().with_initial_cap(2))
        .await
        .unwrap();

    pool.close();
    assert!(pool.is_empty());
    assert!(matches!(pool.session().await, Err(PoolError::Closed)));

    endpoints.server.shutdown();
}
