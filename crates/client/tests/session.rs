mod common;

use common::{Add, WAIT, router, serve, start};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether_client::{
    ClientError, Network, ReadyState, RequestStatusCallback, Response, Session, SessionConfig,
};
use tether_packet::PluginChain;
use tether_packet::plugin::Crypt;
use tether_server::{Server, ServerConfig};
use tokio::sync::mpsc;
use tokio::time::timeout;

const KEY: [u8; 32] = [7; 32];

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl RequestStatusCallback for Recorder {
    fn on_start(&self) {
        self.0.lock().push("start".into());
    }

    fn on_success(&self, response: &Response) {
        let body: String = serde_json::from_slice(&response.body).unwrap();
        self.0.lock().push(format!("success:{body}"));
    }

    fn on_error(&self, code: i32, message: &str) {
        self.0.lock().push(format!("error:{code}:{message}"));
    }

    fn on_end(&self) {
        self.0.lock().push("end".into());
    }
}

#[derive(Default)]
struct Decoded {
    values: Mutex<Vec<Value>>,
    errors: Mutex<Vec<(i32, String)>>,
}

impl RequestStatusCallback for Decoded {
    fn on_success(&self, response: &Response) {
        self.values
            .lock()
            .push(serde_json::from_slice(&response.body).unwrap());
    }

    fn on_error(&self, code: i32, message: &str) {
        self.errors.lock().push((code, message.to_string()));
    }
}

struct Forward(mpsc::UnboundedSender<Response>);

impl RequestStatusCallback for Forward {
    fn on_success(&self, response: &Response) {
        let _ = self.0.send(response.clone());
    }
}

async fn greet(network: Network, address: String) {
    let session = Session::connect(network, &address, SessionConfig::default())
        .await
        .unwrap();
    assert_eq!(session.ready_state(), ReadyState::Open);

    let greeting: String = session.call("/v1/healthy", "tether", WAIT).await.unwrap();
    assert_eq!(greeting, "tether");
    session.close();
}

#[tokio::test]
async fn test_call_over_every_network() {
    let endpoints = serve(ServerConfig::default()).await;

    greet(Network::Tcp, endpoints.tcp.to_string()).await;
    greet(Network::Udp, endpoints.udp.to_string()).await;
    greet(
        Network::WebSocket {
            path: "/ws".to_string(),
        },
        endpoints.websocket.to_string(),
    )
    .await;

    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let endpoints = serve(ServerConfig::default()).await;
    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), SessionConfig::default())
        .await
        .unwrap();

    let calls = (0..50).map(|i| {
        let session = session.clone();
        tokio::spawn(async move {
            let sum: i64 = session.call("/v1/add", &Add { a: i, b: 1000 }, WAIT).await.unwrap();
            (i, sum)
        })
    });
    for call in calls.collect::<Vec<_>>() {
        let (i, sum) = call.await.unwrap();
        assert_eq!(sum, i + 1000);
    }
    assert_eq!(session.pending_count(), 0);

    session.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_remote_error_leaves_session_usable() {
    let endpoints = serve(ServerConfig::default()).await;
    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), SessionConfig::default())
        .await
        .unwrap();

    let err = session.call::<_, ()>("/v1/fail", &(), WAIT).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Remote { code: 500, ref message } if message == "boom"
    ));

    let err = session.call::<_, i64>("/v1/add", "not an object", WAIT).await.unwrap_err();
    assert!(matches!(err, ClientError::Remote { code: 400, .. }));

    let sum: i64 = session.call("/v1/add", &Add { a: 2, b: 3 }, WAIT).await.unwrap();
    assert_eq!(sum, 5);

    session.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_sync_send_reports_through_callback() {
    let endpoints = serve(ServerConfig::default()).await;
    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), SessionConfig::default())
        .await
        .unwrap();

    let recorder = Recorder::default();
    session.sync_send("/v1/healthy", "bob", WAIT, &recorder).await.unwrap();
    session.sync_send("/v1/fail", &(), WAIT, &recorder).await.unwrap();

    assert_eq!(
        *recorder.0.lock(),
        vec![
            "start",
            "success:bob",
            "end",
            "start",
            "error:500:boom",
            "end"
        ]
    );

    session.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_success_callback_decodes_json_body() {
    let endpoints = serve(ServerConfig::default()).await;
    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), SessionConfig::default())
        .await
        .unwrap();

    let decoded = Decoded::default();
    session
        .sync_send("/v1/healthy", &json!({"ping": true}), WAIT, &decoded)
        .await
        .unwrap();

    assert_eq!(*decoded.values.lock(), vec![json!({"ping": true})]);
    assert!(decoded.errors.lock().is_empty());

    session.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_handler_panic_leaves_session_usable() {
    let endpoints = serve(ServerConfig::default()).await;
    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), SessionConfig::default())
        .await
        .unwrap();

    let err = session.call::<_, ()>("/v1/panic", &(), WAIT).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Remote { code: 500, ref message } if message.contains("handler blew up")
    ));

    assert!(session.is_open());
    let sum: i64 = session.call("/v1/add", &Add { a: 20, b: 22 }, WAIT).await.unwrap();
    assert_eq!(sum, 42);

    session.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_dropped_session_closes_connection() {
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let server = Server::builder(router())
        .on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let endpoints = start(server).await;

    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), SessionConfig::default())
        .await
        .unwrap();
    let _heartbeat = session.start_ping(Duration::from_millis(50), tether_client::Bytes::new());
    session.ping("", WAIT).await.unwrap();
    drop(session);

    timeout(WAIT, async {
        while closes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_sync_send_times_out_and_clears_entry() {
    let endpoints = serve(ServerConfig::default()).await;
    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), SessionConfig::default())
        .await
        .unwrap();

    let recorder = Recorder::default();
    let err = session
        .sync_send("/v1/sleep", &(), Duration::from_millis(100), &recorder)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));
    assert_eq!(session.pending_count(), 0);
    assert_eq!(*recorder.0.lock(), vec!["start", "end"]);

    // The late response is dropped and the session keeps working.
    tokio::time::sleep(Duration::from_millis(2100)).await;
    session.ping("", WAIT).await.unwrap();

    session.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_async_send() {
    let endpoints = serve(ServerConfig::default()).await;
    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), SessionConfig::default())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .async_send("/v1/healthy", "async", Forward(tx))
        .await
        .unwrap();

    let response = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let body: String = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body, "async");

    session.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_heartbeat_without_ping_handler() {
    let endpoints = serve(ServerConfig::default()).await;
    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), SessionConfig::default())
        .await
        .unwrap();

    session.ping("", WAIT).await.unwrap();

    let handle = session.start_ping(Duration::from_millis(50), tether_client::Bytes::new());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(session.is_open());

    session.close();
    timeout(WAIT, handle).await.unwrap().unwrap();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_message_listener_receives_published_messages() {
    let endpoints = serve(ServerConfig::default()).await;
    let address = endpoints.tcp.to_string();
    let listener = Session::connect(Network::Tcp, &address, SessionConfig::default())
        .await
        .unwrap();
    let publisher = Session::connect(Network::Tcp, &address, SessionConfig::default())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    listener
        .add_message_listener("topic", WAIT, move |response: Response| {
            let _ = tx.send(response.body);
        })
        .await
        .unwrap();

    publisher
        .call::<_, ()>("/v1/broadcast", "first", WAIT)
        .await
        .unwrap();
    let message = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(serde_json::from_slice::<String>(&message).unwrap(), "first");

    listener.remove_message_listener("topic", WAIT).await.unwrap();
    publisher
        .call::<_, ()>("/v1/broadcast", "second", WAIT)
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    listener.close();
    publisher.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_request_properties_reach_handler() {
    let endpoints = serve(ServerConfig::default()).await;
    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), SessionConfig::default())
        .await
        .unwrap();

    session.set_request_property("user", "alice");
    assert_eq!(session.request_property("user").as_deref(), Some("alice"));
    let user: String = session.call("/v1/whoami", &(), WAIT).await.unwrap();
    assert_eq!(user, "alice");

    session.remove_request_property("user");
    let user: String = session.call("/v1/whoami", &(), WAIT).await.unwrap();
    assert_eq!(user, "");

    session.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_close_fails_waiting_requests() {
    let endpoints = serve(ServerConfig::default()).await;
    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), SessionConfig::default())
        .await
        .unwrap();

    let waiting = {
        let session = session.clone();
        tokio::spawn(async move { session.call::<_, String>("/v1/sleep", &(), WAIT).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.close();

    let err = timeout(WAIT, waiting).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(
        err,
        ClientError::Remote { code: 503, .. } | ClientError::Closed
    ));

    timeout(WAIT, session.closed()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.ready_state(), ReadyState::Closed);
    assert!(matches!(
        session.ping("", WAIT).await,
        Err(ClientError::Closed)
    ));

    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_cbor_content_type() {
    let endpoints = serve(ServerConfig::default()).await;
    let config = SessionConfig::default().with_content_type("application/cbor");
    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), config)
        .await
        .unwrap();
    assert_eq!(session.content_type(), "application/cbor");

    let sum: i64 = session.call("/v1/add", &Add { a: 40, b: 2 }, WAIT).await.unwrap();
    assert_eq!(sum, 42);

    session.close();
    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_crypt_plugin_on_both_ends() {
    let plugins = PluginChain::new().with(Crypt::new(&KEY).unwrap());
    let endpoints = serve(ServerConfig::default().with_plugins(plugins.clone())).await;
    let address = endpoints.tcp.to_string();

    let session = Session::connect(
        Network::Tcp,
        &address,
        SessionConfig::default().with_plugins(plugins),
    )
    .await
    .unwrap();
    let sum: i64 = session.call("/v1/add", &Add { a: 1, b: 1 }, WAIT).await.unwrap();
    assert_eq!(sum, 2);
    session.close();

    // A peer with the wrong key is cut off.
    let wrong = PluginChain::new().with(Crypt::new(&[9; 32]).unwrap());
    let session = Session::connect(
        Network::Tcp,
        &address,
        SessionConfig::default().with_plugins(wrong),
    )
    .await
    .unwrap();
    assert!(session.call::<_, i64>("/v1/add", &Add { a: 1, b: 1 }, WAIT).await.is_err());

    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_session_hooks() {
    let endpoints = serve(ServerConfig::default()).await;
    let events = Arc::new(Mutex::new(Vec::new()));

    let opened = Arc::clone(&events);
    let closed = Arc::clone(&events);
    let config = SessionConfig::default()
        .on_open(move |_| opened.lock().push("open"))
        .on_close(move |_| closed.lock().push("close"));

    let session = Session::connect(Network::Tcp, &endpoints.tcp.to_string(), config)
        .await
        .unwrap();
    session.close();
    timeout(WAIT, async {
        while events.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*events.lock(), vec!["open", "close"]);

    endpoints.server.shutdown();
}

#[tokio::test]
async fn test_connect_failure() {
    let address = common::dead_address().await;
    let err = Session::connect(Network::Tcp, &address, SessionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Connect { .. }));
}
