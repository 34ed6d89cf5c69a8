//! End-to-end tests using real WebSocket clients.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use vernite_gateway::handlers::{self, Communicator, HandlerDeps};
use vernite_gateway::{
    ConnectionRegistry, ConnectionSession, GatewayConfig, GatewayServer, HandlerRegistry,
    MemorySessionStore, SessionRecord, SessionStore, User,
};
use vernite_proto::packets::{BasicAction, ChatMessage, KeepAlive, SendMessage, Task};
use vernite_proto::{codec, VerniteError, VerniteResult};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestGateway {
    url: String,
    connections: Arc<ConnectionRegistry>,
    shutdown: broadcast::Sender<()>,
    accept_loop: JoinHandle<()>,
}

fn test_config(heartbeat: Duration) -> GatewayConfig {
    GatewayConfig {
        host: IpAddr::from([127, 0, 0, 1]),
        port: 0,
        heartbeat_interval: heartbeat,
        ..GatewayConfig::default()
    }
}

async fn boot(store: Arc<dyn SessionStore>, handlers: HandlerRegistry, heartbeat: Duration) -> TestGateway {
    let server = GatewayServer::new(test_config(heartbeat), store, handlers);
    let connections = server.connections();
    let shutdown = server.shutdown_handle();
    let (addr, accept_loop) = server.start().await.unwrap();
    TestGateway {
        url: format!("ws://{addr}/ws"),
        connections,
        shutdown,
        accept_loop,
    }
}

async fn boot_default(store: Arc<dyn SessionStore>) -> TestGateway {
    boot(store, HandlerRegistry::empty(), Duration::from_secs(60)).await
}

async fn connect(url: &str, headers: &[(&'static str, &str)]) -> WsStream {
    let mut request = url.into_client_request().unwrap();
    for (name, value) in headers {
        request
            .headers_mut()
            .append(*name, HeaderValue::from_str(value).unwrap());
    }
    let (ws, _) = timeout(TIMEOUT, connect_async(request))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn wait_for_sessions(connections: &ConnectionRegistry, n: usize) -> Vec<Arc<ConnectionSession>> {
    timeout(TIMEOUT, async {
        loop {
            let sessions = connections.snapshot().await;
            if sessions.len() == n {
                return sessions;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry never reached expected size")
}

/// Next text frame, skipping heartbeats and other binary frames.
async fn next_text(ws: &mut WsStream) -> String {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended while waiting for text: {other:?}"),
            }
        }
    })
    .await
    .expect("no text frame")
}

/// Next binary frame carrying a `P`.
async fn next_packet<P: vernite_proto::Packet>(ws: &mut WsStream) -> P {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let envelope = codec::decode(&data).unwrap();
                    if envelope.is::<P>() {
                        return envelope.unpack::<P>().unwrap();
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("connection ended while waiting for {}: {other:?}", P::TYPE_NAME),
            }
        }
    })
    .await
    .expect("no matching packet")
}

/// Wait for the server's close frame and return its code.
async fn close_code(ws: &mut WsStream) -> Option<CloseCode> {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| f.code),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .expect("connection never closed")
}

fn user(id: u64, name: &str, deleted: bool) -> User {
    User {
        id,
        username: name.into(),
        deleted,
    }
}

fn store_with(token: &str, user: User) -> Arc<MemorySessionStore> {
    Arc::new(MemorySessionStore::from_records([SessionRecord {
        token: token.into(),
        user,
        ip: None,
        last_used: SystemTime::UNIX_EPOCH,
    }]))
}

#[tokio::test]
async fn anonymous_connection_is_admitted_and_pinged() {
    let gw = boot(
        Arc::new(MemorySessionStore::new()),
        HandlerRegistry::empty(),
        Duration::from_millis(50),
    )
    .await;
    let mut ws = connect(&gw.url, &[]).await;

    let sessions = wait_for_sessions(&gw.connections, 1).await;
    assert!(sessions[0].user().is_none());

    let ping: KeepAlive = next_packet(&mut ws).await;
    assert!(ping.id > 0);

    // Echo it back; the server only logs latency and keeps the connection.
    let pong = codec::encode(&ping).unwrap();
    ws.send(Message::Binary(pong.into())).await.unwrap();
    let _: KeepAlive = next_packet(&mut ws).await;
    assert_eq!(gw.connections.len().await, 1);
}

#[tokio::test]
async fn session_cookie_attaches_user_and_records_forwarded_ip() {
    let store = store_with("tok-1", user(1, "alice", false));
    let gw = boot_default(store.clone()).await;

    let _ws = connect(
        &gw.url,
        &[
            ("cookie", "theme=dark; session=tok-1"),
            ("x-forwarded-for", "203.0.113.9, 10.0.0.1"),
        ],
    )
    .await;

    let sessions = wait_for_sessions(&gw.connections, 1).await;
    assert_eq!(sessions[0].user().map(|u| u.id), Some(1));
    assert_eq!(sessions[0].remote_address(), "203.0.113.9");

    let record = store.get("tok-1").await.unwrap();
    assert_eq!(record.ip.as_deref(), Some("203.0.113.9"));
    assert!(record.last_used > SystemTime::UNIX_EPOCH);
}

#[tokio::test]
async fn deleted_user_connects_anonymously() {
    let gw = boot_default(store_with("tok-d", user(3, "gone", true))).await;
    let _ws = connect(&gw.url, &[("cookie", "session=tok-d")]).await;

    let sessions = wait_for_sessions(&gw.connections, 1).await;
    assert!(sessions[0].user().is_none());
}

#[tokio::test]
async fn text_frames_reach_everyone_but_the_sender() {
    let gw = boot_default(Arc::new(MemorySessionStore::new())).await;
    let mut a = connect(&gw.url, &[]).await;
    let mut b = connect(&gw.url, &[]).await;
    let mut c = connect(&gw.url, &[]).await;
    wait_for_sessions(&gw.connections, 3).await;

    a.send(Message::Text("hello".into())).await.unwrap();

    assert_eq!(next_text(&mut b).await, "hello");
    assert_eq!(next_text(&mut c).await, "hello");

    // The sender gets nothing back: the next text it sees is c's.
    c.send(Message::Text("from c".into())).await.unwrap();
    assert_eq!(next_text(&mut a).await, "from c");
}

#[tokio::test]
async fn wrong_path_and_foreign_origin_are_refused() {
    let gw = boot_default(Arc::new(MemorySessionStore::new())).await;
    let base = gw.url.trim_end_matches("/ws").to_string();

    match connect_async(format!("{base}/socket")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 404),
        other => panic!("expected 404, got {:?}", other.map(|_| ())),
    }

    let mut request = gw.url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://evil.test"));
    match connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 403),
        other => panic!("expected 403, got {:?}", other.map(|_| ())),
    }

    let _ok = connect(&gw.url, &[("origin", "https://vernite.dev")]).await;
    wait_for_sessions(&gw.connections, 1).await;
}

#[tokio::test]
async fn unroutable_packet_keeps_connection_open() {
    let gw = boot_default(Arc::new(MemorySessionStore::new())).await;
    let mut ws = connect(&gw.url, &[]).await;
    wait_for_sessions(&gw.connections, 1).await;

    let task = Task {
        id: 1,
        project_id: 2,
        status_id: 3,
        name: "Write docs".into(),
        description: String::new(),
        created_at: 1_700_000_000_000,
        task_type: 0,
        priority: "medium".into(),
        created_by: 1,
        action: BasicAction::Added,
    };
    ws.send(Message::Binary(codec::encode(&task).unwrap().into()))
        .await
        .unwrap();

    // Still reachable afterwards.
    sleep(Duration::from_millis(50)).await;
    let delivered = gw.connections.broadcast(&task).await;
    assert_eq!(delivered, 1);
    let received: Task = next_packet(&mut ws).await;
    assert_eq!(received, task);
}

#[tokio::test]
async fn undecodable_frame_closes_with_server_error() {
    let gw = boot_default(Arc::new(MemorySessionStore::new())).await;
    let mut victim = connect(&gw.url, &[]).await;
    let mut bystander = connect(&gw.url, &[]).await;
    wait_for_sessions(&gw.connections, 2).await;

    victim
        .send(Message::Binary(vec![0xff, 0xff].into()))
        .await
        .unwrap();
    assert_eq!(close_code(&mut victim).await, Some(CloseCode::Error));

    wait_for_sessions(&gw.connections, 1).await;
    assert_eq!(gw.connections.broadcast(&KeepAlive { id: 7 }).await, 1);
    let ping: KeepAlive = next_packet(&mut bystander).await;
    assert_eq!(ping.id, 7);
}

#[tokio::test]
async fn oversized_frame_ends_connection() {
    let gw = boot_default(Arc::new(MemorySessionStore::new())).await;
    let mut ws = connect(&gw.url, &[]).await;
    wait_for_sessions(&gw.connections, 1).await;

    // The server stops reading at the oversized header, so the write itself
    // may fail once the socket is gone.
    let big = vec![0u8; GatewayConfig::default().max_frame_size + 1];
    let _ = ws.send(Message::Binary(big.into())).await;

    let code = close_code(&mut ws).await;
    assert!(matches!(code, Some(CloseCode::Size) | None), "unexpected close {code:?}");
    wait_for_sessions(&gw.connections, 0).await;
}

#[tokio::test]
async fn oversized_text_is_refused_and_never_relayed() {
    let gw = boot_default(Arc::new(MemorySessionStore::new())).await;
    let mut sender = connect(&gw.url, &[]).await;
    let mut reader = connect(&gw.url, &[]).await;
    wait_for_sessions(&gw.connections, 2).await;

    let big = "x".repeat(GatewayConfig::default().max_frame_size * 4);
    let _ = sender.send(Message::Text(big.into())).await;

    let code = close_code(&mut sender).await;
    assert!(matches!(code, Some(CloseCode::Size) | None), "unexpected close {code:?}");
    wait_for_sessions(&gw.connections, 1).await;

    // Anything relayed from the sender would arrive before this.
    assert_eq!(gw.connections.broadcast_text_except(0, "marker").await, 1);
    assert_eq!(next_text(&mut reader).await, "marker");
}

struct UnavailableStore;

impl SessionStore for UnavailableStore {
    fn lookup<'a>(&'a self, _token: &'a str) -> BoxFuture<'a, VerniteResult<Option<SessionRecord>>> {
        Box::pin(async { Err(VerniteError::Store("database unavailable".into())) })
    }

    fn save<'a>(&'a self, _record: &'a SessionRecord) -> BoxFuture<'a, VerniteResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Store whose lookups wait until the test releases them.
#[derive(Default)]
struct GatedStore {
    entered: Notify,
    release: Notify,
}

impl SessionStore for GatedStore {
    fn lookup<'a>(&'a self, _token: &'a str) -> BoxFuture<'a, VerniteResult<Option<SessionRecord>>> {
        Box::pin(async move {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(None)
        })
    }

    fn save<'a>(&'a self, _record: &'a SessionRecord) -> BoxFuture<'a, VerniteResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test]
async fn connection_authenticating_during_shutdown_is_not_admitted() {
    let store = Arc::new(GatedStore::default());
    let gw = boot_default(store.clone()).await;

    let mut ws = connect(&gw.url, &[("cookie", "session=slow")]).await;
    timeout(TIMEOUT, store.entered.notified())
        .await
        .expect("authentication never started");

    gw.shutdown.send(()).unwrap();
    timeout(TIMEOUT, gw.accept_loop).await.unwrap().unwrap();
    store.release.notify_one();

    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("late connection was never closed");
    sleep(Duration::from_millis(50)).await;
    assert!(gw.connections.is_empty().await);
}

#[tokio::test]
async fn store_failure_rejects_only_that_connection() {
    let gw = boot_default(Arc::new(UnavailableStore)).await;

    let mut with_cookie = connect(&gw.url, &[("cookie", "session=abc")]).await;
    assert_eq!(close_code(&mut with_cookie).await, Some(CloseCode::Error));

    // No cookie means no lookup, so the store is never consulted.
    let _anon = connect(&gw.url, &[]).await;
    let sessions = wait_for_sessions(&gw.connections, 1).await;
    assert!(sessions[0].user().is_none());
}

#[derive(Default)]
struct RecordingCommunicator {
    posted: Mutex<Vec<(u64, String)>>,
}

impl Communicator for RecordingCommunicator {
    fn post_message<'a>(
        &'a self,
        user: &'a User,
        request: &'a SendMessage,
    ) -> BoxFuture<'a, VerniteResult<()>> {
        Box::pin(async move {
            self.posted
                .lock()
                .unwrap()
                .push((user.id, request.content.clone()));
            Ok(())
        })
    }
}

#[tokio::test]
async fn send_message_reaches_communicator_and_replies_fan_out_per_user() {
    let communicator = Arc::new(RecordingCommunicator::default());
    let handlers = handlers::catalog(HandlerDeps {
        communicator: Some(communicator.clone()),
    })
    .unwrap();
    let gw = boot(
        store_with("tok-1", user(1, "alice", false)),
        handlers,
        Duration::from_secs(60),
    )
    .await;

    let mut alice = connect(&gw.url, &[("cookie", "session=tok-1")]).await;
    let mut anon = connect(&gw.url, &[]).await;
    wait_for_sessions(&gw.connections, 2).await;

    let request = SendMessage {
        integration_id: 4,
        provider: "slack".into(),
        channel: "C123".into(),
        content: "deploy done".into(),
    };
    alice
        .send(Message::Binary(codec::encode(&request).unwrap().into()))
        .await
        .unwrap();

    timeout(TIMEOUT, async {
        while communicator.posted.lock().unwrap().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("communicator never called");
    assert_eq!(communicator.posted.lock().unwrap()[0], (1, "deploy done".to_string()));

    let reply = ChatMessage {
        id: "1700000000.000100".into(),
        user: "U01".into(),
        channel: "C123".into(),
        content: "ack".into(),
        timestamp: None,
        provider: "slack".into(),
    };
    assert_eq!(gw.connections.send_to_user(1, &reply).await, 1);
    let got: ChatMessage = next_packet(&mut alice).await;
    assert_eq!(got.content, "ack");

    anon.send(Message::Text("marker".into())).await.unwrap();
    assert_eq!(next_text(&mut alice).await, "marker");
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let gw = boot_default(Arc::new(MemorySessionStore::new())).await;
    let mut ws = connect(&gw.url, &[]).await;
    wait_for_sessions(&gw.connections, 1).await;

    gw.shutdown.send(()).unwrap();
    timeout(TIMEOUT, gw.accept_loop).await.unwrap().unwrap();

    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("client never saw the connection end");
    wait_for_sessions(&gw.connections, 0).await;
}
