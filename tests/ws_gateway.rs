//! End-to-end gateway tests over a real WebSocket.
//!
//! The gateway is served on an ephemeral port; no SSH or MySQL servers are
//! available, so backend opens target unroutable addresses and the tests
//! assert the protocol behavior around them.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use k256::ecdsa::SigningKey;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use walletgate::auth::{address_from_key, personal_message_hash};
use walletgate::{app, AppState, Config};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Wallet {
    key: SigningKey,
    address: String,
}

impl Wallet {
    fn random() -> Self {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let address = address_from_key(key.verifying_key());
        Self { key, address }
    }

    fn sign(&self, message: &str) -> String {
        let hash = personal_message_hash(message.as_bytes());
        let (sig, recid) = self.key.sign_prehash_recoverable(&hash).unwrap();
        let mut bytes = sig.to_bytes().to_vec();
        bytes.push(recid.to_byte() + 27);
        format!("0x{}", hex::encode(bytes))
    }
}

async fn start_gateway(mut config: Config) -> SocketAddr {
    config.server.connect_timeout_secs = 1;
    let state = AppState::new(config);
    let router = app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket connect");
    ws
}

async fn send_event(ws: &mut WsClient, event: Value) {
    ws.send(Message::Text(event.to_string().into()))
        .await
        .expect("send event");
}

async fn recv_event(ws: &mut WsClient) -> Value {
    loop {
        let message = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("event is JSON");
        }
    }
}

/// Authenticate `wallet` on `ws` and assert success.
async fn authenticate(ws: &mut WsClient, wallet: &Wallet) {
    let message = "login to gateway";
    send_event(
        ws,
        json!({
            "type": "auth",
            "address": wallet.address,
            "message": message,
            "signature": wallet.sign(message),
        }),
    )
    .await;
    let reply = recv_event(ws).await;
    assert_eq!(reply["type"], "auth.success", "unexpected reply: {reply}");
}

#[tokio::test]
async fn session_events_require_auth() {
    let addr = start_gateway(Config::default()).await;
    let mut ws = connect(addr).await;

    send_event(&mut ws, json!({ "type": "session.open", "kind": "shell" })).await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["type"], "session.error");
    assert_eq!(reply["code"], "auth_required");
    assert_eq!(reply["kind"], "shell");
}

#[tokio::test]
async fn auth_rejects_missing_parameters() {
    let addr = start_gateway(Config::default()).await;
    let mut ws = connect(addr).await;

    send_event(&mut ws, json!({ "type": "auth", "address": "0xabc" })).await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["type"], "auth.error");
    assert_eq!(reply["code"], "missing_parameters");
}

#[tokio::test]
async fn auth_rejects_invalid_signature() {
    let addr = start_gateway(Config::default()).await;
    let mut ws = connect(addr).await;
    let wallet = Wallet::random();

    // signature over a different message
    send_event(
        &mut ws,
        json!({
            "type": "auth",
            "address": wallet.address,
            "message": "login",
            "signature": wallet.sign("something else"),
        }),
    )
    .await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["type"], "auth.error");
    assert_eq!(reply["code"], "invalid_signature");
}

#[tokio::test]
async fn auth_enforces_allow_list() {
    let mut config = Config::default();
    config.auth.authorized_addresses = vec!["0x0000000000000000000000000000000000000001".into()];
    let addr = start_gateway(config).await;
    let mut ws = connect(addr).await;
    let wallet = Wallet::random();

    let message = "login";
    send_event(
        &mut ws,
        json!({
            "type": "auth",
            "address": wallet.address,
            "message": message,
            "signature": wallet.sign(message),
        }),
    )
    .await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["type"], "auth.error");
    assert_eq!(reply["code"], "unauthorized");
}

#[tokio::test]
async fn allow_list_matching_ignores_case() {
    let wallet = Wallet::random();
    let mut config = Config::default();
    config.auth.authorized_addresses = vec![wallet.address.to_uppercase().replace("0X", "0x")];
    let addr = start_gateway(config).await;
    let mut ws = connect(addr).await;

    authenticate(&mut ws, &wallet).await;
}

#[tokio::test]
async fn open_rejects_unknown_kind() {
    let addr = start_gateway(Config::default()).await;
    let mut ws = connect(addr).await;
    authenticate(&mut ws, &Wallet::random()).await;

    send_event(&mut ws, json!({ "type": "session.open", "kind": "ftp" })).await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["type"], "session.error");
    assert_eq!(reply["code"], "unknown_kind");
    assert_eq!(reply["kind"], "ftp");
}

#[tokio::test]
async fn failed_open_reports_and_frees_the_slot() {
    let addr = start_gateway(Config::default()).await;
    let mut ws = connect(addr).await;
    authenticate(&mut ws, &Wallet::random()).await;

    let open = json!({
        "type": "session.open",
        "kind": "database",
        "target": {
            "host": "127.0.0.1", "port": 1,
            "user": "u", "password": "p", "database": "d",
        },
    });

    send_event(&mut ws, open.clone()).await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["type"], "session.error");
    assert_eq!(reply["code"], "open_failed");

    // the failed attempt must not latch the slot
    send_event(&mut ws, open).await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["code"], "open_failed");
}

#[tokio::test]
async fn concurrent_opens_are_single_flight() {
    let addr = start_gateway(Config::default()).await;
    let mut ws = connect(addr).await;
    authenticate(&mut ws, &Wallet::random()).await;

    // the first open stays in flight until its connect timeout, the second
    // is rejected synchronously
    let hold_port = silent_listener().await;

    let open = json!({
        "type": "session.open",
        "kind": "database",
        "target": {
            "host": "127.0.0.1", "port": hold_port,
            "user": "u", "password": "p", "database": "d",
        },
    });
    send_event(&mut ws, open.clone()).await;
    send_event(&mut ws, open).await;

    let mut codes = vec![
        recv_event(&mut ws).await["code"].as_str().unwrap().to_string(),
        recv_event(&mut ws).await["code"].as_str().unwrap().to_string(),
    ];
    codes.sort();
    assert_eq!(codes, vec!["already_open", "open_failed"]);
}

/// A listener that accepts TCP connections but never completes the MySQL
/// handshake, so a database open stays in flight until its connect timeout.
async fn silent_listener() -> u16 {
    let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = holder.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = holder.accept().await {
            held.push(socket);
        }
    });
    port
}

#[tokio::test]
async fn close_while_opening_tears_down_and_frees_the_slot() {
    let addr = start_gateway(Config::default()).await;
    let mut ws = connect(addr).await;
    authenticate(&mut ws, &Wallet::random()).await;

    let port = silent_listener().await;
    send_event(
        &mut ws,
        json!({
            "type": "session.open",
            "kind": "database",
            "target": {
                "host": "127.0.0.1", "port": port,
                "user": "u", "password": "p", "database": "d",
            },
        }),
    )
    .await;
    send_event(&mut ws, json!({ "type": "session.close", "kind": "database" })).await;

    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["type"], "session.closed", "unexpected reply: {reply}");
    assert_eq!(reply["kind"], "database");

    // let the cancelled connect hit its timeout: its failure must stay
    // silent and must not latch the slot
    tokio::time::sleep(Duration::from_millis(1500)).await;
    send_event(
        &mut ws,
        json!({
            "type": "session.open",
            "kind": "database",
            "target": {
                "host": "127.0.0.1", "port": 1,
                "user": "u", "password": "p", "database": "d",
            },
        }),
    )
    .await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["type"], "session.error");
    assert_eq!(reply["code"], "open_failed");
}

#[tokio::test]
async fn close_does_not_stall_the_dispatch_loop() {
    let addr = start_gateway(Config::default()).await;
    let mut ws = connect(addr).await;
    authenticate(&mut ws, &Wallet::random()).await;

    let port = silent_listener().await;
    send_event(
        &mut ws,
        json!({
            "type": "session.open",
            "kind": "database",
            "target": {
                "host": "127.0.0.1", "port": port,
                "user": "u", "password": "p", "database": "d",
            },
        }),
    )
    .await;
    send_event(&mut ws, json!({ "type": "session.close", "kind": "database" })).await;
    send_event(&mut ws, json!({ "type": "ping" })).await;

    // the close must not hold up dispatch: the pong follows right behind
    // the session.closed, well before the pending connect resolves
    let deadline = Duration::from_millis(500);
    let reply = timeout(deadline, recv_event(&mut ws)).await.unwrap();
    assert_eq!(reply["type"], "session.closed");
    let reply = timeout(deadline, recv_event(&mut ws)).await.unwrap();
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn data_and_close_require_an_open_session() {
    let addr = start_gateway(Config::default()).await;
    let mut ws = connect(addr).await;
    authenticate(&mut ws, &Wallet::random()).await;

    send_event(
        &mut ws,
        json!({ "type": "session.data", "kind": "shell", "payload": {"data": "ls\n"} }),
    )
    .await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["type"], "session.error");
    assert_eq!(reply["code"], "not_open");

    send_event(&mut ws, json!({ "type": "session.close", "kind": "shell" })).await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["code"], "not_open");
}

#[tokio::test]
async fn unknown_event_types_get_an_error() {
    let addr = start_gateway(Config::default()).await;
    let mut ws = connect(addr).await;

    send_event(&mut ws, json!({ "type": "bogus" })).await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["reason"].as_str().unwrap().contains("bogus"));

    send_event(&mut ws, json!({ "hello": 1 })).await;
    let reply = recv_event(&mut ws).await;
    assert_eq!(reply["type"], "error");
}

#[tokio::test]
async fn ping_gets_pong() {
    let addr = start_gateway(Config::default()).await;
    let mut ws = connect(addr).await;

    send_event(&mut ws, json!({ "type": "ping" })).await;
    assert_eq!(recv_event(&mut ws).await["type"], "pong");
}

#[tokio::test]
async fn health_reports_status_and_version() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let addr = start_gateway(Config::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!("GET /api/health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"ok\""));
    assert!(response.contains(env!("CARGO_PKG_VERSION")));
}
