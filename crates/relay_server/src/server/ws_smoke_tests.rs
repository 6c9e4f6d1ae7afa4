#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_domain::wire::{HistoryResponse, HistoryStatus, WireMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::RouteSettings;
use crate::server::health::HealthState;
use crate::server::history::HistoryService;
use crate::server::http::{AppState, serve};
use crate::server::hub::{HubConfig, RelayHub};
use crate::server::identity::{HmacIdentityResolver, unix_now_secs};
use crate::server::ingest::IngestDeps;
use crate::server::store::{MemoryMessageStore, MessageStore};
use crate::server::test_support::{StaticProfiles, wait_for_registry};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "smoke-secret";

async fn start_server() -> (SocketAddr, Arc<AppState>) {
	let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::default());
	let profiles = Arc::new(StaticProfiles::default().with("u1", "alice", "alice.png"));

	let hub = RelayHub::spawn(
		HubConfig {
			ping_interval: None,
			..HubConfig::default()
		},
		profiles.clone(),
	);

	let health = HealthState::new();
	health.mark_ready();

	let state = Arc::new(AppState {
		routes: RouteSettings::default(),
		ingest: IngestDeps {
			hub,
			store: Arc::clone(&store),
			append_timeout: Duration::from_secs(1),
			idle_timeout: None,
		},
		history: HistoryService::new(store, profiles, Duration::from_secs(1), Duration::from_secs(1)),
		identity: Arc::new(HmacIdentityResolver::new(SECRET)),
		cookie_name: "session_token".to_string(),
		resolve_timeout: Duration::from_secs(1),
		max_message_bytes: 64 * 1024,
		health,
	});

	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");
	tokio::spawn(serve(listener, None, Arc::clone(&state)));

	(addr, state)
}

async fn next_text(client: &mut Client) -> WireMessage {
	loop {
		let frame = timeout(Duration::from_secs(2), client.next())
			.await
			.expect("frame within timeout")
			.expect("stream open")
			.expect("websocket frame");
		match frame {
			WsMessage::Text(text) => return serde_json::from_str(text.as_str()).expect("wire json"),
			WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
			other => panic!("unexpected frame: {other:?}"),
		}
	}
}

async fn raw_http(addr: SocketAddr, request: &str) -> String {
	let mut stream = TcpStream::connect(addr).await.expect("connect");
	stream.write_all(request.as_bytes()).await.expect("write request");
	let mut buf = Vec::new();
	timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
		.await
		.expect("response within timeout")
		.expect("read response");
	String::from_utf8_lossy(&buf).into_owned()
}

fn body_of(response: &str) -> &str {
	response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default()
}

#[tokio::test]
async fn websocket_round_trip_then_history() {
	let (addr, state) = start_server().await;
	let hub = state.ingest.hub.clone();

	let token = HmacIdentityResolver::new(SECRET).mint("u1", unix_now_secs() + 60);
	let (mut alice, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
		.await
		.expect("alice connects");
	let (mut guest, _) = connect_async(format!("ws://{addr}/ws")).await.expect("guest connects");

	wait_for_registry(&hub, |s| {
		s.len() == 2 && s.connections.iter().any(|c| c.display_name.as_deref() == Some("alice"))
	})
	.await;

	alice
		.send(WsMessage::text(r#"{"text":"hello","uid":"forged"}"#))
		.await
		.unwrap();

	let at_guest = next_text(&mut guest).await;
	let at_alice = next_text(&mut alice).await;
	assert_eq!(at_guest, at_alice);
	assert_eq!(at_guest.text, "hello");
	assert_eq!(at_guest.uid.as_deref(), Some("u1"));
	assert_eq!(at_guest.login.as_deref(), Some("alice"));
	assert!(at_guest.id.is_some());

	guest.send(WsMessage::text(r#"{"text":"anon"}"#)).await.unwrap();
	let anon = next_text(&mut alice).await;
	assert_eq!(anon.text, "anon");
	assert_eq!(anon.uid, None);

	let response = raw_http(
		addr,
		"GET /api/messages HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
	)
	.await;
	assert!(response.starts_with("HTTP/1.1 200"), "{response}");
	assert!(response.to_ascii_lowercase().contains("access-control-allow-origin: *"));

	let history: HistoryResponse = serde_json::from_str(body_of(&response)).expect("history json");
	assert_eq!(history.status, HistoryStatus::Success);
	let texts: Vec<_> = history.payload.iter().map(|m| m.text.as_str()).collect();
	assert_eq!(texts, ["anon", "hello"]);
	assert_eq!(history.payload[1].login.as_deref(), Some("alice"));

	guest.close(None).await.unwrap();
	wait_for_registry(&hub, |s| s.len() == 1).await;
}

#[tokio::test]
async fn history_route_handles_preflight_and_other_methods() {
	let (addr, _state) = start_server().await;

	let preflight = raw_http(
		addr,
		"OPTIONS /api/messages HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
	)
	.await;
	assert!(preflight.starts_with("HTTP/1.1 200"), "{preflight}");
	let lower = preflight.to_ascii_lowercase();
	assert!(lower.contains("access-control-allow-methods: post, get, options, put, delete"));
	assert!(lower.contains("access-control-allow-credentials: true"));
	assert!(body_of(&preflight).is_empty());

	let post = raw_http(
		addr,
		"POST /api/messages HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
	)
	.await;
	assert!(post.starts_with("HTTP/1.1 405"), "{post}");
}

#[tokio::test]
async fn plain_get_on_socket_route_is_rejected_and_health_answers() {
	let (addr, _state) = start_server().await;

	let not_upgrade = raw_http(addr, "GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
	assert!(not_upgrade.starts_with("HTTP/1.1 400"), "{not_upgrade}");

	let ready = raw_http(addr, "GET /readyz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
	assert!(ready.starts_with("HTTP/1.1 200"), "{ready}");

	let missing = raw_http(addr, "GET /nope HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
	assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");
}
