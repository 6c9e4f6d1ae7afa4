#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{
	ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
	ACCESS_CONTROL_ALLOW_ORIGIN, CONNECTION, CONTENT_TYPE, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
	SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use relay_domain::SubjectId;
use relay_domain::wire::HistoryResponse;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tracing::{debug, info, warn};

use crate::config::RouteSettings;
use crate::server::connection::split_websocket;
use crate::server::health::{HealthState, health_response};
use crate::server::history::HistoryService;
use crate::server::identity::{Credentials, IdentityResolver, resolve_with_timeout};
use crate::server::ingest::{IngestDeps, start_session};

const CORS_ALLOW_METHODS: &str = "POST, GET, OPTIONS, PUT, DELETE";
const CORS_ALLOW_HEADERS: &str = "Accept, Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization";

/// Everything a request handler needs.
#[derive(Clone)]
pub struct AppState {
	pub routes: RouteSettings,
	pub ingest: IngestDeps,
	pub history: HistoryService,
	pub identity: Arc<dyn IdentityResolver>,
	pub cookie_name: String,
	pub resolve_timeout: Duration,
	pub max_message_bytes: usize,
	pub health: HealthState,
}

type HttpResponse = Response<Full<Bytes>>;

fn respond(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

/// Accept connections until the listener fails permanently.
pub async fn serve(listener: TcpListener, tls: Option<TlsAcceptor>, state: Arc<AppState>) -> anyhow::Result<()> {
	let local = listener.local_addr()?;
	info!(addr = %local, tls = tls.is_some(), "relay server listening");

	let mut backoff = Duration::from_millis(10);
	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => {
				backoff = Duration::from_millis(10);
				accepted
			}
			Err(e) => {
				warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "accept failed");
				tokio::time::sleep(backoff).await;
				backoff = (backoff * 2).min(Duration::from_secs(1));
				continue;
			}
		};

		let state = Arc::clone(&state);
		match tls.clone() {
			None => spawn_http_connection(stream, state),
			Some(acceptor) => {
				tokio::spawn(async move {
					match acceptor.accept(stream).await {
						Ok(tls_stream) => spawn_http_connection(tls_stream, state),
						Err(e) => debug!(%remote, error = %e, "tls handshake failed"),
					}
				});
			}
		}
	}
}

fn spawn_http_connection<S>(stream: S, state: Arc<AppState>)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	tokio::spawn(async move {
		let service = service_fn(move |req| route(req, Arc::clone(&state)));
		if let Err(err) = http1::Builder::new()
			.serve_connection(TokioIo::new(stream), service)
			.with_upgrades()
			.await
		{
			debug!(error = %err, "http connection error");
		}
	});
}

async fn route(req: Request<Incoming>, state: Arc<AppState>) -> Result<HttpResponse, Infallible> {
	let path = req.uri().path().to_owned();

	let resp = if path == state.routes.ws_route {
		handle_upgrade(req, state).await
	} else if path == state.routes.message_route {
		handle_history(req.method(), &state).await
	} else if let Some(resp) = health_response(&path, &state.health) {
		resp
	} else {
		respond(StatusCode::NOT_FOUND, Bytes::new())
	};

	Ok(resp)
}

fn with_cors(mut resp: HttpResponse) -> HttpResponse {
	let headers = resp.headers_mut();
	headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
	headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(CORS_ALLOW_METHODS));
	headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
	headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(CORS_ALLOW_HEADERS));
	resp
}

fn json_response(status: StatusCode, body: &HistoryResponse) -> HttpResponse {
	match serde_json::to_vec(body) {
		Ok(json) => {
			let mut resp = respond(status, json);
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		Err(e) => {
			warn!(error = %e, "failed to encode history response");
			respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
		}
	}
}

async fn handle_history(method: &Method, state: &AppState) -> HttpResponse {
	let resp = match *method {
		Method::OPTIONS => respond(StatusCode::OK, Bytes::new()),
		Method::GET => match state.history.load_history().await {
			Ok(messages) => {
				metrics::counter!("relay_server_history_requests_total", "outcome" => "ok").increment(1);
				json_response(StatusCode::OK, &HistoryResponse::success(&messages))
			}
			Err(e) => {
				warn!(error = %e, "history request failed");
				metrics::counter!("relay_server_history_requests_total", "outcome" => "error").increment(1);
				json_response(StatusCode::INTERNAL_SERVER_ERROR, &HistoryResponse::error())
			}
		},
		_ => respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()),
	};

	with_cors(resp)
}

fn header_has_token(req: &Request<Incoming>, name: hyper::header::HeaderName, token: &str) -> bool {
	req.headers()
		.get_all(name)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// The `Sec-WebSocket-Accept` value for a valid upgrade request.
fn websocket_accept_key(req: &Request<Incoming>) -> Option<String> {
	if req.method() != Method::GET
		|| !header_has_token(req, CONNECTION, "upgrade")
		|| !header_has_token(req, UPGRADE, "websocket")
		|| req.headers().get(SEC_WEBSOCKET_VERSION).map(|v| v.as_bytes()) != Some(b"13".as_slice())
	{
		return None;
	}

	let key = req.headers().get(SEC_WEBSOCKET_KEY)?;
	Some(derive_accept_key(key.as_bytes()))
}

async fn handle_upgrade(mut req: Request<Incoming>, state: Arc<AppState>) -> HttpResponse {
	let Some(accept_key) = websocket_accept_key(&req) else {
		return respond(StatusCode::BAD_REQUEST, "expected a websocket upgrade request");
	};
	let Ok(accept_value) = HeaderValue::from_str(&accept_key) else {
		return respond(StatusCode::BAD_REQUEST, "invalid websocket key");
	};

	let credentials = Credentials::from_request(req.headers(), req.uri(), &state.cookie_name);
	let subject_id = resolve_with_timeout(state.identity.as_ref(), &credentials, state.resolve_timeout).await;

	let on_upgrade = hyper::upgrade::on(&mut req);
	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				let ws_config = WebSocketConfig::default()
					.max_message_size(Some(state.max_message_bytes))
					.max_frame_size(Some(state.max_message_bytes));
				let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, Some(ws_config)).await;
				attach(ws, subject_id, &state).await;
			}
			Err(e) => warn!(error = %e, "websocket upgrade failed"),
		}
	});

	let mut resp = respond(StatusCode::SWITCHING_PROTOCOLS, Bytes::new());
	let headers = resp.headers_mut();
	headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
	headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
	headers.insert(SEC_WEBSOCKET_ACCEPT, accept_value);
	resp
}

async fn attach<S>(ws: WebSocketStream<S>, subject_id: Option<SubjectId>, state: &AppState)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (reader, writer) = split_websocket(ws);
	match start_session(&state.ingest, subject_id, reader, writer).await {
		Ok((key, _loop)) => debug!(conn = %key, "websocket session attached"),
		Err(e) => warn!(error = %e, "failed to attach websocket session"),
	}
}
