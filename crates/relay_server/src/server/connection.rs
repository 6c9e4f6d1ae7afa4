#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, anyhow};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

/// A serialized outbound message, shared between every recipient of one broadcast.
pub type OutboundFrame = Arc<str>;

/// One inbound event from a client connection.
#[derive(Debug)]
pub enum Received {
	Text(String),
	/// Keepalive traffic (ping/pong). Counts as activity but carries no payload.
	Heartbeat,
	Closed,
	Failed(anyhow::Error),
}

/// Read half of a client connection.
#[async_trait::async_trait]
pub trait ConnectionReader: Send + 'static {
	async fn receive(&mut self) -> Received;
}

/// Write half of a client connection. Owned by exactly one writer task.
#[async_trait::async_trait]
pub trait ConnectionWriter: Send + 'static {
	async fn send(&mut self, frame: OutboundFrame) -> anyhow::Result<()>;

	async fn ping(&mut self) -> anyhow::Result<()>;

	async fn close(&mut self);
}

/// Shared alive flag. Flips to dead exactly once.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
	pub fn new() -> Self {
		Self(Arc::new(AtomicBool::new(true)))
	}

	pub fn is_alive(&self) -> bool {
		self.0.load(Ordering::Acquire)
	}

	/// Returns true only for the call that performed the transition.
	pub fn mark_dead(&self) -> bool {
		self.0.swap(false, Ordering::AcqRel)
	}
}

impl Default for Liveness {
	fn default() -> Self {
		Self::new()
	}
}

pub struct WsReader<S> {
	stream: SplitStream<WebSocketStream<S>>,
}

pub struct WsWriter<S> {
	sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

pub fn split_websocket<S>(ws: WebSocketStream<S>) -> (WsReader<S>, WsWriter<S>)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (sink, stream) = ws.split();
	(WsReader { stream }, WsWriter { sink })
}

#[async_trait::async_trait]
impl<S> ConnectionReader for WsReader<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	async fn receive(&mut self) -> Received {
		match self.stream.next().await {
			None => Received::Closed,
			Some(Ok(WsMessage::Text(text))) => Received::Text(text.as_str().to_owned()),
			Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data.to_vec()) {
				Ok(text) => Received::Text(text),
				Err(e) => Received::Failed(anyhow!(e).context("binary frame is not utf-8")),
			},
			Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => Received::Heartbeat,
			Some(Ok(WsMessage::Close(_))) => Received::Closed,
			Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Received::Closed,
			Some(Err(e)) => Received::Failed(anyhow!(e).context("websocket read")),
		}
	}
}

#[async_trait::async_trait]
impl<S> ConnectionWriter for WsWriter<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	async fn send(&mut self, frame: OutboundFrame) -> anyhow::Result<()> {
		self.sink
			.send(WsMessage::text(frame.as_ref().to_owned()))
			.await
			.context("websocket write")
	}

	async fn ping(&mut self) -> anyhow::Result<()> {
		self.sink
			.send(WsMessage::Ping(Bytes::new()))
			.await
			.context("websocket ping")
	}

	async fn close(&mut self) {
		let _ = self.sink.close().await;
	}
}
