#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_domain::wire::InboundMessage;
use relay_domain::{ConnectionKey, Message, Profile, SubjectId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::connection::{ConnectionReader, ConnectionWriter, Received};
use crate::server::hub::{LeaveReason, RelayHub};
use crate::server::store::MessageStore;

/// Shared dependencies for every ingestion loop.
#[derive(Clone)]
pub struct IngestDeps {
	pub hub: RelayHub,
	pub store: Arc<dyn MessageStore>,
	pub append_timeout: Duration,
	pub idle_timeout: Option<Duration>,
}

/// Per-connection state owned by one ingestion loop.
pub struct IngestContext {
	pub key: ConnectionKey,
	pub subject_id: Option<SubjectId>,
	pub profile: watch::Receiver<Option<Profile>>,
	/// Hub-side removal of this connection, e.g. a slow-consumer eviction.
	pub evicted: watch::Receiver<Option<LeaveReason>>,
	pub deps: IngestDeps,
}

/// Register a freshly upgraded connection and start its ingestion loop.
pub async fn start_session<R, W>(
	deps: &IngestDeps,
	subject_id: Option<SubjectId>,
	reader: R,
	writer: W,
) -> anyhow::Result<(ConnectionKey, JoinHandle<LeaveReason>)>
where
	R: ConnectionReader,
	W: ConnectionWriter,
{
	let registration = deps.hub.register_connection(subject_id.clone(), writer).await?;
	let key = registration.key;

	let ctx = IngestContext {
		key,
		subject_id,
		profile: registration.profile,
		evicted: registration.evicted,
		deps: deps.clone(),
	};

	Ok((key, tokio::spawn(run_ingest_loop(ctx, reader))))
}

async fn evicted(rx: &mut watch::Receiver<Option<LeaveReason>>) -> LeaveReason {
	match rx.wait_for(Option::is_some).await {
		Ok(reason) => (*reason).unwrap_or(LeaveReason::Shutdown),
		Err(_) => LeaveReason::Shutdown,
	}
}

/// `None` when the idle limit passed without any frame.
async fn receive_within<R>(reader: &mut R, idle_timeout: Option<Duration>) -> Option<Received>
where
	R: ConnectionReader,
{
	match idle_timeout {
		Some(limit) => tokio::time::timeout(limit, reader.receive()).await.ok(),
		None => Some(reader.receive().await),
	}
}

enum Step {
	Continue,
	Stop(LeaveReason),
}

/// Read, stamp, persist and hand off messages until the connection ends.
///
/// Always finishes by asking the hub to drop this connection. Stops with the
/// hub's reason as soon as the hub drops the connection on its own.
pub async fn run_ingest_loop<R>(mut ctx: IngestContext, mut reader: R) -> LeaveReason
where
	R: ConnectionReader,
{
	debug!(conn = %ctx.key, identified = ctx.subject_id.is_some(), "ingest loop started");

	let reason = loop {
		let received = tokio::select! {
			biased;

			reason = evicted(&mut ctx.evicted) => break reason,
			received = receive_within(&mut reader, ctx.deps.idle_timeout) => match received {
				Some(received) => received,
				None => break LeaveReason::IdleTimeout,
			},
		};

		if let Some(reason) = *ctx.evicted.borrow() {
			break reason;
		}

		let payload = match received {
			Received::Text(payload) => payload,
			Received::Heartbeat => continue,
			Received::Closed => break LeaveReason::Closed,
			Received::Failed(e) => {
				debug!(conn = %ctx.key, error = %e, "connection read failed");
				break LeaveReason::ReadError;
			}
		};

		match ingest_payload(&ctx, &payload).await {
			Step::Continue => {}
			Step::Stop(reason) => break reason,
		}
	};

	ctx.deps.hub.leave(ctx.key, reason).await;
	debug!(conn = %ctx.key, %reason, "ingest loop finished");
	reason
}

async fn ingest_payload(ctx: &IngestContext, payload: &str) -> Step {
	metrics::counter!("relay_server_messages_received_total").increment(1);

	let inbound: InboundMessage = match serde_json::from_str(payload) {
		Ok(inbound) => inbound,
		Err(e) => {
			warn!(conn = %ctx.key, error = %e, "malformed inbound message; closing connection");
			metrics::counter!("relay_server_protocol_errors_total").increment(1);
			return Step::Stop(LeaveReason::ProtocolError);
		}
	};

	let mut message = Message::new(inbound.text);
	{
		let profile = ctx.profile.borrow();
		message.stamp(ctx.subject_id.as_ref(), profile.as_ref());
	}

	let id = match tokio::time::timeout(ctx.deps.append_timeout, ctx.deps.store.append(&message)).await {
		Ok(Ok(id)) => id,
		Ok(Err(e)) => {
			warn!(conn = %ctx.key, error = %e, "failed to persist message; dropped");
			metrics::counter!("relay_server_persist_failures_total").increment(1);
			return Step::Continue;
		}
		Err(_) => {
			warn!(
				conn = %ctx.key,
				timeout_ms = ctx.deps.append_timeout.as_millis() as u64,
				"persisting message timed out; dropped"
			);
			metrics::counter!("relay_server_persist_failures_total").increment(1);
			return Step::Continue;
		}
	};

	metrics::counter!("relay_server_messages_ingested_total").increment(1);

	if ctx.deps.hub.accept_message(message.into_persisted(id), Some(ctx.key)).await {
		Step::Continue
	} else {
		Step::Stop(LeaveReason::Shutdown)
	}
}
