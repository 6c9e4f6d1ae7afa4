#![forbid(unsafe_code)]

//! Single-owner coordination loop for the connection registry.
//!
//! The registry lives inside one task. Everything else talks to it through two
//! bounded queues: a control queue (join, leave, profile updates, inspection)
//! and a message queue carrying already-persisted messages. Control events are
//! always drained first, so a leave that was enqueued before a message is
//! accepted is applied before that message is fanned out.
//!
//! The loop never awaits a client. Each connection owns a bounded outbound
//! queue drained by its own writer task; a full or closed queue evicts the
//! connection instead of stalling the broadcast.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use relay_domain::wire::WireMessage;
use relay_domain::{ConnectionKey, PersistedMessage, Profile, SubjectId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HubSettings;
use crate::server::connection::{ConnectionWriter, Liveness, OutboundFrame};
use crate::server::profiles::{ProfileLookup, lookup_best_effort};

/// Settings for the relay hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
	pub message_queue_capacity: usize,
	pub control_queue_capacity: usize,
	/// Maximum number of frames queued per connection before it counts as a slow consumer.
	pub outbound_queue_capacity: usize,
	pub echo_to_sender: bool,
	pub ping_interval: Option<Duration>,
	pub profile_timeout: Duration,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self::from_settings(&HubSettings::default(), Duration::from_secs(2))
	}
}

impl HubConfig {
	pub fn from_settings(hub: &HubSettings, profile_timeout: Duration) -> Self {
		Self {
			message_queue_capacity: hub.message_queue_capacity,
			control_queue_capacity: hub.control_queue_capacity,
			outbound_queue_capacity: hub.outbound_queue_capacity,
			echo_to_sender: hub.echo_to_sender,
			ping_interval: hub.ping_interval,
			profile_timeout,
		}
	}
}

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
	Closed,
	ReadError,
	ProtocolError,
	IdleTimeout,
	SendFailed,
	SlowConsumer,
	Shutdown,
}

impl LeaveReason {
	pub fn as_str(self) -> &'static str {
		match self {
			LeaveReason::Closed => "closed",
			LeaveReason::ReadError => "read_error",
			LeaveReason::ProtocolError => "protocol_error",
			LeaveReason::IdleTimeout => "idle_timeout",
			LeaveReason::SendFailed => "send_failed",
			LeaveReason::SlowConsumer => "slow_consumer",
			LeaveReason::Shutdown => "shutdown",
		}
	}
}

impl fmt::Display for LeaveReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// What the ingestion loop gets back after registering.
#[derive(Debug)]
pub struct Registration {
	pub key: ConnectionKey,
	/// Latest resolved profile. Starts as `None` and is filled in once enrichment completes.
	pub profile: watch::Receiver<Option<Profile>>,
	/// Set once the hub drops this connection, whoever asked for it.
	pub evicted: watch::Receiver<Option<LeaveReason>>,
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Default)]
pub struct HubSnapshot {
	pub connections: Vec<ConnectionSummary>,
}

#[derive(Debug, Clone)]
pub struct ConnectionSummary {
	pub key: ConnectionKey,
	pub subject_id: Option<SubjectId>,
	pub display_name: Option<String>,
	pub avatar_ref: Option<String>,
}

impl HubSnapshot {
	pub fn len(&self) -> usize {
		self.connections.len()
	}

	#[allow(dead_code)]
	pub fn get(&self, key: ConnectionKey) -> Option<&ConnectionSummary> {
		self.connections.iter().find(|c| c.key == key)
	}
}

struct PendingJoin {
	key: ConnectionKey,
	subject_id: Option<SubjectId>,
	writer: Box<dyn ConnectionWriter>,
	profile_tx: watch::Sender<Option<Profile>>,
	evicted_tx: watch::Sender<Option<LeaveReason>>,
}

enum HubControl {
	Join(PendingJoin),
	Leave {
		key: ConnectionKey,
		reason: LeaveReason,
	},
	Enriched {
		key: ConnectionKey,
		profile: Profile,
	},
	Inspect(oneshot::Sender<HubSnapshot>),
}

struct Accepted {
	message: PersistedMessage,
	origin: Option<ConnectionKey>,
}

/// Cloneable handle to the hub loop.
#[derive(Clone)]
pub struct RelayHub {
	control_tx: mpsc::Sender<HubControl>,
	message_tx: mpsc::Sender<Accepted>,
	next_key: Arc<AtomicU64>,
}

impl RelayHub {
	/// Start the hub loop on the current runtime.
	pub fn spawn(cfg: HubConfig, profiles: Arc<dyn ProfileLookup>) -> Self {
		let (control_tx, control_rx) = mpsc::channel(cfg.control_queue_capacity.max(1));
		let (message_tx, message_rx) = mpsc::channel(cfg.message_queue_capacity.max(1));

		let hub_loop = HubLoop {
			control_weak: control_tx.downgrade(),
			cfg,
			profiles,
			registry: HashMap::new(),
			control_rx,
			message_rx,
		};
		tokio::spawn(hub_loop.run());

		Self {
			control_tx,
			message_tx,
			next_key: Arc::new(AtomicU64::new(1)),
		}
	}

	/// Add a connection to the registry. Its writer half is handed to a dedicated task.
	///
	/// The join is enqueued before this returns, so any later `leave` for the
	/// returned key is applied after it.
	pub async fn register_connection<W>(&self, subject_id: Option<SubjectId>, writer: W) -> anyhow::Result<Registration>
	where
		W: ConnectionWriter,
	{
		let key = ConnectionKey::new(self.next_key.fetch_add(1, Ordering::Relaxed));
		let (profile_tx, profile) = watch::channel(None);
		let (evicted_tx, evicted) = watch::channel(None);

		self.control_tx
			.send(HubControl::Join(PendingJoin {
				key,
				subject_id,
				writer: Box::new(writer),
				profile_tx,
				evicted_tx,
			}))
			.await
			.map_err(|_| anyhow::anyhow!("relay hub is not running"))?;

		Ok(Registration { key, profile, evicted })
	}

	/// Queue a persisted message for fan-out. Returns false if the hub has stopped.
	pub async fn accept_message(&self, message: PersistedMessage, origin: Option<ConnectionKey>) -> bool {
		self.message_tx.send(Accepted { message, origin }).await.is_ok()
	}

	pub async fn leave(&self, key: ConnectionKey, reason: LeaveReason) {
		let _ = self.control_tx.send(HubControl::Leave { key, reason }).await;
	}

	/// Registry view, ordered behind every control event queued so far.
	pub async fn snapshot(&self) -> Option<HubSnapshot> {
		let (tx, rx) = oneshot::channel();
		self.control_tx.send(HubControl::Inspect(tx)).await.ok()?;
		rx.await.ok()
	}

	#[allow(dead_code)]
	pub async fn connection_count(&self) -> usize {
		self.snapshot().await.map(|s| s.len()).unwrap_or(0)
	}
}

struct ConnectionEntry {
	subject_id: Option<SubjectId>,
	display_name: Option<String>,
	avatar_ref: Option<String>,
	outbound: mpsc::Sender<OutboundFrame>,
	liveness: Liveness,
	profile_tx: watch::Sender<Option<Profile>>,
	evicted_tx: watch::Sender<Option<LeaveReason>>,
}

impl ConnectionEntry {
	fn drop_with(&self, reason: LeaveReason) {
		self.liveness.mark_dead();
		self.evicted_tx.send_replace(Some(reason));
	}
}

struct HubLoop {
	cfg: HubConfig,
	profiles: Arc<dyn ProfileLookup>,
	registry: HashMap<ConnectionKey, ConnectionEntry>,
	control_rx: mpsc::Receiver<HubControl>,
	message_rx: mpsc::Receiver<Accepted>,
	control_weak: mpsc::WeakSender<HubControl>,
}

impl HubLoop {
	async fn run(mut self) {
		info!("relay hub started");

		loop {
			tokio::select! {
				biased;

				ctrl = self.control_rx.recv() => match ctrl {
					Some(ctrl) => self.handle_control(ctrl),
					None => break,
				},
				accepted = self.message_rx.recv() => match accepted {
					Some(accepted) => self.broadcast(accepted),
					None => break,
				},
			}
		}

		let remaining = self.registry.len();
		for (key, entry) in self.registry.drain() {
			entry.drop_with(LeaveReason::Shutdown);
			debug!(conn = %key, "relay hub: dropping connection on shutdown");
		}
		metrics::gauge!("relay_server_active_connections").set(0.0);
		info!(remaining, "relay hub exiting (all handles dropped)");
	}

	fn handle_control(&mut self, ctrl: HubControl) {
		match ctrl {
			HubControl::Join(join) => self.join(join),
			HubControl::Leave { key, reason } => self.evict(key, reason),
			HubControl::Enriched { key, profile } => {
				let Some(entry) = self.registry.get_mut(&key) else {
					return;
				};
				entry.display_name = profile.display_name.clone();
				entry.avatar_ref = profile.avatar_ref.clone();
				entry.profile_tx.send_replace(Some(profile));
				debug!(conn = %key, "relay hub: profile attached");
			}
			HubControl::Inspect(reply) => {
				let connections = self
					.registry
					.iter()
					.map(|(key, entry)| ConnectionSummary {
						key: *key,
						subject_id: entry.subject_id.clone(),
						display_name: entry.display_name.clone(),
						avatar_ref: entry.avatar_ref.clone(),
					})
					.collect();
				let _ = reply.send(HubSnapshot { connections });
			}
		}
	}

	fn join(&mut self, join: PendingJoin) {
		let PendingJoin {
			key,
			subject_id,
			writer,
			profile_tx,
			evicted_tx,
		} = join;

		if self.registry.contains_key(&key) {
			warn!(conn = %key, "relay hub: duplicate join ignored");
			return;
		}

		let (outbound, outbound_rx) = mpsc::channel(self.cfg.outbound_queue_capacity.max(1));
		let liveness = Liveness::new();

		tokio::spawn(run_writer(
			key,
			writer,
			outbound_rx,
			liveness.clone(),
			self.cfg.ping_interval,
			self.control_weak.clone(),
		));

		if let Some(subject) = subject_id.clone() {
			self.spawn_enrichment(key, subject);
		}

		self.registry.insert(
			key,
			ConnectionEntry {
				subject_id,
				display_name: None,
				avatar_ref: None,
				outbound,
				liveness,
				profile_tx,
				evicted_tx,
			},
		);

		metrics::counter!("relay_server_connections_total").increment(1);
		metrics::gauge!("relay_server_active_connections").set(self.registry.len() as f64);
		debug!(conn = %key, total = self.registry.len(), "relay hub: connection joined");
	}

	fn spawn_enrichment(&self, key: ConnectionKey, subject: SubjectId) {
		let profiles = Arc::clone(&self.profiles);
		let control = self.control_weak.clone();
		let timeout = self.cfg.profile_timeout;

		tokio::spawn(async move {
			let wanted = BTreeSet::from([subject.clone()]);
			let mut found = lookup_best_effort(profiles.as_ref(), &wanted, timeout).await;
			let Some(profile) = found.remove(&subject).filter(|p| !p.is_empty()) else {
				return;
			};
			if let Some(control) = control.upgrade() {
				let _ = control.send(HubControl::Enriched { key, profile }).await;
			}
		});
	}

	fn evict(&mut self, key: ConnectionKey, reason: LeaveReason) {
		let Some(entry) = self.registry.remove(&key) else {
			return;
		};
		entry.drop_with(reason);

		metrics::counter!("relay_server_disconnects_total", "reason" => reason.as_str()).increment(1);
		metrics::gauge!("relay_server_active_connections").set(self.registry.len() as f64);

		match reason {
			LeaveReason::SlowConsumer | LeaveReason::SendFailed => {
				warn!(conn = %key, %reason, total = self.registry.len(), "relay hub: connection evicted");
			}
			_ => debug!(conn = %key, %reason, total = self.registry.len(), "relay hub: connection left"),
		}
	}

	fn broadcast(&mut self, accepted: Accepted) {
		let Accepted { message, origin } = accepted;

		let frame: OutboundFrame = match serde_json::to_string(&WireMessage::from(&message)) {
			Ok(json) => Arc::from(json),
			Err(e) => {
				warn!(id = %message.id(), error = %e, "relay hub: failed to encode message; dropped");
				return;
			}
		};

		let mut delivered: u64 = 0;
		let mut dead = Vec::new();

		for (key, entry) in &self.registry {
			if !self.cfg.echo_to_sender && origin == Some(*key) {
				continue;
			}
			if !entry.liveness.is_alive() {
				dead.push((*key, LeaveReason::SendFailed));
				continue;
			}

			match entry.outbound.try_send(Arc::clone(&frame)) {
				Ok(()) => delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => dead.push((*key, LeaveReason::SlowConsumer)),
				Err(mpsc::error::TrySendError::Closed(_)) => dead.push((*key, LeaveReason::SendFailed)),
			}
		}

		for (key, reason) in dead {
			self.evict(key, reason);
		}

		metrics::counter!("relay_server_messages_broadcast_total").increment(1);
		metrics::counter!("relay_server_frames_delivered_total").increment(delivered);
		debug!(id = %message.id(), delivered, "relay hub: message fanned out");
	}
}

async fn next_ping(ping: &mut Option<Interval>) {
	match ping {
		Some(interval) => {
			interval.tick().await;
		}
		None => std::future::pending::<()>().await,
	}
}

/// Drains one connection's outbound queue. On write failure the connection is
/// marked dead and the hub is told to drop it. Frames still queued when the
/// connection is marked dead are discarded.
async fn run_writer(
	key: ConnectionKey,
	mut writer: Box<dyn ConnectionWriter>,
	mut outbound: mpsc::Receiver<OutboundFrame>,
	liveness: Liveness,
	ping_interval: Option<Duration>,
	control: mpsc::WeakSender<HubControl>,
) {
	let mut ping = ping_interval.map(|period| {
		let mut interval = tokio::time::interval_at(Instant::now() + period, period);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
		interval
	});

	let failure = loop {
		tokio::select! {
			frame = outbound.recv() => match frame {
				Some(_) if !liveness.is_alive() => break None,
				Some(frame) => {
					if let Err(e) = writer.send(frame).await {
						break Some(e);
					}
				}
				None => break None,
			},
			_ = next_ping(&mut ping) => {
				if let Err(e) = writer.ping().await {
					break Some(e);
				}
			}
		}
	};

	match failure {
		None => writer.close().await,
		Some(e) => {
			debug!(conn = %key, error = %e, "connection writer failed");
			if liveness.mark_dead()
				&& let Some(control) = control.upgrade()
			{
				let _ = control
					.send(HubControl::Leave {
						key,
						reason: LeaveReason::SendFailed,
					})
					.await;
			}
		}
	}
}
