#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use relay_domain::wire::WireMessage;
use relay_domain::{Message, MessageId, Profile, SubjectId};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::timeout;

use crate::server::connection::{ConnectionReader, ConnectionWriter, OutboundFrame, Received};
use crate::server::hub::{HubSnapshot, RelayHub};
use crate::server::profiles::ProfileLookup;
use crate::server::store::{MemoryMessageStore, MessageStore};

pub fn subject(id: &str) -> SubjectId {
	SubjectId::new(id).expect("valid subject")
}

/// Reader fed from a channel. Dropping the sender reads as a clean close.
pub struct ScriptedReader {
	rx: mpsc::UnboundedReceiver<Received>,
}

pub fn scripted_reader() -> (mpsc::UnboundedSender<Received>, ScriptedReader) {
	let (tx, rx) = mpsc::unbounded_channel();
	(tx, ScriptedReader { rx })
}

pub fn text(payload: &str) -> Received {
	Received::Text(payload.to_string())
}

#[async_trait::async_trait]
impl ConnectionReader for ScriptedReader {
	async fn receive(&mut self) -> Received {
		self.rx.recv().await.unwrap_or(Received::Closed)
	}
}

/// Observable state of a [`RecordingWriter`].
#[derive(Clone, Default)]
pub struct WriterProbe {
	pub fail_sends: Arc<AtomicBool>,
	pub closed: Arc<AtomicBool>,
	pub pings: Arc<AtomicUsize>,
}

/// Writer that forwards every frame, decoded, to a test channel.
pub struct RecordingWriter {
	tx: mpsc::UnboundedSender<WireMessage>,
	probe: WriterProbe,
}

pub fn recording_writer() -> (RecordingWriter, mpsc::UnboundedReceiver<WireMessage>, WriterProbe) {
	let (tx, rx) = mpsc::unbounded_channel();
	let probe = WriterProbe::default();
	(
		RecordingWriter {
			tx,
			probe: probe.clone(),
		},
		rx,
		probe,
	)
}

#[async_trait::async_trait]
impl ConnectionWriter for RecordingWriter {
	async fn send(&mut self, frame: OutboundFrame) -> anyhow::Result<()> {
		if self.probe.fail_sends.load(Ordering::SeqCst) {
			return Err(anyhow!("peer went away"));
		}
		let wire: WireMessage = serde_json::from_str(&frame)?;
		self.tx.send(wire).map_err(|_| anyhow!("test receiver dropped"))
	}

	async fn ping(&mut self) -> anyhow::Result<()> {
		self.probe.pings.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn close(&mut self) {
		self.probe.closed.store(true, Ordering::SeqCst);
	}
}

/// Writer whose sends never complete, simulating a client that stopped reading.
pub struct StalledWriter;

#[async_trait::async_trait]
impl ConnectionWriter for StalledWriter {
	async fn send(&mut self, _frame: OutboundFrame) -> anyhow::Result<()> {
		std::future::pending::<()>().await;
		Ok(())
	}

	async fn ping(&mut self) -> anyhow::Result<()> {
		Ok(())
	}

	async fn close(&mut self) {}
}

/// Writer whose sends each wait for a permit on `gate`.
pub struct GatedWriter {
	gate: Arc<Semaphore>,
	probe: GateProbe,
}

#[derive(Clone, Default)]
pub struct GateProbe {
	/// Sends that reached the writer, including ones still waiting on the gate.
	pub started: Arc<AtomicUsize>,
	pub closed: Arc<AtomicBool>,
}

pub fn gated_writer() -> (GatedWriter, Arc<Semaphore>, GateProbe) {
	let gate = Arc::new(Semaphore::new(0));
	let probe = GateProbe::default();
	(
		GatedWriter {
			gate: Arc::clone(&gate),
			probe: probe.clone(),
		},
		gate,
		probe,
	)
}

#[async_trait::async_trait]
impl ConnectionWriter for GatedWriter {
	async fn send(&mut self, _frame: OutboundFrame) -> anyhow::Result<()> {
		self.probe.started.fetch_add(1, Ordering::SeqCst);
		let _permit = self.gate.acquire().await.map_err(|_| anyhow!("gate closed"))?;
		Ok(())
	}

	async fn ping(&mut self) -> anyhow::Result<()> {
		Ok(())
	}

	async fn close(&mut self) {
		self.probe.closed.store(true, Ordering::SeqCst);
	}
}

/// Wait until `cond` holds, polling every few milliseconds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
	timeout(Duration::from_millis(500), async {
		while !cond() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

pub async fn next_wire(rx: &mut mpsc::UnboundedReceiver<WireMessage>) -> WireMessage {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected a frame within timeout")
		.expect("writer channel open")
}

pub async fn assert_no_wire(rx: &mut mpsc::UnboundedReceiver<WireMessage>) {
	let got = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(
		!matches!(got, Ok(Some(_))),
		"connection unexpectedly received a frame: {got:?}"
	);
}

pub async fn snapshot(hub: &RelayHub) -> HubSnapshot {
	hub.snapshot().await.expect("hub running")
}

/// Poll the registry until `pred` holds or the deadline passes.
pub async fn wait_for_registry(hub: &RelayHub, pred: impl Fn(&HubSnapshot) -> bool) -> HubSnapshot {
	let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
	loop {
		let snap = snapshot(hub).await;
		if pred(&snap) {
			return snap;
		}
		assert!(
			tokio::time::Instant::now() < deadline,
			"registry never reached expected state: {snap:?}"
		);
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}

/// Fixed profile table.
#[derive(Default)]
pub struct StaticProfiles(pub HashMap<SubjectId, Profile>);

impl StaticProfiles {
	pub fn with(mut self, id: &str, login: &str, avatar: &str) -> Self {
		self.0
			.insert(subject(id), Profile::new(Some(login.to_string()), Some(avatar.to_string())));
		self
	}
}

#[async_trait::async_trait]
impl ProfileLookup for StaticProfiles {
	async fn fetch_profiles(&self, subjects: &BTreeSet<SubjectId>) -> anyhow::Result<HashMap<SubjectId, Profile>> {
		Ok(subjects
			.iter()
			.filter_map(|s| self.0.get(s).map(|p| (s.clone(), p.clone())))
			.collect())
	}
}

pub struct FailingProfiles;

#[async_trait::async_trait]
impl ProfileLookup for FailingProfiles {
	async fn fetch_profiles(&self, _: &BTreeSet<SubjectId>) -> anyhow::Result<HashMap<SubjectId, Profile>> {
		Err(anyhow!("profile service unavailable"))
	}
}

/// Memory store whose first `fail_appends` appends error out, and whose reads can be made to fail or stall.
#[derive(Default)]
pub struct FlakyStore {
	pub inner: MemoryMessageStore,
	pub fail_appends: AtomicUsize,
	pub fail_reads: AtomicBool,
	pub stall: AtomicBool,
}

impl FlakyStore {
	pub fn failing_first(n: usize) -> Self {
		Self {
			fail_appends: AtomicUsize::new(n),
			..Self::default()
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for FlakyStore {
	async fn append(&self, message: &Message) -> anyhow::Result<MessageId> {
		if self.stall.load(Ordering::SeqCst) {
			std::future::pending::<()>().await;
		}
		let remaining = self.fail_appends.load(Ordering::SeqCst);
		if remaining > 0 {
			self.fail_appends.store(remaining - 1, Ordering::SeqCst);
			return Err(anyhow!("store unavailable"));
		}
		self.inner.append(message).await
	}

	async fn list_recent(&self, limit: usize) -> anyhow::Result<Vec<Message>> {
		if self.stall.load(Ordering::SeqCst) {
			std::future::pending::<()>().await;
		}
		if self.fail_reads.load(Ordering::SeqCst) {
			return Err(anyhow!("store unavailable"));
		}
		self.inner.list_recent(limit).await
	}
}
