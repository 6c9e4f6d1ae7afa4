#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use relay_domain::{Message, MessageId, SubjectId};
use tokio::sync::Mutex;

/// Durable append-only message log.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Persist `message` and return the id the store assigned to it.
	async fn append(&self, message: &Message) -> anyhow::Result<MessageId>;

	/// Up to `limit` messages, newest first.
	async fn list_recent(&self, limit: usize) -> anyhow::Result<Vec<Message>>;
}

/// Only the sender's identity and text are persisted; display metadata is resolved on read.
fn stored_copy(message: &Message, id: MessageId) -> Message {
	Message {
		id: Some(id),
		subject_id: message.subject_id.clone(),
		display_name: None,
		avatar_ref: None,
		text: message.text.clone(),
	}
}

/// Text of the message written once at boot when startup announcements are enabled.
pub const STARTUP_ANNOUNCEMENT: &str = "Server started!";

/// Append the anonymous startup marker.
pub async fn announce_startup(store: &dyn MessageStore, limit: Duration) -> anyhow::Result<MessageId> {
	tokio::time::timeout(limit, store.append(&Message::new(STARTUP_ANNOUNCEMENT)))
		.await
		.map_err(|_| anyhow!("startup announcement timed out after {limit:?}"))?
}

/// In-process store used when no database is configured.
pub struct MemoryMessageStore {
	log: Mutex<VecDeque<Message>>,
	capacity: usize,
}

impl MemoryMessageStore {
	pub const DEFAULT_CAPACITY: usize = 10_000;

	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			log: Mutex::new(VecDeque::new()),
			capacity: capacity.max(1),
		}
	}
}

impl Default for MemoryMessageStore {
	fn default() -> Self {
		Self::with_capacity(Self::DEFAULT_CAPACITY)
	}
}

#[async_trait::async_trait]
impl MessageStore for MemoryMessageStore {
	async fn append(&self, message: &Message) -> anyhow::Result<MessageId> {
		let id = MessageId::new(uuid::Uuid::new_v4().simple().to_string())?;
		let mut log = self.log.lock().await;
		log.push_back(stored_copy(message, id.clone()));
		while log.len() > self.capacity {
			log.pop_front();
		}
		Ok(id)
	}

	async fn list_recent(&self, limit: usize) -> anyhow::Result<Vec<Message>> {
		let log = self.log.lock().await;
		Ok(log.iter().rev().take(limit).cloned().collect())
	}
}

/// SQL-backed store (sqlite, postgres or mysql).
#[derive(Clone)]
pub struct SqlMessageStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

type MessageRow = (i64, Option<String>, String);

fn row_to_message((id, uid, text): MessageRow) -> anyhow::Result<Message> {
	Ok(Message {
		id: Some(MessageId::new(id.to_string())?),
		subject_id: uid.and_then(|u| SubjectId::new(u).ok()),
		display_name: None,
		avatar_ref: None,
		text,
	})
}

fn created_at_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or_default()
}

impl SqlMessageStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			SqlBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			SqlBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			SqlBackend::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"));
		};

		Ok(Self { backend })
	}

	pub fn dialect(&self) -> &'static str {
		match &self.backend {
			SqlBackend::Sqlite(_) => "sqlite",
			SqlBackend::Postgres(_) => "postgres",
			SqlBackend::Mysql(_) => "mysql",
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for SqlMessageStore {
	async fn append(&self, message: &Message) -> anyhow::Result<MessageId> {
		let uid = message.subject_id.as_ref().map(|s| s.as_str());
		let now = created_at_ms();

		let id: i64 = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("INSERT INTO chat_messages (uid, text, created_at_ms) VALUES (?, ?, ?)")
				.bind(uid)
				.bind(&message.text)
				.bind(now)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?
				.last_insert_rowid(),
			SqlBackend::Postgres(pool) => {
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO chat_messages (uid, text, created_at_ms) VALUES ($1, $2, $3) RETURNING id",
				)
				.bind(uid)
				.bind(&message.text)
				.bind(now)
				.fetch_one(pool)
				.await
				.context("insert message (postgres)")?;
				id
			}
			SqlBackend::Mysql(pool) => {
				let done = sqlx::query("INSERT INTO chat_messages (uid, text, created_at_ms) VALUES (?, ?, ?)")
					.bind(uid)
					.bind(&message.text)
					.bind(now)
					.execute(pool)
					.await
					.context("insert message (mysql)")?;
				i64::try_from(done.last_insert_id()).context("mysql insert id out of range")?
			}
		};

		MessageId::new(id.to_string()).map_err(Into::into)
	}

	async fn list_recent(&self, limit: usize) -> anyhow::Result<Vec<Message>> {
		let limit = i64::try_from(limit).unwrap_or(i64::MAX);

		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, uid, text FROM chat_messages ORDER BY id DESC LIMIT ?")
					.bind(limit)
					.fetch_all(pool)
					.await
					.context("select recent messages (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, uid, text FROM chat_messages ORDER BY id DESC LIMIT $1")
					.bind(limit)
					.fetch_all(pool)
					.await
					.context("select recent messages (postgres)")?
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query_as("SELECT id, uid, text FROM chat_messages ORDER BY id DESC LIMIT ?")
					.bind(limit)
					.fetch_all(pool)
					.await
					.context("select recent messages (mysql)")?
			}
		};

		rows.into_iter().map(row_to_message).collect()
	}
}

#[cfg(test)]
mod tests {
	use relay_domain::Profile;

	use super::*;

	fn identified(text: &str, uid: &str) -> Message {
		let mut m = Message::new(text);
		m.stamp(
			Some(&SubjectId::new(uid).unwrap()),
			Some(&Profile::new(Some("shown".into()), None)),
		);
		m
	}

	async fn exercise_store(store: &dyn MessageStore) {
		let a = store.append(&Message::new("a")).await.expect("append a");
		let b = store.append(&identified("b", "u1")).await.expect("append b");
		let c = store.append(&Message::new("c")).await.expect("append c");
		assert_ne!(a, b);
		assert_ne!(b, c);

		let recent = store.list_recent(2).await.expect("list");
		let texts: Vec<_> = recent.iter().map(|m| m.text.as_str()).collect();
		assert_eq!(texts, ["c", "b"]);
		assert_eq!(recent[0].id.as_ref(), Some(&c));
		assert_eq!(recent[1].id.as_ref(), Some(&b));
		assert_eq!(recent[1].subject_id.as_ref().map(|s| s.as_str()), Some("u1"));
		assert_eq!(recent[1].display_name, None, "display metadata is not persisted");

		let all = store.list_recent(50).await.expect("list all");
		assert_eq!(all.len(), 3);
	}

	#[tokio::test]
	async fn memory_store_lists_newest_first() {
		exercise_store(&MemoryMessageStore::default()).await;
	}

	#[tokio::test]
	async fn memory_store_trims_to_capacity() {
		let store = MemoryMessageStore::with_capacity(2);
		for t in ["1", "2", "3"] {
			store.append(&Message::new(t)).await.unwrap();
		}
		let recent = store.list_recent(10).await.unwrap();
		let texts: Vec<_> = recent.iter().map(|m| m.text.as_str()).collect();
		assert_eq!(texts, ["3", "2"]);
	}

	#[tokio::test]
	async fn sqlite_store_lists_newest_first() {
		let dir = tempfile::tempdir().expect("tempdir");
		let url = format!("sqlite://{}?mode=rwc", dir.path().join("relay.db").display());
		let store = SqlMessageStore::connect(&url).await.expect("connect sqlite");
		assert_eq!(store.dialect(), "sqlite");
		exercise_store(&store).await;
	}

	#[tokio::test]
	async fn startup_announcement_is_anonymous() {
		let store = MemoryMessageStore::default();
		let id = announce_startup(&store, Duration::from_secs(1)).await.expect("announce");
		let recent = store.list_recent(1).await.unwrap();
		assert_eq!(recent[0].id.as_ref(), Some(&id));
		assert_eq!(recent[0].text, STARTUP_ANNOUNCEMENT);
		assert_eq!(recent[0].subject_id, None);
	}

	#[tokio::test]
	async fn rejects_unknown_database_scheme() {
		let err = SqlMessageStore::connect("redis://localhost").await.err().expect("should fail");
		assert!(err.to_string().contains("unsupported database_url"));
	}
}
