#![forbid(unsafe_code)]

pub mod wire;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Opaque identity resolved from connection credentials.
///
/// Absence of a `SubjectId` means the connection is anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
	/// Create a non-empty `SubjectId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for SubjectId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for SubjectId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SubjectId::new(s.to_string())
	}
}

/// Store-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
	/// Create a non-empty `MessageId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Registry key for one live connection. Assigned by the server, never by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(u64);

impl ConnectionKey {
	pub const fn new(raw: u64) -> Self {
		Self(raw)
	}
	pub const fn get(self) -> u64 {
		self.0
	}

	/// Parse the `conn-<n>` display form.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let raw = s
			.strip_prefix("conn-")
			.ok_or_else(|| ParseIdError::InvalidFormat("expected conn-<n>".into()))?;
		let raw = raw
			.parse::<u64>()
			.map_err(|_| ParseIdError::InvalidFormat(format!("not a connection number: {raw}")))?;
		Ok(Self(raw))
	}
}

impl fmt::Display for ConnectionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

impl FromStr for ConnectionKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConnectionKey::parse(s)
	}
}

/// Display metadata for a subject, as returned by the profile service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
	pub display_name: Option<String>,
	pub avatar_ref: Option<String>,
}

impl Profile {
	/// Build a profile, treating blank strings as missing.
	pub fn new(display_name: Option<String>, avatar_ref: Option<String>) -> Self {
		Self {
			display_name: display_name.filter(|s| !s.trim().is_empty()),
			avatar_ref: avatar_ref.filter(|s| !s.trim().is_empty()),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.display_name.is_none() && self.avatar_ref.is_none()
	}
}

/// A chat message as it moves through ingestion, storage and fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
	pub id: Option<MessageId>,
	pub subject_id: Option<SubjectId>,
	pub display_name: Option<String>,
	pub avatar_ref: Option<String>,
	pub text: String,
}

impl Message {
	/// A fresh, anonymous, unpersisted message.
	pub fn new(text: impl Into<String>) -> Self {
		Self {
			text: text.into(),
			..Self::default()
		}
	}

	/// Attach the sender's identity. Display fields are only copied for identified senders.
	pub fn stamp(&mut self, subject: Option<&SubjectId>, profile: Option<&Profile>) {
		self.subject_id = subject.cloned();
		self.clear_display();
		if self.subject_id.is_some()
			&& let Some(profile) = profile
		{
			self.apply_profile(profile);
		}
	}

	pub fn apply_profile(&mut self, profile: &Profile) {
		self.display_name = profile.display_name.clone();
		self.avatar_ref = profile.avatar_ref.clone();
	}

	pub fn clear_display(&mut self) {
		self.display_name = None;
		self.avatar_ref = None;
	}

	/// Seal the message with the id the store assigned to it.
	pub fn into_persisted(mut self, id: MessageId) -> PersistedMessage {
		self.id = Some(id.clone());
		PersistedMessage { id, body: self }
	}
}

/// A message the store has accepted. Only this type can be fanned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
	id: MessageId,
	body: Message,
}

impl PersistedMessage {
	pub fn id(&self) -> &MessageId {
		&self.id
	}
	pub fn message(&self) -> &Message {
		&self.body
	}
	pub fn into_message(self) -> Message {
		self.body
	}
}
