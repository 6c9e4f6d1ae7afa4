#![forbid(unsafe_code)]

//! JSON shapes exchanged with browser clients.

use serde::{Deserialize, Serialize};

use crate::{Message, PersistedMessage};

/// What a client sends over the socket. Every other field is ignored; the
/// server fills in identity itself.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
	pub text: String,
}

/// Outbound message shape, shared by the socket fan-out and the history endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub login: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub uid: Option<String>,
	pub text: String,
}

impl From<&Message> for WireMessage {
	fn from(m: &Message) -> Self {
		Self {
			id: m.id.as_ref().map(|id| id.as_str().to_string()),
			login: m.display_name.clone(),
			avatar: m.avatar_ref.clone(),
			uid: m.subject_id.as_ref().map(|s| s.as_str().to_string()),
			text: m.text.clone(),
		}
	}
}

impl From<&PersistedMessage> for WireMessage {
	fn from(m: &PersistedMessage) -> Self {
		let mut wire = WireMessage::from(m.message());
		wire.id = Some(m.id().as_str().to_string());
		wire
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
	Success,
	Error,
}

/// Body of the history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
	pub status: HistoryStatus,
	pub payload: Vec<WireMessage>,
}

impl HistoryResponse {
	pub fn success(messages: &[Message]) -> Self {
		Self {
			status: HistoryStatus::Success,
			payload: messages.iter().map(WireMessage::from).collect(),
		}
	}

	pub fn error() -> Self {
		Self {
			status: HistoryStatus::Error,
			payload: Vec::new(),
		}
	}
}
