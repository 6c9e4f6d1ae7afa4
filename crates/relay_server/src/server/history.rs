#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use relay_domain::{Message, SubjectId};
use thiserror::Error;

use crate::server::profiles::{ProfileLookup, lookup_best_effort};
use crate::server::store::MessageStore;

/// Fixed page size for the history endpoint.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum HistoryError {
	#[error("message store did not answer within {0:?}")]
	Timeout(Duration),
	#[error("message store query failed: {0:#}")]
	Store(anyhow::Error),
}

/// Recent messages with display metadata resolved at read time.
#[derive(Clone)]
pub struct HistoryService {
	store: Arc<dyn MessageStore>,
	profiles: Arc<dyn ProfileLookup>,
	list_timeout: Duration,
	profile_timeout: Duration,
}

impl HistoryService {
	pub fn new(
		store: Arc<dyn MessageStore>,
		profiles: Arc<dyn ProfileLookup>,
		list_timeout: Duration,
		profile_timeout: Duration,
	) -> Self {
		Self {
			store,
			profiles,
			list_timeout,
			profile_timeout,
		}
	}

	/// Up to [`HISTORY_LIMIT`] messages, newest first.
	///
	/// A failed profile lookup does not fail the request; messages just come
	/// back without display fields.
	pub async fn load_history(&self) -> Result<Vec<Message>, HistoryError> {
		let mut messages = tokio::time::timeout(self.list_timeout, self.store.list_recent(HISTORY_LIMIT))
			.await
			.map_err(|_| HistoryError::Timeout(self.list_timeout))?
			.map_err(HistoryError::Store)?;
		messages.truncate(HISTORY_LIMIT);

		let subjects: BTreeSet<SubjectId> = messages.iter().filter_map(|m| m.subject_id.clone()).collect();
		let profiles = lookup_best_effort(self.profiles.as_ref(), &subjects, self.profile_timeout).await;

		for message in &mut messages {
			message.clear_display();
			if let Some(profile) = message.subject_id.as_ref().and_then(|s| profiles.get(s)) {
				message.apply_profile(profile);
			}
		}

		Ok(messages)
	}
}
