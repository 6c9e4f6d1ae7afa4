#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{Context, anyhow};
use relay_domain::{Profile, SubjectId};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Batch lookup of display metadata. Unknown subjects are simply absent from the result.
#[async_trait::async_trait]
pub trait ProfileLookup: Send + Sync {
	async fn fetch_profiles(&self, subjects: &BTreeSet<SubjectId>) -> anyhow::Result<HashMap<SubjectId, Profile>>;
}

/// Used when no profile service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProfileLookup;

#[async_trait::async_trait]
impl ProfileLookup for NoProfileLookup {
	async fn fetch_profiles(&self, _subjects: &BTreeSet<SubjectId>) -> anyhow::Result<HashMap<SubjectId, Profile>> {
		Ok(HashMap::new())
	}
}

/// Client for a profile service exposing `POST {base}/profiles/batch`.
#[derive(Debug, Clone)]
pub struct HttpProfileLookup {
	base_url: String,
	client: reqwest::Client,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
	uids: Vec<&'a str>,
}

#[derive(Deserialize)]
struct BatchResponse {
	#[serde(default)]
	profiles: Vec<ProfileRow>,
}

#[derive(Deserialize)]
struct ProfileRow {
	uid: String,
	#[serde(default)]
	login: Option<String>,
	#[serde(default)]
	avatar: Option<String>,
}

impl HttpProfileLookup {
	pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.context("build profile http client")?;
		Ok(Self {
			base_url: base_url.into(),
			client,
		})
	}
}

#[async_trait::async_trait]
impl ProfileLookup for HttpProfileLookup {
	async fn fetch_profiles(&self, subjects: &BTreeSet<SubjectId>) -> anyhow::Result<HashMap<SubjectId, Profile>> {
		if subjects.is_empty() {
			return Ok(HashMap::new());
		}

		let url = format!("{}/profiles/batch", self.base_url.trim_end_matches('/'));
		let body = BatchRequest {
			uids: subjects.iter().map(SubjectId::as_str).collect(),
		};

		let resp = self
			.client
			.post(url)
			.json(&body)
			.send()
			.await
			.context("profile batch lookup")?;

		let status = resp.status();
		if !status.is_success() {
			return Err(anyhow!("profile batch lookup failed: status={}", status));
		}

		let parsed: BatchResponse = resp.json().await.context("decode profile batch")?;
		Ok(parsed
			.profiles
			.into_iter()
			.filter_map(|row| {
				let subject = SubjectId::new(row.uid).ok()?;
				subjects
					.contains(&subject)
					.then(|| (subject, Profile::new(row.login, row.avatar)))
			})
			.collect())
	}
}

/// Lookup that never fails: errors and timeouts produce an empty map.
pub async fn lookup_best_effort(
	lookup: &dyn ProfileLookup,
	subjects: &BTreeSet<SubjectId>,
	limit: Duration,
) -> HashMap<SubjectId, Profile> {
	if subjects.is_empty() {
		return HashMap::new();
	}

	match tokio::time::timeout(limit, lookup.fetch_profiles(subjects)).await {
		Ok(Ok(found)) => found,
		Ok(Err(e)) => {
			warn!(error = %e, subjects = subjects.len(), "profile lookup failed");
			metrics::counter!("relay_server_profile_lookup_failures_total").increment(1);
			HashMap::new()
		}
		Err(_) => {
			warn!(subjects = subjects.len(), timeout_ms = limit.as_millis() as u64, "profile lookup timed out");
			metrics::counter!("relay_server_profile_lookup_failures_total").increment(1);
			HashMap::new()
		}
	}
}
