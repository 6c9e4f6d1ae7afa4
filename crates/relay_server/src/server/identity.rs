#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use hyper::header::{AUTHORIZATION, COOKIE};
use hyper::{HeaderMap, Uri};
use relay_domain::SubjectId;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Raw credential material carried by an upgrade request.
///
/// A bearer header wins over the `token` query parameter, which wins over the session cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
	pub bearer: Option<String>,
	pub query_token: Option<String>,
	pub cookie_token: Option<String>,
}

impl Credentials {
	pub fn from_request(headers: &HeaderMap, uri: &Uri, cookie_name: &str) -> Self {
		let bearer = headers
			.get(AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.strip_prefix("Bearer "))
			.map(str::trim)
			.filter(|v| !v.is_empty())
			.map(str::to_owned);

		let query_token = uri.query().and_then(|q| {
			url::form_urlencoded::parse(q.as_bytes())
				.find(|(k, _)| k == "token")
				.map(|(_, v)| v.into_owned())
				.filter(|v| !v.is_empty())
		});

		let cookie_token = headers
			.get_all(COOKIE)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.flat_map(|v| v.split(';'))
			.filter_map(|pair| pair.trim().split_once('='))
			.find(|(name, _)| *name == cookie_name)
			.map(|(_, value)| value.trim().to_owned())
			.filter(|v| !v.is_empty());

		Self {
			bearer,
			query_token,
			cookie_token,
		}
	}

	pub fn token(&self) -> Option<&str> {
		self.bearer
			.as_deref()
			.or(self.query_token.as_deref())
			.or(self.cookie_token.as_deref())
	}
}

/// Maps request credentials to a stable subject, or `None` for anonymous connections.
#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
	async fn resolve(&self, credentials: &Credentials) -> Option<SubjectId>;
}

/// Every connection is anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousResolver;

#[async_trait::async_trait]
impl IdentityResolver for AnonymousResolver {
	async fn resolve(&self, _credentials: &Credentials) -> Option<SubjectId> {
		None
	}
}

/// Verifies `v1.<payload>.<signature>` session tokens signed with a shared secret.
pub struct HmacIdentityResolver {
	secret: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionClaims {
	sub: String,
	exp: u64,
}

impl HmacIdentityResolver {
	pub fn new(secret: impl Into<Vec<u8>>) -> Self {
		Self { secret: secret.into() }
	}

	fn mac(&self) -> anyhow::Result<HmacSha256> {
		HmacSha256::new_from_slice(&self.secret).map_err(|e| anyhow!("invalid hmac key: {e}"))
	}

	pub fn verify(&self, token: &str) -> anyhow::Result<SubjectId> {
		let mut parts = token.split('.');
		let (Some("v1"), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(anyhow!("malformed session token"));
		};

		let signature = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;
		let mut mac = self.mac()?;
		mac.update(payload_b64.as_bytes());
		mac.verify_slice(&signature).map_err(|_| anyhow!("bad token signature"))?;

		let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
		let claims: SessionClaims = serde_json::from_slice(&payload).context("parse token claims")?;
		if claims.exp <= unix_now_secs() {
			return Err(anyhow!("session token expired"));
		}

		SubjectId::new(claims.sub).context("token subject")
	}

	#[cfg(test)]
	pub fn mint(&self, subject: &str, exp: u64) -> String {
		let payload = serde_json::json!({ "sub": subject, "exp": exp }).to_string();
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let mut mac = self.mac().expect("hmac key");
		mac.update(payload_b64.as_bytes());
		let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
		format!("v1.{payload_b64}.{sig}")
	}
}

#[async_trait::async_trait]
impl IdentityResolver for HmacIdentityResolver {
	async fn resolve(&self, credentials: &Credentials) -> Option<SubjectId> {
		let token = credentials.token()?;
		match self.verify(token) {
			Ok(subject) => Some(subject),
			Err(e) => {
				debug!(error = %e, "session token rejected; treating connection as anonymous");
				metrics::counter!("relay_server_identity_rejected_total").increment(1);
				None
			}
		}
	}
}

/// Resolve with a deadline. A slow resolver yields an anonymous connection rather than a stalled upgrade.
pub async fn resolve_with_timeout(
	resolver: &dyn IdentityResolver,
	credentials: &Credentials,
	limit: Duration,
) -> Option<SubjectId> {
	match tokio::time::timeout(limit, resolver.resolve(credentials)).await {
		Ok(subject) => subject,
		Err(_) => {
			debug!(timeout_ms = limit.as_millis() as u64, "identity resolution timed out");
			metrics::counter!("relay_server_identity_timeouts_total").increment(1);
			None
		}
	}
}

pub(crate) fn unix_now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
	use hyper::header::HeaderValue;

	use super::*;

	fn headers(pairs: &[(hyper::header::HeaderName, &str)]) -> HeaderMap {
		let mut h = HeaderMap::new();
		for (k, v) in pairs {
			h.append(k.clone(), HeaderValue::from_str(v).unwrap());
		}
		h
	}

	#[test]
	fn credentials_prefer_bearer_then_query_then_cookie() {
		let uri: Uri = "/ws?token=from-query".parse().unwrap();
		let h = headers(&[
			(AUTHORIZATION, "Bearer from-header"),
			(COOKIE, "a=1; session_token=from-cookie"),
		]);
		let creds = Credentials::from_request(&h, &uri, "session_token");
		assert_eq!(creds.token(), Some("from-header"));

		let creds = Credentials::from_request(&headers(&[(COOKIE, "session_token=from-cookie")]), &uri, "session_token");
		assert_eq!(creds.token(), Some("from-query"));

		let plain: Uri = "/ws".parse().unwrap();
		let creds = Credentials::from_request(
			&headers(&[(COOKIE, "other=x"), (COOKIE, "session_token=from-cookie")]),
			&plain,
			"session_token",
		);
		assert_eq!(creds.token(), Some("from-cookie"));

		let creds = Credentials::from_request(&HeaderMap::new(), &plain, "session_token");
		assert_eq!(creds.token(), None);
	}

	#[tokio::test]
	async fn hmac_resolver_accepts_valid_token() {
		let resolver = HmacIdentityResolver::new("s3cret");
		let token = resolver.mint("user-7", unix_now_secs() + 60);
		let creds = Credentials {
			bearer: Some(token),
			..Credentials::default()
		};
		let subject = resolver.resolve(&creds).await;
		assert_eq!(subject.as_ref().map(|s| s.as_str()), Some("user-7"));
	}

	#[tokio::test]
	async fn hmac_resolver_degrades_bad_tokens_to_anonymous() {
		let resolver = HmacIdentityResolver::new("s3cret");
		let other = HmacIdentityResolver::new("different");

		let expired = resolver.mint("u", unix_now_secs().saturating_sub(1));
		let forged = other.mint("u", unix_now_secs() + 60);
		for token in [expired, forged, "garbage".to_string(), "v1.a.b.c".to_string()] {
			let creds = Credentials {
				query_token: Some(token.clone()),
				..Credentials::default()
			};
			assert_eq!(resolver.resolve(&creds).await, None, "token {token} should be rejected");
		}

		assert_eq!(resolver.resolve(&Credentials::default()).await, None);
	}

	struct Stalled;

	#[async_trait::async_trait]
	impl IdentityResolver for Stalled {
		async fn resolve(&self, _credentials: &Credentials) -> Option<SubjectId> {
			tokio::time::sleep(Duration::from_secs(30)).await;
			SubjectId::new("late").ok()
		}
	}

	#[tokio::test]
	async fn slow_resolver_times_out_to_anonymous() {
		let subject = resolve_with_timeout(&Stalled, &Credentials::default(), Duration::from_millis(20)).await;
		assert_eq!(subject, None);
	}
}
