#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// Readiness flag flipped once the store and hub are up.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Answers `/healthz` and `/readyz`; any other path yields `None`.
pub fn health_response(path: &str, state: &HealthState) -> Option<Response<Full<Bytes>>> {
	let (status, body): (StatusCode, &'static [u8]) = match path {
		"/healthz" => (StatusCode::OK, b"ok"),
		"/readyz" if state.is_ready() => (StatusCode::OK, b"ready"),
		"/readyz" => (StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		_ => return None,
	};

	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	Some(resp)
}
