#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_WS_ROUTE: &str = "/ws";
pub const DEFAULT_MESSAGE_ROUTE: &str = "/api/messages";
pub const DEFAULT_AUTH_COOKIE: &str = "session_token";

/// Default config path: `~/.relay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".relay").join("config.toml"))
}

/// Load the server config from TOML and process env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.normalize();

	Ok(cfg)
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

/// Relay server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub routes: RouteSettings,
	pub persistence: PersistenceSettings,
	pub auth: AuthSettings,
	pub profiles: ProfileSettings,
	pub hub: HubSettings,
}

/// Listener settings.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// HTTP listen address (host:port).
	pub bind: Option<String>,
	/// PEM-encoded certificate chain path for HTTPS/WSS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for HTTPS/WSS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// HTTP route paths.
#[derive(Debug, Clone)]
pub struct RouteSettings {
	pub ws_route: String,
	pub message_route: String,
}

impl Default for RouteSettings {
	fn default() -> Self {
		Self {
			ws_route: DEFAULT_WS_ROUTE.to_string(),
			message_route: DEFAULT_MESSAGE_ROUTE.to_string(),
		}
	}
}

/// Message store settings.
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Database URL (sqlite:, postgres:, mysql:). `None` keeps messages in memory.
	pub database_url: Option<String>,
	/// Upper bound for a single append.
	pub append_timeout: Duration,
	/// Upper bound for a history read.
	pub list_timeout: Duration,
	/// Append a "Server started!" message at boot.
	pub announce_startup: bool,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			append_timeout: Duration::from_secs(10),
			list_timeout: Duration::from_secs(2),
			announce_startup: true,
		}
	}
}

/// Identity resolution settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// HMAC secret for stateless access tokens. `None` means every connection is anonymous.
	pub hmac_secret: Option<SecretString>,
	/// Cookie consulted when no bearer token or `token` query parameter is present.
	pub cookie_name: String,
	pub resolve_timeout: Duration,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			hmac_secret: None,
			cookie_name: DEFAULT_AUTH_COOKIE.to_string(),
			resolve_timeout: Duration::from_secs(2),
		}
	}
}

/// Profile service settings.
#[derive(Debug, Clone)]
pub struct ProfileSettings {
	pub base_url: Option<String>,
	pub timeout: Duration,
}

impl Default for ProfileSettings {
	fn default() -> Self {
		Self {
			base_url: None,
			timeout: Duration::from_secs(2),
		}
	}
}

/// Relay hub tuning.
#[derive(Debug, Clone)]
pub struct HubSettings {
	pub message_queue_capacity: usize,
	pub control_queue_capacity: usize,
	pub outbound_queue_capacity: usize,
	pub echo_to_sender: bool,
	/// `None` disables pings.
	pub ping_interval: Option<Duration>,
	/// `None` disables idle eviction.
	pub idle_timeout: Option<Duration>,
	pub max_message_bytes: usize,
}

impl Default for HubSettings {
	fn default() -> Self {
		Self {
			message_queue_capacity: 1024,
			control_queue_capacity: 1024,
			outbound_queue_capacity: 256,
			echo_to_sender: true,
			ping_interval: Some(Duration::from_secs(30)),
			idle_timeout: Some(Duration::from_secs(90)),
			max_message_bytes: 64 * 1024,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	routes: FileRouteSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	profiles: FileProfileSettings,

	#[serde(default)]
	hub: FileHubSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRouteSettings {
	ws_route: Option<String>,
	message_route: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	append_timeout_ms: Option<u64>,
	list_timeout_ms: Option<u64>,
	announce_startup: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	hmac_secret: Option<String>,
	cookie_name: Option<String>,
	resolve_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileProfileSettings {
	base_url: Option<String>,
	timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubSettings {
	message_queue_capacity: Option<usize>,
	control_queue_capacity: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	echo_to_sender: Option<bool>,
	ping_interval_secs: Option<u64>,
	idle_timeout_secs: Option<u64>,
	max_message_bytes: Option<usize>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn secs_or_disabled(v: Option<u64>, default: Option<Duration>) -> Option<Duration> {
	match v {
		Some(0) => None,
		Some(secs) => Some(Duration::from_secs(secs)),
		None => default,
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let persistence_defaults = PersistenceSettings::default();
		let auth_defaults = AuthSettings::default();
		let profile_defaults = ProfileSettings::default();
		let hub_defaults = HubSettings::default();

		Self {
			server: ServerSettings {
				bind: non_blank(file.server.bind),
				tls_cert_path: non_blank(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_blank(file.server.metrics_bind),
			},
			routes: RouteSettings {
				ws_route: non_blank(file.routes.ws_route).unwrap_or_else(|| DEFAULT_WS_ROUTE.to_string()),
				message_route: non_blank(file.routes.message_route).unwrap_or_else(|| DEFAULT_MESSAGE_ROUTE.to_string()),
			},
			persistence: PersistenceSettings {
				database_url: non_blank(file.persistence.database_url),
				append_timeout: file
					.persistence
					.append_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(persistence_defaults.append_timeout),
				list_timeout: file
					.persistence
					.list_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(persistence_defaults.list_timeout),
				announce_startup: file
					.persistence
					.announce_startup
					.unwrap_or(persistence_defaults.announce_startup),
			},
			auth: AuthSettings {
				hmac_secret: non_blank(file.auth.hmac_secret).map(SecretString::new),
				cookie_name: non_blank(file.auth.cookie_name).unwrap_or(auth_defaults.cookie_name),
				resolve_timeout: file
					.auth
					.resolve_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(auth_defaults.resolve_timeout),
			},
			profiles: ProfileSettings {
				base_url: non_blank(file.profiles.base_url),
				timeout: file
					.profiles
					.timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(profile_defaults.timeout),
			},
			hub: HubSettings {
				message_queue_capacity: file
					.hub
					.message_queue_capacity
					.unwrap_or(hub_defaults.message_queue_capacity),
				control_queue_capacity: file
					.hub
					.control_queue_capacity
					.unwrap_or(hub_defaults.control_queue_capacity),
				outbound_queue_capacity: file
					.hub
					.outbound_queue_capacity
					.unwrap_or(hub_defaults.outbound_queue_capacity),
				echo_to_sender: file.hub.echo_to_sender.unwrap_or(hub_defaults.echo_to_sender),
				ping_interval: secs_or_disabled(file.hub.ping_interval_secs, hub_defaults.ping_interval),
				idle_timeout: secs_or_disabled(file.hub.idle_timeout_secs, hub_defaults.idle_timeout),
				max_message_bytes: file.hub.max_message_bytes.unwrap_or(hub_defaults.max_message_bytes),
			},
		}
	}

	/// Repair values that would wedge the server instead of refusing to start.
	fn normalize(&mut self) {
		for route in [&mut self.routes.ws_route, &mut self.routes.message_route] {
			if !route.starts_with('/') {
				*route = format!("/{route}");
			}
		}

		if self.routes.ws_route == self.routes.message_route {
			warn!(
				route = %self.routes.ws_route,
				"routes: ws_route and message_route collide; using defaults"
			);
			self.routes = RouteSettings::default();
		}

		for (name, cap) in [
			("message_queue_capacity", &mut self.hub.message_queue_capacity),
			("control_queue_capacity", &mut self.hub.control_queue_capacity),
			("outbound_queue_capacity", &mut self.hub.outbound_queue_capacity),
		] {
			if *cap == 0 {
				warn!(setting = name, "hub config: zero capacity is invalid; using 1");
				*cap = 1;
			}
		}

		if let (Some(ping), Some(idle)) = (self.hub.ping_interval, self.hub.idle_timeout)
			&& idle <= ping
		{
			warn!(
				ping_secs = ping.as_secs(),
				idle_secs = idle.as_secs(),
				"hub config: idle_timeout <= ping_interval; live clients may be evicted"
			);
		}

		if self.server.tls_cert_path.is_some() != self.server.tls_key_path.is_some() {
			warn!("server config: tls_cert_path and tls_key_path must both be set; serving plain TCP");
			self.server.tls_cert_path = None;
			self.server.tls_key_path = None;
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| non_blank(env(key));

	if let Some(v) = var("RELAY_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = var("RELAY_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = var("RELAY_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = var("RELAY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("RELAY_WS_ROUTE") {
		cfg.routes.ws_route = v;
		info!("routes: ws_route overridden by env");
	}

	if let Some(v) = var("RELAY_MESSAGE_ROUTE") {
		cfg.routes.message_route = v;
		info!("routes: message_route overridden by env");
	}

	if let Some(v) = var("RELAY_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = var("RELAY_ANNOUNCE_STARTUP")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.announce_startup = enabled;
		info!(enabled, "persistence: announce_startup overridden by env");
	}

	if let Some(v) = var("RELAY_AUTH_HMAC_SECRET") {
		cfg.auth.hmac_secret = Some(SecretString::new(v));
		info!("auth: hmac_secret overridden by env");
	}

	if let Some(v) = var("RELAY_PROFILES_BASE_URL") {
		cfg.profiles.base_url = Some(v);
		info!("profiles: base_url overridden by env");
	}

	if let Some(v) = var("RELAY_ECHO_TO_SENDER")
		&& let Some(echo) = parse_env_bool(&v)
	{
		cfg.hub.echo_to_sender = echo;
		info!(echo, "hub config: echo_to_sender overridden by env");
	}

	if let Some(v) = var("RELAY_PING_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.hub.ping_interval = secs_or_disabled(Some(secs), None);
		info!(secs, "hub config: ping_interval overridden by env");
	}

	if let Some(v) = var("RELAY_IDLE_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.hub.idle_timeout = secs_or_disabled(Some(secs), None);
		info!(secs, "hub config: idle_timeout overridden by env");
	}

	if cfg.auth.hmac_secret.is_none() {
		warn!("auth: no hmac_secret configured; all connections will be anonymous");
	}
}
