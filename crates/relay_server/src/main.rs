#![forbid(unsafe_code)]

mod config;
mod server;
mod tls;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{DEFAULT_BIND, ServerConfig};
use crate::server::health::HealthState;
use crate::server::history::HistoryService;
use crate::server::http::{AppState, serve};
use crate::server::hub::{HubConfig, RelayHub};
use crate::server::identity::{AnonymousResolver, HmacIdentityResolver, IdentityResolver};
use crate::server::ingest::IngestDeps;
use crate::server::profiles::{HttpProfileLookup, NoProfileLookup, ProfileLookup};
use crate::server::store::{MemoryMessageStore, MessageStore, SqlMessageStore, announce_startup};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Listen address (default: config file, then 127.0.0.1:8080)\n\
\t--config   Config file (default: ~/.relay/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct CliArgs {
	bind: Option<String>,
	config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs {
		bind: None,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	let Some(endpoint) = otlp_endpoint else {
		base.init();
		return;
	};

	use opentelemetry::global;
	use opentelemetry::trace::TracerProvider as _;
	use opentelemetry_otlp::WithExportConfig;

	match opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint.clone())
		.build()
	{
		Ok(exporter) => {
			let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
				.with_batch_exporter(exporter)
				.build();
			let tracer = tracer_provider.tracer("relay_server");
			global::set_tracer_provider(tracer_provider);

			base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
			info!(endpoint = %endpoint, "otlp tracing enabled");
		}
		Err(e) => {
			base.init();
			warn!(error = %e, "failed to initialize otlp tracing");
		}
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)"),
	}
}

async fn build_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn MessageStore>> {
	match cfg.persistence.database_url.as_deref() {
		Some(url) => {
			let store = SqlMessageStore::connect(url).await?;
			info!(dialect = store.dialect(), "message store connected");
			Ok(Arc::new(store))
		}
		None => {
			warn!("no database_url configured; messages are kept in memory only");
			Ok(Arc::new(MemoryMessageStore::default()))
		}
	}
}

fn build_identity(cfg: &ServerConfig) -> Arc<dyn IdentityResolver> {
	match cfg.auth.hmac_secret.as_ref() {
		Some(secret) => Arc::new(HmacIdentityResolver::new(secret.expose().as_bytes())),
		None => {
			info!("no auth secret configured; all connections are anonymous");
			Arc::new(AnonymousResolver)
		}
	}
}

fn build_profiles(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn ProfileLookup>> {
	let lookup: Arc<dyn ProfileLookup> = match cfg.profiles.base_url.as_deref() {
		Some(base_url) => {
			info!(%base_url, "profile lookups enabled");
			Arc::new(HttpProfileLookup::new(base_url, cfg.profiles.timeout)?)
		}
		None => Arc::new(NoProfileLookup),
	};
	Ok(lookup)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health = HealthState::new();
	let store = build_store(&server_cfg).await?;

	if server_cfg.persistence.announce_startup {
		match announce_startup(store.as_ref(), server_cfg.persistence.append_timeout).await {
			Ok(id) => info!(%id, "startup announcement stored"),
			Err(e) => warn!(error = %e, "failed to store startup announcement"),
		}
	}

	let profiles = build_profiles(&server_cfg)?;
	let hub = RelayHub::spawn(
		HubConfig::from_settings(&server_cfg.hub, server_cfg.profiles.timeout),
		Arc::clone(&profiles),
	);

	let state = Arc::new(AppState {
		routes: server_cfg.routes.clone(),
		ingest: IngestDeps {
			hub,
			store: Arc::clone(&store),
			append_timeout: server_cfg.persistence.append_timeout,
			idle_timeout: server_cfg.hub.idle_timeout,
		},
		history: HistoryService::new(
			store,
			profiles,
			server_cfg.persistence.list_timeout,
			server_cfg.profiles.timeout,
		),
		identity: build_identity(&server_cfg),
		cookie_name: server_cfg.auth.cookie_name.clone(),
		resolve_timeout: server_cfg.auth.resolve_timeout,
		max_message_bytes: server_cfg.hub.max_message_bytes,
		health: health.clone(),
	});

	let tls = match (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		(Some(cert_path), Some(key_path)) => {
			info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
			Some(crate::tls::load_tls_acceptor(cert_path, key_path)?)
		}
		_ => None,
	};

	let bind = args
		.bind
		.or_else(|| server_cfg.server.bind.clone())
		.unwrap_or_else(|| DEFAULT_BIND.to_string());
	let listener = TcpListener::bind(&bind).await.map_err(|e| anyhow::anyhow!("bind {bind}: {e}"))?;
	info!(
		%bind,
		ws_route = %state.routes.ws_route,
		message_route = %state.routes.message_route,
		"relay_server ready"
	);

	health.mark_ready();
	let hub = state.ingest.hub.clone();

	tokio::select! {
		res = serve(listener, tls, state) => res,
		_ = tokio::signal::ctrl_c() => {
			health.mark_not_ready();
			let open = hub.snapshot().await.unwrap_or_default();
			info!(
				connections = open.len(),
				identified = open.connections.iter().filter(|c| c.subject_id.is_some()).count(),
				"shutdown requested"
			);
			Ok(())
		}
	}
}
