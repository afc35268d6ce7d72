#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use chatcast_platform::discovery::BrowserSession;
use chatcast_platform::http::HttpClientConfig;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::gateway::{AppState, build_router};
use crate::server::health::HealthState;
use crate::server::manager::{ConnectionManager, ManagerConfig};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::router::EnrichmentConfig;
use crate::server::services::Services;

const DEFAULT_BIND: &str = "127.0.0.1:3001";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatcast_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind   Gateway bind address (default: {DEFAULT_BIND})\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<String> {
	let mut bind = None;

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
				bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatcast_server=debug".to_string());
	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
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
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let arg_bind = parse_args();

	let config_path = config::default_config_path()?;
	let cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let bind = arg_bind
		.or(cfg.server.bind.clone())
		.unwrap_or_else(|| DEFAULT_BIND.to_string());

	let mut http_cfg = HttpClientConfig::default();
	if let Some(proxy) = cfg.http.proxy_url.clone() {
		http_cfg.proxy_url = Some(proxy);
	}
	if let Some(timeout) = cfg.http.timeout {
		http_cfg.timeout = timeout;
	}
	if !cfg.http.user_agents.is_empty() {
		http_cfg.user_agents = cfg.http.user_agents.clone();
	}

	// No headless-browser probe ships with the server; the discovery chain
	// runs one strategy shorter unless a deployment injects one.
	let browser = Arc::new(BrowserSession::disabled());
	let services = Arc::new(Services::new(http_cfg, browser)?);
	if let Some(enabled) = cfg.enrichment.cosmetics_enabled {
		services.cosmetics.set_enabled(enabled);
	}

	let mut manager_cfg = ManagerConfig::default();
	if let Some(ws_url) = cfg.pusher.ws_url.clone() {
		manager_cfg.pusher.ws_url = ws_url;
	}
	if let Some(window) = cfg.pusher.inactivity_window {
		manager_cfg.pusher.inactivity_window = window;
	}
	if let Some(timeout) = cfg.enrichment.cosmetic_timeout {
		manager_cfg.enrichment = EnrichmentConfig {
			cosmetic_timeout: timeout,
		};
	}

	let hub = RoomHub::new(RoomHubConfig::default());
	let manager = ConnectionManager::start(manager_cfg, services.clone(), hub.clone());
	let health = HealthState::new();

	let state = AppState {
		manager: manager.clone(),
		hub,
		services,
		health: health.clone(),
	};
	let app = build_router(state);

	let listener = tokio::net::TcpListener::bind(&bind).await?;
	info!(bind = %bind, "chatcast gateway listening");
	health.mark_ready();

	axum::serve(listener, app)
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
			info!("shutdown signal received");
		})
		.await?;

	manager.shutdown_all().await;
	info!("chatcast server stopped");
	Ok(())
}
