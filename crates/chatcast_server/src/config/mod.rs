#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::debug;

/// Default config path: `~/.chatcast/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatcast").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

/// Server config.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub http: HttpSettings,
	pub pusher: PusherSettings,
	pub enrichment: EnrichmentSettings,
}

/// Process-level settings.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Gateway bind address (host:port).
	pub bind: Option<String>,
	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Outbound HTTP collaborator settings.
#[derive(Debug, Clone, Default)]
pub struct HttpSettings {
	/// Optional proxy URL for all upstream REST/GraphQL traffic.
	pub proxy_url: Option<String>,
	/// Request timeout.
	pub timeout: Option<Duration>,
	/// Override for the rotated user-agent pool.
	pub user_agents: Vec<String>,
}

/// Upstream broker settings.
#[derive(Debug, Clone, Default)]
pub struct PusherSettings {
	/// Full websocket URL override (testing/self-hosting).
	pub ws_url: Option<String>,
	/// Waiting window before an idle connection reports inactivity.
	pub inactivity_window: Option<Duration>,
}

/// Message enrichment settings.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentSettings {
	/// Bound on the per-message cosmetic lookup.
	pub cosmetic_timeout: Option<Duration>,
	/// 7TV cosmetics feature flag.
	pub cosmetics_enabled: Option<bool>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				bind: file.server.bind,
				metrics_bind: file.server.metrics_bind,
			},
			http: HttpSettings {
				proxy_url: file.http.proxy_url,
				timeout: file.http.timeout_secs.map(Duration::from_secs),
				user_agents: file.http.user_agents,
			},
			pusher: PusherSettings {
				ws_url: file.pusher.ws_url,
				inactivity_window: file.pusher.inactivity_window_secs.map(Duration::from_secs),
			},
			enrichment: EnrichmentSettings {
				cosmetic_timeout: file.enrichment.cosmetic_timeout_ms.map(Duration::from_millis),
				cosmetics_enabled: file.enrichment.cosmetics_enabled,
			},
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,
	#[serde(default)]
	http: FileHttpSettings,
	#[serde(default)]
	pusher: FilePusherSettings,
	#[serde(default)]
	enrichment: FileEnrichmentSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHttpSettings {
	proxy_url: Option<String>,
	timeout_secs: Option<u64>,
	#[serde(default)]
	user_agents: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePusherSettings {
	ws_url: Option<String>,
	inactivity_window_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEnrichmentSettings {
	cosmetic_timeout_ms: Option<u64>,
	cosmetics_enabled: Option<bool>,
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	if !path.exists() {
		debug!(path = %path.display(), "no config file; using defaults");
		return Ok(None);
	}
	let contents = fs::read_to_string(path)?;
	let cfg = toml::from_str(&contents).context("parse config toml")?;
	Ok(Some(cfg))
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(bind) = env_nonempty("CHATCAST_BIND") {
		cfg.server.bind = Some(bind);
	}
	if let Some(bind) = env_nonempty("CHATCAST_METRICS_BIND") {
		cfg.server.metrics_bind = Some(bind);
	}
	if let Some(proxy) = env_nonempty("CHATCAST_PROXY_URL").or_else(|| env_nonempty("PROXY_URL")) {
		cfg.http.proxy_url = Some(proxy);
	}
	if let Some(url) = env_nonempty("CHATCAST_PUSHER_WS_URL") {
		cfg.pusher.ws_url = Some(url);
	}
	if let Some(flag) = env_nonempty("CHATCAST_COSMETICS_ENABLED").or_else(|| env_nonempty("SEVENTV_ENABLED")) {
		cfg.enrichment.cosmetics_enabled = Some(flag != "false" && flag != "0");
	}
}

fn env_nonempty(key: &str) -> Option<String> {
	std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_full_config_file() {
		let toml = r#"
			[server]
			bind = "0.0.0.0:3001"
			metrics_bind = "127.0.0.1:9187"

			[http]
			proxy_url = "http://proxy.local:8080"
			timeout_secs = 20

			[pusher]
			inactivity_window_secs = 90

			[enrichment]
			cosmetic_timeout_ms = 800
			cosmetics_enabled = false
		"#;
		let file: FileConfig = toml::from_str(toml).unwrap();
		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.bind.as_deref(), Some("0.0.0.0:3001"));
		assert_eq!(cfg.http.timeout, Some(Duration::from_secs(20)));
		assert_eq!(cfg.pusher.inactivity_window, Some(Duration::from_secs(90)));
		assert_eq!(cfg.enrichment.cosmetic_timeout, Some(Duration::from_millis(800)));
		assert_eq!(cfg.enrichment.cosmetics_enabled, Some(false));
	}

	#[test]
	fn empty_file_yields_defaults() {
		let file: FileConfig = toml::from_str("").unwrap();
		let cfg = ServerConfig::from_file(file);
		assert!(cfg.server.bind.is_none());
		assert!(cfg.http.proxy_url.is_none());
	}
}
