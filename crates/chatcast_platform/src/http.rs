#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng as _;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_USER_AGENTS: &[&str] = &[
	"Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
	"Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
	"Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
	"Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0",
	"Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Outcome taxonomy for upstream fetches.
///
/// `NotFound` is a confirmed negative (cacheable), `Blocked` is terminal for
/// the attempt and callers fall through to their next strategy, `Transient`
/// is a missed cache-population opportunity.
#[derive(Debug, Error)]
pub enum FetchError {
	#[error("not found")]
	NotFound,
	#[error("blocked: status={0}")]
	Blocked(StatusCode),
	#[error("transient: {0}")]
	Transient(String),
}

impl FetchError {
	pub fn from_status(status: StatusCode) -> Self {
		match status {
			StatusCode::NOT_FOUND => FetchError::NotFound,
			StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED | StatusCode::TOO_MANY_REQUESTS => {
				FetchError::Blocked(status)
			}
			other => FetchError::Transient(format!("status={other}")),
		}
	}
}

/// Configuration for the shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
	/// Optional outbound proxy URL (http(s)://...).
	pub proxy_url: Option<String>,
	pub timeout: Duration,
	/// User agents rotated per request against anti-bot-sensitive endpoints.
	pub user_agents: Vec<String>,
}

impl Default for HttpClientConfig {
	fn default() -> Self {
		Self {
			proxy_url: None,
			timeout: DEFAULT_TIMEOUT,
			user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
		}
	}
}

/// Shared outbound HTTP collaborator.
///
/// All REST/GraphQL traffic in the process flows through one of these; proxy
/// and header shaping live here so individual services stay transport-naive.
#[derive(Debug, Clone)]
pub struct HttpClient {
	client: reqwest::Client,
	user_agents: Vec<String>,
}

impl HttpClient {
	pub fn new(cfg: HttpClientConfig) -> anyhow::Result<Self> {
		let mut builder = reqwest::Client::builder().timeout(cfg.timeout);
		if let Some(proxy_url) = cfg.proxy_url.as_deref() {
			builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
			info!(proxy = %proxy_url, "http client configured with proxy");
		}
		Ok(Self {
			client: builder.build()?,
			user_agents: cfg.user_agents,
		})
	}

	/// Client with default configuration; infallible.
	pub fn with_defaults() -> Self {
		Self {
			client: reqwest::Client::new(),
			user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
		}
	}

	pub fn random_user_agent(&self) -> &str {
		if self.user_agents.is_empty() {
			return DEFAULT_USER_AGENTS[0];
		}
		let idx = rand::thread_rng().gen_range(0..self.user_agents.len());
		&self.user_agents[idx]
	}

	/// GET a JSON document with browser-like headers.
	pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
		let resp = self
			.browser_request(url)
			.header("Accept", "application/json, text/plain, */*")
			.send()
			.await
			.map_err(|e| FetchError::Transient(e.to_string()))?;

		let status = resp.status();
		if !status.is_success() {
			debug!(%url, %status, "json fetch failed");
			return Err(FetchError::from_status(status));
		}

		resp.json::<T>().await.map_err(|e| FetchError::Transient(e.to_string()))
	}

	/// GET a page body with browser-like headers.
	pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
		let resp = self
			.browser_request(url)
			.header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
			.send()
			.await
			.map_err(|e| FetchError::Transient(e.to_string()))?;

		let status = resp.status();
		if !status.is_success() {
			debug!(%url, %status, "page fetch failed");
			return Err(FetchError::from_status(status));
		}

		resp.text().await.map_err(|e| FetchError::Transient(e.to_string()))
	}

	/// POST a JSON body and decode a JSON response.
	pub async fn post_json<B: serde::Serialize, T: DeserializeOwned>(
		&self,
		url: &str,
		body: &B,
	) -> Result<T, FetchError> {
		let resp = self
			.client
			.post(url)
			.header("User-Agent", self.random_user_agent().to_string())
			.header("Content-Type", "application/json")
			.header("Accept", "application/json")
			.json(body)
			.send()
			.await
			.map_err(|e| FetchError::Transient(e.to_string()))?;

		let status = resp.status();
		if !status.is_success() {
			debug!(%url, %status, "json post failed");
			return Err(FetchError::from_status(status));
		}

		resp.json::<T>().await.map_err(|e| FetchError::Transient(e.to_string()))
	}

	fn browser_request(&self, url: &str) -> reqwest::RequestBuilder {
		self.client
			.get(url)
			.header("User-Agent", self.random_user_agent().to_string())
			.header("Accept-Language", "en-US,en;q=0.9")
			.header("Cache-Control", "no-cache")
			.header("Pragma", "no-cache")
			.header("DNT", "1")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_taxonomy() {
		assert!(matches!(FetchError::from_status(StatusCode::NOT_FOUND), FetchError::NotFound));
		assert!(matches!(
			FetchError::from_status(StatusCode::FORBIDDEN),
			FetchError::Blocked(StatusCode::FORBIDDEN)
		));
		assert!(matches!(
			FetchError::from_status(StatusCode::BAD_GATEWAY),
			FetchError::Transient(_)
		));
	}

	#[test]
	fn user_agent_rotation_stays_in_pool() {
		let client = HttpClient::with_defaults();
		for _ in 0..32 {
			let ua = client.random_user_agent();
			assert!(DEFAULT_USER_AGENTS.contains(&ua));
		}
	}
}
