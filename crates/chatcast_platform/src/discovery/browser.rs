#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chatcast_domain::ChannelName;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The single capability the headless-browser collaborator exposes: render
/// the channel page and attempt to recover the internal chatroom identifier.
///
/// Automation internals (navigation, script injection) live behind this
/// trait; the process injects an implementation or runs without one.
#[async_trait]
pub trait BrowserProbe: Send + Sync {
	/// One-time session setup (launch, warm-up navigation). Called at most
	/// once per process before the first extraction.
	async fn initialize(&self) -> anyhow::Result<()>;

	/// Extract the chatroom id from a rendered channel page.
	async fn extract_chatroom_id(&self, channel: &ChannelName) -> anyhow::Result<Option<String>>;

	/// Release the session.
	async fn close(&self);
}

/// Scarce singleton handle around the injected probe.
///
/// At most one browser session exists per process: initialization is lazy on
/// first use, shared across discovery attempts, and released explicitly on
/// shutdown. A failed initialization is retried on the next attempt.
pub struct BrowserSession {
	probe: Option<Arc<dyn BrowserProbe>>,
	initialized: Mutex<bool>,
}

impl BrowserSession {
	pub fn new(probe: Arc<dyn BrowserProbe>) -> Self {
		Self {
			probe: Some(probe),
			initialized: Mutex::new(false),
		}
	}

	/// Session with no probe configured; every extraction attempt yields
	/// nothing and the discovery chain exhausts one strategy earlier.
	pub fn disabled() -> Self {
		Self {
			probe: None,
			initialized: Mutex::new(false),
		}
	}

	pub fn is_enabled(&self) -> bool {
		self.probe.is_some()
	}

	/// Attempt a browser extraction. Failures are log-only; the caller falls
	/// through.
	pub async fn extract_chatroom_id(&self, channel: &ChannelName) -> Option<String> {
		let probe = self.probe.as_ref()?;

		{
			let mut initialized = self.initialized.lock().await;
			if !*initialized {
				match probe.initialize().await {
					Ok(()) => {
						info!("browser session initialized");
						*initialized = true;
					}
					Err(err) => {
						warn!(error = %err, "browser session initialization failed");
						return None;
					}
				}
			}
		}

		metrics::counter!("chatcast_browser_extractions_total").increment(1);
		match probe.extract_chatroom_id(channel).await {
			Ok(Some(id)) => {
				info!(channel = %channel, id = %id, "browser extracted chatroom id");
				Some(id)
			}
			Ok(None) => {
				debug!(channel = %channel, "browser found no chatroom id");
				None
			}
			Err(err) => {
				warn!(channel = %channel, error = %err, "browser extraction failed");
				metrics::counter!("chatcast_browser_extraction_errors_total").increment(1);
				None
			}
		}
	}

	/// Release the underlying session, if one was ever initialized.
	pub async fn shutdown(&self) {
		let Some(probe) = self.probe.as_ref() else {
			return;
		};
		let mut initialized = self.initialized.lock().await;
		if *initialized {
			probe.close().await;
			*initialized = false;
			info!("browser session released");
		}
	}
}
