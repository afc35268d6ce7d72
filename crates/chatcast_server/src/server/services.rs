#![forbid(unsafe_code)]

use std::sync::Arc;

use chatcast_platform::assets::{BadgeResolver, CosmeticResolver, EmoteCatalog};
use chatcast_platform::discovery::{BrowserSession, IdentifierCache, IdentifierDiscovery};
use chatcast_platform::http::{HttpClient, HttpClientConfig};
use chatcast_platform::kick::KickMetadataClient;

/// Shared collaborator/resolver instances for one server process.
///
/// Everything with a cache lives here as explicit injected state, owned by
/// the construction scope rather than process-wide statics, so tests build
/// isolated instances per case.
pub struct Services {
	pub http: HttpClient,
	pub kick: KickMetadataClient,
	pub identifier_cache: Arc<IdentifierCache>,
	pub discovery: IdentifierDiscovery,
	pub badges: BadgeResolver,
	pub emotes: EmoteCatalog,
	pub cosmetics: CosmeticResolver,
	pub browser: Arc<BrowserSession>,
}

impl Services {
	/// Production wiring against the real Kick/7TV endpoints.
	pub fn new(http_cfg: HttpClientConfig, browser: Arc<BrowserSession>) -> anyhow::Result<Self> {
		let http = HttpClient::new(http_cfg)?;
		let kick = KickMetadataClient::new(http.clone());
		Ok(Self::from_parts(http, kick, browser, None))
	}

	/// Wiring with endpoint overrides, for tests.
	pub fn with_overrides(
		http: HttpClient,
		kick: KickMetadataClient,
		browser: Arc<BrowserSession>,
		seventv_base: Option<String>,
	) -> Self {
		Self::from_parts(http, kick, browser, seventv_base)
	}

	fn from_parts(
		http: HttpClient,
		kick: KickMetadataClient,
		browser: Arc<BrowserSession>,
		seventv_base: Option<String>,
	) -> Self {
		let identifier_cache = Arc::new(IdentifierCache::new());
		let discovery = IdentifierDiscovery::new(identifier_cache.clone(), kick.clone(), browser.clone());
		let badges = BadgeResolver::new(kick.clone());
		let (emotes, cosmetics) = match seventv_base {
			Some(base) => (
				EmoteCatalog::with_base_url(http.clone(), kick.clone(), base.clone()),
				CosmeticResolver::with_base_url(http.clone(), kick.clone(), base),
			),
			None => (
				EmoteCatalog::new(http.clone(), kick.clone()),
				CosmeticResolver::new(http.clone(), kick.clone()),
			),
		};

		Self {
			http,
			kick,
			identifier_cache,
			discovery,
			badges,
			emotes,
			cosmetics,
			browser,
		}
	}
}
