//! Provider fetch strategies: cursor-paginated APIs and browser-driven galleries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gia_core::{IngestedImageRecord, SourceName, SourceRef, UnknownSource};
use gia_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;

mod browser;
mod civitai;
mod cursor;
mod html;
mod lexica;
mod midjourney;
mod prompthero;
mod scrape;

pub use browser::ChromiumLauncher;
pub use civitai::CivitaiFetcher;
pub use cursor::{walk_listing, ListingApi, ListingPage, PageToken};
pub use lexica::LexicaProfile;
pub use midjourney::MidjourneyProfile;
pub use prompthero::PromptHeroFetcher;
pub use scrape::{
    discover_detail_urls, verify_existence, visit_details, BrowserLauncher, BrowserSession,
    DiscoveryPolicy, ExistenceProbe, GalleryProfile, LaunchOptions, ScrapeFetcher, ScrollTarget,
};

pub const CRATE_NAME: &str = "gia-fetchers";

#[derive(Debug, Error)]
pub enum FetcherError {
    #[error(transparent)]
    UnknownSource(#[from] UnknownSource),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("browser: {0}")]
    Browser(String),
    #[error("timed out waiting for {selector}")]
    Timeout { selector: String },
    #[error("parse: {0}")]
    Parse(String),
}

/// One provider's retrieval strategy. A single call returns every record the
/// provider currently exposes within its freshness or discovery bound.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    fn source(&self) -> SourceRef;
    async fn fetch_all(&self) -> Result<Vec<IngestedImageRecord>, FetcherError>;
}

pub trait FetcherFactory: Send + Sync {
    fn create(&self, name: &str) -> Result<Box<dyn ImageFetcher>, FetcherError>;
    fn supported_sources(&self) -> Vec<String>;
}

/// Optional per-source tuning; anything left unset falls back to the provider default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceOverrides {
    pub staleness_hours: Option<u32>,
    pub discovery_target: Option<usize>,
    pub idle_limit: Option<u32>,
    pub headless: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceSettings {
    pub overrides: HashMap<SourceName, SourceOverrides>,
}

impl SourceSettings {
    pub fn for_source(&self, source: SourceName) -> SourceOverrides {
        self.overrides.get(&source).cloned().unwrap_or_default()
    }
}

const DEFAULT_STALENESS_HOURS: u32 = 24;

impl SourceOverrides {
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.staleness_hours.unwrap_or(DEFAULT_STALENESS_HOURS)))
    }

    pub fn apply_to(&self, mut policy: DiscoveryPolicy) -> DiscoveryPolicy {
        if let Some(target) = self.discovery_target {
            policy.target = Some(target);
        }
        if let Some(idle_limit) = self.idle_limit {
            policy.idle_limit = idle_limit.max(1);
        }
        policy
    }
}

/// Production factory: HTTP strategies share one client, scrape strategies
/// get a fresh browser session per fetch from the launcher.
pub struct ProviderFetcherFactory {
    http: Arc<HttpFetcher>,
    launcher: Arc<dyn BrowserLauncher>,
    settings: SourceSettings,
    ready_timeout: Duration,
}

impl ProviderFetcherFactory {
    pub fn new(http: Arc<HttpFetcher>, launcher: Arc<dyn BrowserLauncher>, settings: SourceSettings) -> Self {
        Self {
            http,
            launcher,
            settings,
            ready_timeout: Duration::from_secs(30),
        }
    }

    fn scrape<P: GalleryProfile + 'static>(&self, profile: P, tuning: &SourceOverrides) -> Box<dyn ImageFetcher> {
        let policy = tuning.apply_to(profile.default_policy());
        let launch = LaunchOptions {
            headless: tuning.headless.unwrap_or(profile.default_headless()),
        };
        let probe = profile
            .verifies_existence()
            .then(|| self.http.clone() as Arc<dyn ExistenceProbe>);
        Box::new(
            ScrapeFetcher::new(profile, self.launcher.clone(), launch, policy)
                .with_ready_timeout(self.ready_timeout)
                .with_probe(probe),
        )
    }
}

impl FetcherFactory for ProviderFetcherFactory {
    fn create(&self, name: &str) -> Result<Box<dyn ImageFetcher>, FetcherError> {
        let source: SourceName = name.parse()?;
        let tuning = self.settings.for_source(source);
        let fetcher: Box<dyn ImageFetcher> = match source {
            SourceName::Civitai => Box::new(CivitaiFetcher::new(self.http.clone(), tuning.staleness_window())),
            SourceName::Prompthero => Box::new(PromptHeroFetcher::new(self.http.clone())),
            SourceName::Lexica => self.scrape(LexicaProfile, &tuning),
            SourceName::Midjourney => self.scrape(MidjourneyProfile, &tuning),
        };
        Ok(fetcher)
    }

    fn supported_sources(&self) -> Vec<String> {
        SourceName::all_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gia_storage::HttpClientConfig;

    struct NoBrowser;

    #[async_trait]
    impl BrowserLauncher for NoBrowser {
        async fn launch(&self, _options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, FetcherError> {
            Err(FetcherError::Browser("no browser in tests".into()))
        }
    }

    fn factory(settings: SourceSettings) -> ProviderFetcherFactory {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        ProviderFetcherFactory::new(http, Arc::new(NoBrowser), settings)
    }

    #[test]
    fn factory_dispatches_every_registered_source() {
        let factory = factory(SourceSettings::default());
        let names = factory
            .supported_sources()
            .iter()
            .map(|name| factory.create(name).unwrap().source().name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Civitai", "Lexica", "Midjourney", "PromptHero"]);
    }

    #[test]
    fn factory_rejects_unregistered_names() {
        let err = factory(SourceSettings::default()).create("deviantart").err().unwrap();
        assert!(matches!(err, FetcherError::UnknownSource(UnknownSource(name)) if name == "deviantart"));
    }

    #[test]
    fn overrides_replace_only_the_fields_they_set() {
        let tuning = SourceOverrides {
            discovery_target: Some(10),
            idle_limit: Some(0),
            ..Default::default()
        };
        let policy = tuning.apply_to(LexicaProfile.default_policy());
        assert_eq!(policy.target, Some(10));
        assert_eq!(policy.idle_limit, 1);
        assert_eq!(policy.step_px, LexicaProfile.default_policy().step_px);
        assert_eq!(tuning.staleness_window(), chrono::Duration::hours(24));
    }

    #[tokio::test]
    async fn scrape_fetchers_surface_launch_failures() {
        let fetcher = factory(SourceSettings::default()).create("lexica").unwrap();
        assert!(matches!(fetcher.fetch_all().await, Err(FetcherError::Browser(_))));
    }
}
