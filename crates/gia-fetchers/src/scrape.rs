use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gia_core::{IngestedImageRecord, SourceRef};
use gia_storage::HttpFetcher;
use indexmap::IndexSet;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{FetcherError, ImageFetcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrollTarget {
    Window,
    /// Scrollable container, addressed by element id.
    Element(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOptions {
    pub headless: bool,
}

/// One exclusive page in a controlled browser.
#[async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str) -> Result<(), FetcherError>;

    /// Installs an observer that reports the link of every gallery card
    /// inserted from now on, including those already present.
    async fn observe_cards(
        &mut self,
        card_selector: &str,
        link_selector: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<String>, FetcherError>;

    async fn stop_observing(&mut self) -> Result<(), FetcherError>;

    /// Scrolls by `dy` pixels and returns the resulting scroll offset.
    async fn scroll_by(&mut self, target: &ScrollTarget, dy: i64) -> Result<i64, FetcherError>;

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), FetcherError>;
    async fn content(&mut self) -> Result<String, FetcherError>;
    async fn close(&mut self) -> Result<(), FetcherError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, FetcherError>;
}

#[async_trait]
pub trait ExistenceProbe: Send + Sync {
    async fn exists(&self, url: &str) -> bool;
}

#[async_trait]
impl ExistenceProbe for HttpFetcher {
    async fn exists(&self, url: &str) -> bool {
        self.probe_exists(url).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    /// Stop once this many distinct URLs are known. `None` scrolls to the end.
    pub target: Option<usize>,
    pub step_px: i64,
    pub interval: Duration,
    /// Consecutive increments without movement that count as end of content.
    pub idle_limit: u32,
    pub channel_capacity: usize,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            target: None,
            step_px: 100,
            interval: Duration::from_millis(500),
            idle_limit: 1,
            channel_capacity: 256,
        }
    }
}

/// Per-provider knowledge for a browser-driven gallery.
pub trait GalleryProfile: Send + Sync {
    fn source(&self) -> SourceRef;
    fn gallery_url(&self) -> &str;
    fn card_selector(&self) -> &str;
    fn link_selector(&self) -> &str;
    fn scroll_target(&self) -> ScrollTarget;
    /// Rendered once the detail page is ready for extraction.
    fn ready_selector(&self) -> &str;
    fn default_policy(&self) -> DiscoveryPolicy;

    fn default_headless(&self) -> bool {
        true
    }

    fn verifies_existence(&self) -> bool {
        false
    }

    fn extract(&self, html: &str) -> Result<Vec<IngestedImageRecord>, FetcherError>;
}

fn drain(feed: &mut mpsc::Receiver<String>, found: &mut IndexSet<String>) -> bool {
    loop {
        match feed.try_recv() {
            Ok(url) => {
                found.insert(url);
            }
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

/// Scrolls the gallery in fixed steps and collects distinct detail URLs in
/// discovery order. Ends at the target count, after `idle_limit` increments
/// that do not move the page, or when the observer feed closes.
pub async fn discover_detail_urls(
    session: &mut dyn BrowserSession,
    card_selector: &str,
    link_selector: &str,
    scroll: &ScrollTarget,
    policy: &DiscoveryPolicy,
) -> Result<Vec<String>, FetcherError> {
    let mut feed = session
        .observe_cards(card_selector, link_selector, policy.channel_capacity)
        .await?;
    let mut found = IndexSet::new();
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_offset = None;
    let mut idle = 0u32;
    let mut increments = 0usize;

    loop {
        ticker.tick().await;
        let offset = session.scroll_by(scroll, policy.step_px).await?;
        increments += 1;
        let open = drain(&mut feed, &mut found);

        if policy.target.is_some_and(|target| found.len() >= target) {
            break;
        }
        if last_offset == Some(offset) {
            idle += 1;
            if idle >= policy.idle_limit.max(1) {
                break;
            }
        } else {
            idle = 0;
        }
        last_offset = Some(offset);
        if !open {
            break;
        }
    }

    session.stop_observing().await?;
    drain(&mut feed, &mut found);
    debug!(increments, discovered = found.len(), "discovery finished");
    Ok(found.into_iter().collect())
}

/// Visits each detail page in order. Navigation failures, ready-wait
/// timeouts and extraction errors skip that page only.
pub async fn visit_details(
    session: &mut dyn BrowserSession,
    profile: &dyn GalleryProfile,
    urls: &[String],
    ready_timeout: Duration,
) -> Vec<IngestedImageRecord> {
    let mut records = Vec::new();
    for url in urls {
        let html = match load_detail(session, profile.ready_selector(), url, ready_timeout).await {
            Ok(html) => html,
            Err(err) => {
                warn!(%url, error = %err, "skipping detail page");
                continue;
            }
        };
        match profile.extract(&html) {
            Ok(extracted) => records.extend(extracted.into_iter().map(|mut record| {
                record.publication_url = Some(url.clone());
                record
            })),
            Err(err) => warn!(%url, error = %err, "detail extraction failed"),
        }
    }
    records
}

async fn load_detail(
    session: &mut dyn BrowserSession,
    ready_selector: &str,
    url: &str,
    ready_timeout: Duration,
) -> Result<String, FetcherError> {
    session.goto(url).await?;
    session.wait_for(ready_selector, ready_timeout).await?;
    session.content().await
}

/// Drops records whose image no longer resolves. One probe per record, no retries.
pub async fn verify_existence(
    probe: &dyn ExistenceProbe,
    records: Vec<IngestedImageRecord>,
) -> Vec<IngestedImageRecord> {
    let mut kept = Vec::with_capacity(records.len());
    for record in records {
        if probe.exists(&record.image_url).await {
            kept.push(record);
        } else {
            debug!(url = %record.image_url, "dropping unresolvable image");
        }
    }
    kept
}

pub struct ScrapeFetcher<P> {
    profile: P,
    launcher: Arc<dyn BrowserLauncher>,
    launch: LaunchOptions,
    policy: DiscoveryPolicy,
    ready_timeout: Duration,
    probe: Option<Arc<dyn ExistenceProbe>>,
}

impl<P: GalleryProfile> ScrapeFetcher<P> {
    pub fn new(profile: P, launcher: Arc<dyn BrowserLauncher>, launch: LaunchOptions, policy: DiscoveryPolicy) -> Self {
        Self {
            profile,
            launcher,
            launch,
            policy,
            ready_timeout: Duration::from_secs(30),
            probe: None,
        }
    }

    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    pub fn with_probe(mut self, probe: Option<Arc<dyn ExistenceProbe>>) -> Self {
        self.probe = probe;
        self
    }

    async fn scrape(&self, session: &mut dyn BrowserSession) -> Result<Vec<IngestedImageRecord>, FetcherError> {
        session.goto(self.profile.gallery_url()).await?;
        let urls = discover_detail_urls(
            session,
            self.profile.card_selector(),
            self.profile.link_selector(),
            &self.profile.scroll_target(),
            &self.policy,
        )
        .await?;
        info!(source = %self.profile.source().name, discovered = urls.len(), "detail pages discovered");
        Ok(visit_details(session, &self.profile, &urls, self.ready_timeout).await)
    }
}

#[async_trait]
impl<P: GalleryProfile> ImageFetcher for ScrapeFetcher<P> {
    fn source(&self) -> SourceRef {
        self.profile.source()
    }

    async fn fetch_all(&self) -> Result<Vec<IngestedImageRecord>, FetcherError> {
        let mut session = self.launcher.launch(&self.launch).await?;
        let scraped = self.scrape(session.as_mut()).await;
        if let Err(err) = session.close().await {
            warn!(source = %self.profile.source().name, error = %err, "closing browser session failed");
        }
        let records = scraped?;

        Ok(match &self.probe {
            Some(probe) => verify_existence(probe.as_ref(), records).await,
            None => records,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct SessionLog {
        pub visited: Vec<String>,
        pub scrolls: usize,
        pub stopped: bool,
        pub closed: bool,
    }

    /// Scripted session: each scroll step reveals the next batch of links and
    /// moves the page until `moving_steps` is exhausted.
    pub struct FakeSession {
        pub batches: Vec<Vec<String>>,
        pub moving_steps: usize,
        pub pages: HashMap<String, String>,
        pub unready: Vec<String>,
        pub fail_gallery: bool,
        pub log: Arc<Mutex<SessionLog>>,
        pub feed: Option<mpsc::Sender<String>>,
        pub offset: i64,
        pub current: Option<String>,
    }

    impl FakeSession {
        pub fn new(log: Arc<Mutex<SessionLog>>) -> Self {
            Self {
                batches: Vec::new(),
                moving_steps: 0,
                pages: HashMap::new(),
                unready: Vec::new(),
                fail_gallery: false,
                log,
                feed: None,
                offset: 0,
                current: None,
            }
        }
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        async fn goto(&mut self, url: &str) -> Result<(), FetcherError> {
            self.log.lock().unwrap().visited.push(url.to_string());
            self.current = Some(url.to_string());
            Ok(())
        }

        async fn observe_cards(&mut self, _card: &str, _link: &str, capacity: usize) -> Result<mpsc::Receiver<String>, FetcherError> {
            if self.fail_gallery {
                return Err(FetcherError::Browser("gallery crashed".into()));
            }
            let (tx, rx) = mpsc::channel(capacity);
            self.feed = Some(tx);
            Ok(rx)
        }

        async fn stop_observing(&mut self) -> Result<(), FetcherError> {
            self.feed = None;
            self.log.lock().unwrap().stopped = true;
            Ok(())
        }

        async fn scroll_by(&mut self, _target: &ScrollTarget, dy: i64) -> Result<i64, FetcherError> {
            let step = {
                let mut log = self.log.lock().unwrap();
                log.scrolls += 1;
                log.scrolls
            };
            if step <= self.moving_steps {
                self.offset += dy;
            }
            if let (Some(feed), Some(batch)) = (&self.feed, self.batches.get(step - 1)) {
                for url in batch {
                    let _ = feed.try_send(url.clone());
                }
            }
            Ok(self.offset)
        }

        async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> Result<(), FetcherError> {
            match &self.current {
                Some(url) if self.unready.contains(url) => Err(FetcherError::Timeout {
                    selector: selector.to_string(),
                }),
                _ => Ok(()),
            }
        }

        async fn content(&mut self) -> Result<String, FetcherError> {
            let url = self.current.clone().unwrap_or_default();
            Ok(self.pages.get(&url).cloned().unwrap_or_default())
        }

        async fn close(&mut self) -> Result<(), FetcherError> {
            self.log.lock().unwrap().closed = true;
            Ok(())
        }
    }

    pub struct FakeLauncher {
        pub session: Mutex<Option<FakeSession>>,
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(&self, _options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, FetcherError> {
            let session = self.session.lock().unwrap().take();
            session
                .map(|s| Box::new(s) as Box<dyn BrowserSession>)
                .ok_or_else(|| FetcherError::Browser("already launched".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::Mutex;

    fn urls(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://gallery.test/{prefix}/{i}")).collect()
    }

    fn policy(target: Option<usize>, idle_limit: u32) -> DiscoveryPolicy {
        DiscoveryPolicy {
            target,
            idle_limit,
            ..DiscoveryPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_terminates_one_increment_after_movement_stops() {
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut session = FakeSession::new(log.clone());
        session.moving_steps = 4;
        session.batches = vec![urls("a", 3), urls("b", 3)];

        let found = discover_detail_urls(&mut session, "div", "a", &ScrollTarget::Window, &policy(Some(150), 1))
            .await
            .unwrap();

        assert_eq!(found.len(), 6);
        assert_eq!(log.lock().unwrap().scrolls, 5);
        assert!(log.lock().unwrap().stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_stops_at_target_and_deduplicates() {
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut session = FakeSession::new(log.clone());
        session.moving_steps = 100;
        let mut repeated = urls("a", 2);
        repeated.extend(urls("a", 2));
        session.batches = vec![repeated, urls("b", 2), urls("c", 2), urls("d", 2)];

        let found = discover_detail_urls(&mut session, "div", "a", &ScrollTarget::Window, &policy(Some(5), 1))
            .await
            .unwrap();

        assert_eq!(log.lock().unwrap().scrolls, 3);
        assert_eq!(found.len(), 6);
        assert_eq!(found[0], "https://gallery.test/a/0");
        assert_eq!(found[2], "https://gallery.test/b/0");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_limit_tolerates_temporary_stalls() {
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut session = FakeSession::new(log.clone());
        session.moving_steps = 2;

        discover_detail_urls(&mut session, "div", "a", &ScrollTarget::Window, &policy(None, 3))
            .await
            .unwrap();

        assert_eq!(log.lock().unwrap().scrolls, 5);
    }

    struct EchoProfile;

    impl GalleryProfile for EchoProfile {
        fn source(&self) -> SourceRef {
            SourceRef::new("Echo", false)
        }
        fn gallery_url(&self) -> &str {
            "https://gallery.test/"
        }
        fn card_selector(&self) -> &str {
            "div.card"
        }
        fn link_selector(&self) -> &str {
            "a"
        }
        fn scroll_target(&self) -> ScrollTarget {
            ScrollTarget::Window
        }
        fn ready_selector(&self) -> &str {
            "img"
        }
        fn default_policy(&self) -> DiscoveryPolicy {
            policy(None, 1)
        }
        fn extract(&self, html: &str) -> Result<Vec<IngestedImageRecord>, FetcherError> {
            if html.is_empty() {
                return Err(FetcherError::Parse("empty page".into()));
            }
            let mut record = IngestedImageRecord::new(self.source(), html.to_string());
            record.original_id = Some(html.to_string());
            Ok(vec![record])
        }
    }

    fn scripted_session(log: Arc<Mutex<SessionLog>>) -> FakeSession {
        let mut session = FakeSession::new(log);
        session.moving_steps = 1;
        session.batches = vec![urls("p", 3)];
        for (i, url) in urls("p", 3).into_iter().enumerate() {
            session.pages.insert(url, format!("https://img.test/{i}.png"));
        }
        session
    }

    #[tokio::test(start_paused = true)]
    async fn unready_detail_pages_are_skipped() {
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut session = scripted_session(log.clone());
        session.unready = vec!["https://gallery.test/p/1".to_string()];
        let launcher = Arc::new(FakeLauncher {
            session: Mutex::new(Some(session)),
        });
        let fetcher = ScrapeFetcher::new(EchoProfile, launcher, LaunchOptions { headless: true }, policy(None, 1));

        let records = fetcher.fetch_all().await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].publication_url.as_deref(), Some("https://gallery.test/p/0"));
        assert_eq!(records[1].image_url, "https://img.test/2.png");
        assert!(log.lock().unwrap().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn session_is_closed_when_scraping_fails() {
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let mut session = FakeSession::new(log.clone());
        session.fail_gallery = true;
        let launcher = Arc::new(FakeLauncher {
            session: Mutex::new(Some(session)),
        });
        let fetcher = ScrapeFetcher::new(EchoProfile, launcher, LaunchOptions { headless: true }, policy(None, 1));

        assert!(matches!(fetcher.fetch_all().await, Err(FetcherError::Browser(_))));
        assert!(log.lock().unwrap().closed);
    }

    struct DenyList(Vec<String>);

    #[async_trait]
    impl ExistenceProbe for DenyList {
        async fn exists(&self, url: &str) -> bool {
            !self.0.iter().any(|u| u == url)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn existence_probe_drops_missing_images() {
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let launcher = Arc::new(FakeLauncher {
            session: Mutex::new(Some(scripted_session(log))),
        });
        let probe: Arc<dyn ExistenceProbe> = Arc::new(DenyList(vec!["https://img.test/0.png".to_string()]));
        let fetcher = ScrapeFetcher::new(EchoProfile, launcher, LaunchOptions { headless: true }, policy(None, 1))
            .with_probe(Some(probe));

        let records = fetcher.fetch_all().await.unwrap();
        let kept = records.iter().map(|r| r.image_url.as_str()).collect::<Vec<_>>();
        assert_eq!(kept, vec!["https://img.test/1.png", "https://img.test/2.png"]);
    }
}
