use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EventBindingCalled};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::scrape::{BrowserLauncher, BrowserSession, LaunchOptions, ScrollTarget};
use crate::FetcherError;

const BINDING: &str = "__giaReportCard";
const READY_POLL: Duration = Duration::from_millis(250);

fn browser_err(err: impl std::fmt::Display) -> FetcherError {
    FetcherError::Browser(err.to_string())
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn observer_script(card_selector: &str, link_selector: &str) -> String {
    format!(
        r#"(() => {{
  const card = {card};
  const link = {link};
  const report = (el) => {{
    const a = el.querySelector(link);
    if (a && a.href) window.{BINDING}(a.href);
  }};
  const scan = (node) => {{
    if (!(node instanceof Element)) return;
    if (node.matches(card)) report(node);
    node.querySelectorAll(card).forEach(report);
  }};
  document.querySelectorAll(card).forEach(report);
  if (window.__giaObserver) window.__giaObserver.disconnect();
  window.__giaObserver = new MutationObserver((mutations) =>
    mutations.forEach((m) => m.addedNodes.forEach(scan)));
  window.__giaObserver.observe(document.body, {{ childList: true, subtree: true }});
  return true;
}})()"#,
        card = js_string(card_selector),
        link = js_string(link_selector),
    )
}

fn scroll_script(target: &ScrollTarget, dy: i64) -> String {
    match target {
        ScrollTarget::Window => {
            format!("(() => {{ window.scrollBy(0, {dy}); return Math.round(window.scrollY); }})()")
        }
        ScrollTarget::Element(id) => format!(
            r#"(() => {{
  const el = document.getElementById({id});
  if (!el) return -1;
  el.scrollBy(0, {dy});
  return Math.round(el.scrollTop);
}})()"#,
            id = js_string(id),
        ),
    }
}

/// Launches a local Chromium over CDP for each scrape.
#[derive(Debug, Clone, Default)]
pub struct ChromiumLauncher {
    executable: Option<PathBuf>,
}

impl ChromiumLauncher {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self { executable }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, FetcherError> {
        let mut builder = BrowserConfig::builder()
            .window_size(1366, 768)
            .viewport(Viewport {
                width: 1366,
                height: 768,
                ..Viewport::default()
            })
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox");
        if !options.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(FetcherError::Browser)?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(browser_err)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "cdp handler stopped");
                    break;
                }
            }
        });
        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                handler.abort();
                return Err(browser_err(err));
            }
        };
        debug!(headless = options.headless, "browser launched");

        Ok(Box::new(ChromiumSession {
            browser,
            page,
            handler,
            forwarder: None,
        }))
    }
}

pub struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    forwarder: Option<JoinHandle<()>>,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn goto(&mut self, url: &str) -> Result<(), FetcherError> {
        self.page.goto(url).await.map_err(browser_err)?;
        Ok(())
    }

    async fn observe_cards(
        &mut self,
        card_selector: &str,
        link_selector: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<String>, FetcherError> {
        let mut events = self
            .page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(browser_err)?;
        self.page
            .execute(AddBindingParams::new(BINDING))
            .await
            .map_err(browser_err)?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        if let Some(previous) = self.forwarder.replace(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.name != BINDING {
                    continue;
                }
                if tx.send(event.payload.clone()).await.is_err() {
                    break;
                }
            }
        })) {
            previous.abort();
        }

        self.page
            .evaluate(observer_script(card_selector, link_selector))
            .await
            .map_err(browser_err)?;
        Ok(rx)
    }

    async fn stop_observing(&mut self) -> Result<(), FetcherError> {
        let result = self
            .page
            .evaluate("(() => { if (window.__giaObserver) window.__giaObserver.disconnect(); return true; })()")
            .await;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        result.map(|_| ()).map_err(browser_err)
    }

    async fn scroll_by(&mut self, target: &ScrollTarget, dy: i64) -> Result<i64, FetcherError> {
        let offset = self
            .page
            .evaluate(scroll_script(target, dy))
            .await
            .map_err(browser_err)?
            .into_value::<f64>()
            .map_err(browser_err)?;
        Ok(offset as i64)
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), FetcherError> {
        let page = &self.page;
        let poll = async {
            loop {
                if page.find_element(selector).await.is_ok() {
                    return;
                }
                tokio::time::sleep(READY_POLL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| FetcherError::Timeout {
                selector: selector.to_string(),
            })
    }

    async fn content(&mut self) -> Result<String, FetcherError> {
        self.page.content().await.map_err(browser_err)
    }

    async fn close(&mut self) -> Result<(), FetcherError> {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        let closed = self.browser.close().await.map(|_| ()).map_err(browser_err);
        if let Err(err) = self.browser.wait().await {
            warn!(error = %err, "waiting for browser exit failed");
        }
        self.handler.abort();
        closed
    }
}
