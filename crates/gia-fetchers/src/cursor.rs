use async_trait::async_trait;
use tracing::debug;

use crate::FetcherError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageToken {
    Cursor(String),
    Page(u32),
}

#[derive(Debug, Clone)]
pub struct ListingPage<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}

/// A newest-first listing that can be walked page by page.
#[async_trait]
pub trait ListingApi: Send + Sync {
    type Item: Send;

    fn name(&self) -> &str;
    async fn fetch_page(&self, token: Option<&PageToken>) -> Result<ListingPage<Self::Item>, FetcherError>;
    fn is_stale(&self, item: &Self::Item) -> bool;
}

/// Walks the listing until an empty page, a page without a continuation
/// token, or the first stale item. The stale item and everything after it
/// are dropped and no further page is requested.
pub async fn walk_listing<A>(api: &A) -> Result<Vec<A::Item>, FetcherError>
where
    A: ListingApi + ?Sized,
{
    let mut collected = Vec::new();
    let mut token: Option<PageToken> = None;
    let mut pages = 0usize;

    loop {
        let page = api.fetch_page(token.as_ref()).await?;
        pages += 1;
        if page.items.is_empty() {
            break;
        }
        for item in page.items {
            if api.is_stale(&item) {
                debug!(source = api.name(), pages, collected = collected.len(), "reached stale item");
                return Ok(collected);
            }
            collected.push(item);
        }
        match page.next {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    debug!(source = api.name(), pages, collected = collected.len(), "listing exhausted");
    Ok(collected)
}
