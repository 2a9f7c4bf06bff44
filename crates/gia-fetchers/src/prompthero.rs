use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use gia_core::{collapse_whitespace, format_from_url, Dimensions, IngestedImageRecord, SourceRef};
use gia_storage::HttpFetcher;
use scraper::Html;
use tracing::{info, warn};

use crate::cursor::{walk_listing, ListingApi, ListingPage, PageToken};
use crate::html::{
    element_text, parent_text, parse_selector, select_all_texts, select_first_attr, select_first_text,
};
use crate::{FetcherError, ImageFetcher};

const ORIGIN: &str = "https://prompthero.com";
const POSTED_FORMAT: &str = "%B %d, %Y %I:%M%p UTC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PromptCard {
    pub path: String,
    pub posted: String,
}

pub(crate) fn extract_cards(html: &str) -> Result<Vec<PromptCard>, FetcherError> {
    let document = Html::parse_document(html);
    let card_sel = parse_selector("article.prompt-card")?;
    let link_sel = parse_selector("a.prompt-card-a")?;
    let posted_sel = parse_selector(".prompt-card-details p.masonry-hide-unless-hover b")?;
    Ok(document
        .select(&card_sel)
        .filter_map(|card| {
            let path = card.select(&link_sel).next()?.value().attr("href")?.to_string();
            let posted = card
                .select(&posted_sel)
                .next()
                .and_then(element_text)
                .unwrap_or_default();
            Some(PromptCard { path, posted })
        })
        .collect())
}

fn parse_posted(title: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(&collapse_whitespace(title), POSTED_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_dimensions(text: &str) -> Option<Dimensions> {
    let (width, height) = text.split_once('x')?;
    Some(Dimensions {
        width: digits_beside_separator(width.trim_end().chars().rev(), true)?,
        height: digits_beside_separator(height.trim_start().chars(), false)?,
    })
}

// Labels and symbols may surround the numbers, so only the digit run touching the separator counts.
fn digits_beside_separator(chars: impl Iterator<Item = char>, reversed: bool) -> Option<u32> {
    let mut digits = chars.take_while(char::is_ascii_digit).collect::<Vec<_>>();
    if reversed {
        digits.reverse();
    }
    digits.into_iter().collect::<String>().parse().ok()
}

fn original_id_from_src(src: &str) -> Option<String> {
    let file = src.split(['?', '#']).next()?.rsplit('/').next()?;
    let stem = file.split('.').next()?;
    let id = stem.rsplit('-').next()?;
    (!id.is_empty()).then(|| id.to_string())
}

fn technical_tags(document: &Html) -> Result<Vec<String>, FetcherError> {
    let sel = parse_selector(r#"div.metadata span[data-toggle="tooltip"]"#)?;
    Ok(document
        .select(&sel)
        .filter_map(|span| {
            let label = span.value().attr("title")?.split(':').next()?.trim().to_string();
            let value = element_text(span)?;
            Some(format!("{label}: {value}").to_lowercase())
        })
        .collect())
}

fn posted_title(document: &Html) -> Result<Option<String>, FetcherError> {
    let sel = parse_selector("span")?;
    Ok(document
        .select(&sel)
        .find(|span| span.text().collect::<String>().contains("posted"))
        .and_then(|span| span.value().attr("title"))
        .map(ToString::to_string))
}

/// Parses one prompt page. A page without an image is unusable.
pub(crate) fn extract_prompt_page(source: &SourceRef, html: &str) -> Result<IngestedImageRecord, FetcherError> {
    let document = Html::parse_document(html);
    let image_url = select_first_attr(&document, "img.img-fluid", "src")?
        .ok_or_else(|| FetcherError::Parse("prompt page without img.img-fluid".into()))?;

    let mut record = IngestedImageRecord::new(source.clone(), image_url);
    record.original_id = original_id_from_src(&record.image_url);
    record.format = format_from_url(&record.image_url).or_else(|| Some("webp".to_string()));
    record.prompt = Some(select_all_texts(&document, "div.the-prompt b")?.join(" ")).filter(|p| !p.is_empty());
    record.author = select_first_text(&document, "div.d-flex.justify-content-between.mb-4 span")?;
    record.model = parent_text(&document, "i.fa-solid.fa-robot")?;
    record.created_at = posted_title(&document)?.as_deref().and_then(parse_posted);
    record.dimensions = parent_text(&document, "i.fa-regular.fa-image")?
        .as_deref()
        .and_then(parse_dimensions);
    record.technical_tags = technical_tags(&document)?;
    Ok(record)
}

struct GalleryListing<'a> {
    http: &'a HttpFetcher,
}

#[async_trait]
impl ListingApi for GalleryListing<'_> {
    type Item = PromptCard;

    fn name(&self) -> &str {
        "prompthero"
    }

    async fn fetch_page(&self, token: Option<&PageToken>) -> Result<ListingPage<PromptCard>, FetcherError> {
        let page = match token {
            Some(PageToken::Page(page)) => *page,
            _ => 1,
        };
        let query = [("sort", "newest".to_string()), ("page", page.to_string())];
        let html = self
            .http
            .get_text("prompthero", &format!("{ORIGIN}/newest"), &query)
            .await?;
        Ok(ListingPage {
            items: extract_cards(&html)?,
            next: Some(PageToken::Page(page + 1)),
        })
    }

    // Cards only carry a relative marker ("3 hours ago"); anything in days is outside the window.
    fn is_stale(&self, card: &PromptCard) -> bool {
        card.posted.contains("day")
    }
}

pub struct PromptHeroFetcher {
    http: Arc<HttpFetcher>,
}

impl PromptHeroFetcher {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ImageFetcher for PromptHeroFetcher {
    fn source(&self) -> SourceRef {
        SourceRef::new("PromptHero", false)
    }

    async fn fetch_all(&self) -> Result<Vec<IngestedImageRecord>, FetcherError> {
        let cards = walk_listing(&GalleryListing { http: &self.http }).await?;
        let source = self.source();
        let mut records = Vec::with_capacity(cards.len());
        for card in cards {
            let url = format!("{ORIGIN}{}", card.path);
            let parsed = match self.http.get_text("prompthero", &url, &[]).await {
                Ok(html) => extract_prompt_page(&source, &html),
                Err(err) => Err(err.into()),
            };
            match parsed {
                Ok(mut record) => {
                    record.publication_url = Some(url);
                    records.push(record);
                }
                Err(err) => warn!(%url, error = %err, "skipping prompt page"),
            }
        }
        info!(source = %source.name, fetched = records.len(), "prompt pages parsed");
        Ok(records)
    }
}
