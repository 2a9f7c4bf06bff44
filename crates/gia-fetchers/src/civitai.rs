use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gia_core::{format_from_url, non_empty, Dimensions, IngestedImageRecord, SourceRef};
use gia_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::info;

use crate::cursor::{walk_listing, ListingApi, ListingPage, PageToken};
use crate::{FetcherError, ImageFetcher};

const API_URL: &str = "https://civitai.com/api/v1/images";
const PAGE_LIMIT: u32 = 200;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CivitaiImage {
    id: JsonValue,
    url: String,
    width: Option<u32>,
    height: Option<u32>,
    created_at: Option<DateTime<Utc>>,
    username: Option<String>,
    #[serde(default)]
    nsfw: bool,
    meta: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CivitaiMetadata {
    next_cursor: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct CivitaiResponse {
    #[serde(default)]
    items: Vec<CivitaiImage>,
    metadata: Option<CivitaiMetadata>,
}

/// Renders a JSON scalar the way it would print as a tag or id.
fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => non_empty(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn meta_text(meta: &JsonValue, key: &str) -> Option<String> {
    meta.get(key).and_then(scalar_text)
}

fn technical_tags(meta: &JsonValue) -> Vec<String> {
    let mut tags = [("seed", "seed"), ("steps", "steps"), ("sampler", "sampler"), ("cfgScale", "cfg scale")]
        .into_iter()
        .filter_map(|(key, label)| meta_text(meta, key).map(|v| format!("{label}: {v}")))
        .collect::<Vec<_>>();
    if let (Some(factor), Some(upscaler)) = (meta_text(meta, "Hires upscale"), meta_text(meta, "Hires upscaler")) {
        tags.push(format!("upscale: {factor} using {upscaler}"));
    }
    tags
}

pub(crate) fn map_item(source: &SourceRef, item: CivitaiImage) -> IngestedImageRecord {
    let original_id = scalar_text(&item.id);
    let mut record = IngestedImageRecord::new(source.clone(), item.url);
    record.format = format_from_url(&record.image_url);
    record.publication_url = original_id
        .as_ref()
        .map(|id| format!("https://civitai.com/images/{id}"));
    record.original_id = original_id;
    record.dimensions = match (item.width, item.height) {
        (Some(width), Some(height)) => Some(Dimensions { width, height }),
        _ => None,
    };
    record.created_at = item.created_at;
    record.author = item.username.and_then(non_empty);
    if item.nsfw {
        record.content_tags.push("nsfw".to_string());
    }
    if let Some(meta) = item.meta.as_ref().filter(|m| m.is_object()) {
        record.prompt = meta_text(meta, "prompt");
        record.negative_prompt = meta_text(meta, "negativePrompt");
        record.model = meta_text(meta, "Model");
        record.technical_tags = technical_tags(meta);
    }
    record
}

struct CivitaiListing<'a> {
    http: &'a HttpFetcher,
    cutoff: DateTime<Utc>,
}

#[async_trait]
impl ListingApi for CivitaiListing<'_> {
    type Item = CivitaiImage;

    fn name(&self) -> &str {
        "civitai"
    }

    async fn fetch_page(&self, token: Option<&PageToken>) -> Result<ListingPage<CivitaiImage>, FetcherError> {
        let mut query = vec![
            ("sort", "Newest".to_string()),
            ("limit", PAGE_LIMIT.to_string()),
            ("nsfw", "None".to_string()),
        ];
        if let Some(PageToken::Cursor(cursor)) = token {
            query.push(("cursor", cursor.clone()));
        }
        let response: CivitaiResponse = self.http.get_json("civitai", API_URL, &query).await?;
        let next = response
            .metadata
            .and_then(|m| m.next_cursor)
            .as_ref()
            .and_then(scalar_text)
            .map(PageToken::Cursor);
        Ok(ListingPage {
            items: response.items,
            next,
        })
    }

    // Items without a timestamp are kept.
    fn is_stale(&self, item: &CivitaiImage) -> bool {
        item.created_at.is_some_and(|created| created < self.cutoff)
    }
}

pub struct CivitaiFetcher {
    http: Arc<HttpFetcher>,
    window: Duration,
}

impl CivitaiFetcher {
    pub fn new(http: Arc<HttpFetcher>, window: Duration) -> Self {
        Self { http, window }
    }
}

#[async_trait]
impl ImageFetcher for CivitaiFetcher {
    fn source(&self) -> SourceRef {
        SourceRef::new("Civitai", false)
    }

    async fn fetch_all(&self) -> Result<Vec<IngestedImageRecord>, FetcherError> {
        let listing = CivitaiListing {
            http: &self.http,
            cutoff: Utc::now() - self.window,
        };
        let items = walk_listing(&listing).await?;
        let source = self.source();
        let records = items
            .into_iter()
            .map(|item| map_item(&source, item))
            .collect::<Vec<_>>();
        info!(source = %source.name, fetched = records.len(), "civitai listing walked");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: JsonValue) -> CivitaiImage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn maps_a_full_api_item() {
        let item = parse(json!({
            "id": 4242,
            "url": "https://image.civitai.com/xG1/abc/width=832/4242.jpeg",
            "width": 832,
            "height": 1216,
            "nsfw": true,
            "createdAt": "2024-05-01T10:00:00.000Z",
            "username": "painter",
            "meta": {
                "prompt": "a lighthouse at dusk",
                "negativePrompt": "blurry",
                "Model": "juggernautXL",
                "seed": 12345,
                "steps": 30,
                "sampler": "DPM++ 2M Karras",
                "cfgScale": 7,
                "Hires upscale": 2,
                "Hires upscaler": "4x-UltraSharp"
            }
        }));
        let record = map_item(&SourceRef::new("Civitai", false), item);
        assert_eq!(record.original_id.as_deref(), Some("4242"));
        assert_eq!(record.format.as_deref(), Some("jpeg"));
        assert_eq!(
            record.publication_url.as_deref(),
            Some("https://civitai.com/images/4242")
        );
        assert_eq!(record.dimensions, Some(Dimensions { width: 832, height: 1216 }));
        assert_eq!(record.author.as_deref(), Some("painter"));
        assert_eq!(record.model.as_deref(), Some("juggernautXL"));
        assert_eq!(record.negative_prompt.as_deref(), Some("blurry"));
        assert_eq!(record.content_tags, vec!["nsfw"]);
        assert_eq!(
            record.technical_tags,
            vec![
                "seed: 12345",
                "steps: 30",
                "sampler: DPM++ 2M Karras",
                "cfg scale: 7",
                "upscale: 2 using 4x-UltraSharp",
            ]
        );
    }

    #[test]
    fn missing_meta_leaves_optional_fields_absent() {
        let item = parse(json!({
            "id": 7,
            "url": "https://image.civitai.com/x/7.png",
            "meta": null
        }));
        let record = map_item(&SourceRef::new("Civitai", false), item);
        assert!(record.prompt.is_none());
        assert!(record.technical_tags.is_empty());
        assert!(record.content_tags.is_empty());
        assert!(record.dimensions.is_none());
    }

    #[test]
    fn partial_meta_only_emits_present_tags() {
        let meta = json!({ "seed": 1, "Hires upscale": 2 });
        assert_eq!(technical_tags(&meta), vec!["seed: 1"]);
    }

    #[test]
    fn staleness_uses_the_rolling_cutoff() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        let listing = CivitaiListing {
            http: &http,
            cutoff: Utc::now() - Duration::hours(24),
        };
        let fresh = parse(json!({ "id": 1, "url": "u", "createdAt": Utc::now().to_rfc3339() }));
        let old = parse(json!({
            "id": 2,
            "url": "u",
            "createdAt": (Utc::now() - Duration::hours(25)).to_rfc3339()
        }));
        let undated = parse(json!({ "id": 3, "url": "u" }));
        assert!(!listing.is_stale(&fresh));
        assert!(listing.is_stale(&old));
        assert!(!listing.is_stale(&undated));
    }
}
