use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use gia_core::{collapse_whitespace, non_empty, IngestedImageRecord, SourceRef};
use scraper::{ElementRef, Html};
use url::Url;

use crate::html::{element_text, parse_selector, select_all_attrs, select_all_texts, select_first_attr};
use crate::scrape::{DiscoveryPolicy, GalleryProfile, ScrollTarget};
use crate::FetcherError;

const IMAGE_SELECTOR: &str = "img.absolute.w-full.h-full";
const VARIANTS: usize = 4;

const DATED_FORMATS: [&str; 2] = ["%b %d, %Y, %I:%M %p", "%B %d, %Y, %I:%M %p"];

// Recent tooltips omit the year; the caller's year is appended before parsing those.
const UNDATED_FORMATS: [&str; 2] = ["%b %d, %I:%M %p %Y", "%B %d, %I:%M %p %Y"];

/// midjourney.com showcase: scrolls an inner container and expands each
/// detail page into its four grid variants.
#[derive(Debug, Clone, Copy, Default)]
pub struct MidjourneyProfile;

pub(crate) fn parse_showcase_date(title: &str, year: i32) -> Option<DateTime<Utc>> {
    let title = collapse_whitespace(title);
    let with_year = format!("{title} {year}");
    DATED_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&title, format).ok())
        .or_else(|| {
            UNDATED_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(&with_year, format).ok())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(&title, "%b %d, %Y")
                .or_else(|_| NaiveDate::parse_from_str(&with_year, "%b %d %Y"))
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// Variant ids and asset URLs derived from the primary render's URL.
fn variants(src: &str) -> Option<Vec<(String, String)>> {
    let url = Url::parse(src).ok()?;
    let segments = url.path_segments()?.collect::<Vec<_>>();
    if segments.len() < 2 {
        return None;
    }
    let job_id = segments.first().copied().and_then(non_empty)?;
    let parent = segments[..segments.len().saturating_sub(1)].join("/");
    let origin = url.origin().ascii_serialization();
    Some(
        (0..VARIANTS)
            .map(|i| (format!("{job_id}/0_{i}"), format!("{origin}/{parent}/0_{i}.png")))
            .collect(),
    )
}

fn creation_title(document: &Html) -> Result<Option<String>, FetcherError> {
    let sel = parse_selector("span > div.cursor-help")?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.parent())
        .and_then(ElementRef::wrap)
        .and_then(|span| span.value().attr("title"))
        .map(ToString::to_string))
}

impl GalleryProfile for MidjourneyProfile {
    fn source(&self) -> SourceRef {
        SourceRef::new("Midjourney", true)
    }

    fn gallery_url(&self) -> &str {
        "https://www.midjourney.com/showcase"
    }

    fn card_selector(&self) -> &str {
        "div:has(> a.block.bg-cover)"
    }

    fn link_selector(&self) -> &str {
        "a.block.bg-cover"
    }

    fn scroll_target(&self) -> ScrollTarget {
        ScrollTarget::Element("pageScroll".to_string())
    }

    fn ready_selector(&self) -> &str {
        IMAGE_SELECTOR
    }

    fn default_policy(&self) -> DiscoveryPolicy {
        DiscoveryPolicy::default()
    }

    // The showcase refuses to render for headless browsers.
    fn default_headless(&self) -> bool {
        false
    }

    fn verifies_existence(&self) -> bool {
        true
    }

    fn extract(&self, html: &str) -> Result<Vec<IngestedImageRecord>, FetcherError> {
        let document = Html::parse_document(html);
        let Some(src) = select_first_attr(&document, IMAGE_SELECTOR, "src")? else {
            return Ok(Vec::new());
        };
        let variants = variants(&src)
            .ok_or_else(|| FetcherError::Parse(format!("unrecognised render url {src}")))?;

        let author_sel = parse_selector("div.whitespace-nowrap.pointer-events-auto.cursor-pointer span")?;
        let author = non_empty(
            document
                .select(&author_sel)
                .filter_map(element_text)
                .collect::<String>(),
        );
        let created_at = creation_title(&document)?
            .as_deref()
            .and_then(|title| parse_showcase_date(title, Utc::now().year()));

        let buttons = select_all_texts(&document, r#"button[title="Use in prompt"]"#)?;
        let prompt = [
            select_all_texts(&document, ".break-word p")?.join(" "),
            select_all_attrs(&document, r#"a[title="Image Prompt"]"#, "href")?.join(" "),
            buttons.join(" "),
        ]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
        let technical_tags = buttons
            .iter()
            .filter_map(|text| non_empty(text.replace("--", "")))
            .collect::<Vec<_>>();

        let source = self.source();
        Ok(variants
            .into_iter()
            .map(|(id, url)| {
                let mut record = IngestedImageRecord::new(source.clone(), url);
                record.original_id = Some(id);
                record.format = Some("png".to_string());
                record.model = Some("Midjourney".to_string());
                record.author = author.clone();
                record.created_at = created_at;
                record.prompt = non_empty(&prompt);
                record.technical_tags = technical_tags.clone();
                record
            })
            .collect())
    }
}
