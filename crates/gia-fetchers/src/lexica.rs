use gia_core::{non_empty, Dimensions, IngestedImageRecord, SourceRef};
use scraper::Html;

use crate::html::{labelled_value, select_all_attrs, select_first_text};
use crate::scrape::{DiscoveryPolicy, GalleryProfile, ScrollTarget};
use crate::FetcherError;

const IMAGE_SELECTOR: &str = "img.select-none";

/// lexica.art: window-scrolled grid, several renders per detail page.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicaProfile;

fn parse_dimensions(text: &str) -> Option<Dimensions> {
    let (width, height) = text.split_once('×')?;
    Some(Dimensions {
        width: width.trim().parse().ok()?,
        height: height.trim().parse().ok()?,
    })
}

impl GalleryProfile for LexicaProfile {
    fn source(&self) -> SourceRef {
        SourceRef::new("Lexica", false)
    }

    fn gallery_url(&self) -> &str {
        "https://lexica.art/"
    }

    fn card_selector(&self) -> &str {
        r#"div[role="gridcell"]"#
    }

    fn link_selector(&self) -> &str {
        "a"
    }

    fn scroll_target(&self) -> ScrollTarget {
        ScrollTarget::Window
    }

    fn ready_selector(&self) -> &str {
        IMAGE_SELECTOR
    }

    fn default_policy(&self) -> DiscoveryPolicy {
        DiscoveryPolicy {
            target: Some(150),
            idle_limit: 20,
            ..DiscoveryPolicy::default()
        }
    }

    fn extract(&self, html: &str) -> Result<Vec<IngestedImageRecord>, FetcherError> {
        let document = Html::parse_document(html);
        let prompt = select_first_text(&document, "div.mt-6 p")?;
        let model = labelled_value(&document, "Model", "div.text-sm")?;
        let dimensions = labelled_value(&document, "Dimensions", "div.text-sm")?
            .as_deref()
            .and_then(parse_dimensions);

        let source = self.source();
        Ok(select_all_attrs(&document, IMAGE_SELECTOR, "src")?
            .into_iter()
            .map(|src| {
                let original_id = src
                    .split(['?', '#'])
                    .next()
                    .and_then(|path| path.rsplit('/').next())
                    .and_then(non_empty);
                let mut record = IngestedImageRecord::new(source.clone(), src.replace("full_webp", "full_jpg"));
                record.original_id = original_id;
                record.format = Some("jpg".to_string());
                record.prompt = prompt.clone();
                record.model = model.clone();
                record.dimensions = dimensions;
                record
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAIL: &str = r#"
        <html><body>
          <img class="select-none" src="https://image.lexica.art/full_webp/0b1c2d3e-aaaa">
          <img class="select-none" src="https://image.lexica.art/full_webp/4f5a6b7c-bbbb">
          <div class="mt-6"><p>an astronaut   riding a horse, oil painting</p></div>
          <div class="grid">
            <div>Dimensions</div><div class="text-sm">1024 × 1536</div>
            <div>Model</div><div class="text-sm">Lexica Aperture v4</div>
          </div>
        </body></html>"#;

    #[test]
    fn one_record_per_rendered_image() {
        let records = LexicaProfile.extract(DETAIL).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].original_id.as_deref(), Some("0b1c2d3e-aaaa"));
        assert_eq!(records[0].image_url, "https://image.lexica.art/full_jpg/0b1c2d3e-aaaa");
        assert_eq!(records[1].original_id.as_deref(), Some("4f5a6b7c-bbbb"));
        for record in &records {
            assert_eq!(record.format.as_deref(), Some("jpg"));
            assert_eq!(record.prompt.as_deref(), Some("an astronaut riding a horse, oil painting"));
            assert_eq!(record.model.as_deref(), Some("Lexica Aperture v4"));
            assert_eq!(record.dimensions, Some(Dimensions { width: 1024, height: 1536 }));
            assert!(!record.source.is_trusted);
        }
    }

    #[test]
    fn page_without_images_yields_nothing() {
        assert!(LexicaProfile.extract("<div class=\"mt-6\"><p>x</p></div>").unwrap().is_empty());
    }
}
