use gia_core::{collapse_whitespace, non_empty};
use scraper::{ElementRef, Html, Selector};

use crate::FetcherError;

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, FetcherError> {
    Selector::parse(selector).map_err(|e| FetcherError::Parse(format!("selector {selector}: {e}")))
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    non_empty(collapse_whitespace(&element.text().collect::<String>()))
}

pub(crate) fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, FetcherError> {
    let sel = parse_selector(selector)?;
    Ok(document.select(&sel).next().and_then(element_text))
}

pub(crate) fn select_all_texts(document: &Html, selector: &str) -> Result<Vec<String>, FetcherError> {
    let sel = parse_selector(selector)?;
    Ok(document.select(&sel).filter_map(element_text).collect())
}

pub(crate) fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, FetcherError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(non_empty))
}

pub(crate) fn select_all_attrs(document: &Html, selector: &str, attr: &str) -> Result<Vec<String>, FetcherError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(non_empty)
        .collect())
}

/// Text of the parent of the first element matching `selector`, e.g. an icon's label.
pub(crate) fn parent_text(document: &Html, selector: &str) -> Result<Option<String>, FetcherError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.parent())
        .and_then(ElementRef::wrap)
        .and_then(element_text))
}

/// Value element whose immediately preceding sibling div mentions `label`.
pub(crate) fn labelled_value(
    document: &Html,
    label: &str,
    value_selector: &str,
) -> Result<Option<String>, FetcherError> {
    let sel = parse_selector(value_selector)?;
    Ok(document
        .select(&sel)
        .find(|value| {
            value
                .prev_siblings()
                .find_map(ElementRef::wrap)
                .is_some_and(|prev| {
                    prev.value().name() == "div" && prev.text().collect::<String>().contains(label)
                })
        })
        .and_then(element_text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labelled_value_reads_the_following_sibling() {
        let doc = Html::parse_document(
            r#"<div>
                 <div>Dimensions</div><div class="text-sm">640 × 960</div>
                 <div>Model</div><div class="text-sm"> Lexica Aperture v3 </div>
               </div>"#,
        );
        assert_eq!(
            labelled_value(&doc, "Model", "div.text-sm").unwrap().as_deref(),
            Some("Lexica Aperture v3")
        );
        assert_eq!(labelled_value(&doc, "Seed", "div.text-sm").unwrap(), None);
    }

    #[test]
    fn parent_text_collapses_whitespace() {
        let doc = Html::parse_document(
            r#"<span><i class="fa-solid fa-robot"></i>
                 Stable   Diffusion</span>"#,
        );
        assert_eq!(
            parent_text(&doc, "i.fa-solid.fa-robot").unwrap().as_deref(),
            Some("Stable Diffusion")
        );
    }

    #[test]
    fn invalid_selectors_are_parse_errors() {
        let doc = Html::parse_document("<p>x</p>");
        assert!(matches!(
            select_first_text(&doc, "p[["),
            Err(FetcherError::Parse(_))
        ));
    }
}
