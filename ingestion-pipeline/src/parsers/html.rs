use std::path::Path;

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use super::{Block, Properties};

const BLOCK_SELECTOR: &str = "p, li, blockquote, h1, h2, h3, h4, h5, h6, td, th";

/// Prefers `<main>`/`<article>` over the whole `<body>` so navigation chrome
/// and footers don't dilute the extracted text, falling back one level at a
/// time when the page doesn't use semantic regions. Paragraphs are read off
/// block-level elements directly rather than by blank-line splitting, since
/// HTML rarely preserves source whitespace as a paragraph signal.
pub(super) fn parse(path: &Path) -> Result<(Vec<Block>, Properties), String> {
    let raw = std::fs::read_to_string(path).map_err(|err| format!("failed to read file: {err}"))?;
    let document = Html::parse_document(&raw);

    let mut properties = Properties::new();
    if let Some(title) = select_first_text(&document, "title") {
        properties.insert("title".to_string(), Value::String(title));
    }

    let region = ["main", "article", "body"]
        .iter()
        .find_map(|selector| select_first(&document, selector));

    let block_selector = Selector::parse(BLOCK_SELECTOR).expect("static selector is valid");
    let heading_selector =
        Selector::parse("h1, h2, h3, h4, h5, h6").expect("static selector is valid");

    let mut blocks = Vec::new();
    if let Some(region) = region {
        for (idx, element) in region.select(&block_selector).enumerate() {
            let text = element_text(element);
            if text.is_empty() {
                continue;
            }
            let mut block = Block::new((idx + 1) as i64, "paragraph", text);
            if heading_selector.matches(&element) {
                block.block_type = "heading".to_string();
                block.level = element.value().name().get(1..).and_then(|d| d.parse().ok());
            }
            blocks.push(block);
        }
    }

    if blocks.is_empty() {
        let whole_text = region
            .map(element_text)
            .unwrap_or_default();
        blocks.push(Block::new(1, "paragraph", whole_text));
    }

    Ok((blocks, properties))
}

fn element_text(element: ElementRef) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn select_first<'a>(document: &'a Html, selector: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(selector).ok()?;
    document.select(&selector).next()
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    select_first(document, selector).map(element_text)
}
