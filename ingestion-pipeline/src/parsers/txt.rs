use std::path::Path;

use chardetng::EncodingDetector;
use serde_json::Value;

use super::{split_paragraphs, Block, Properties};

/// Detects the source encoding with `chardetng` rather than assuming UTF-8,
/// since plain-text corpora routinely carry legacy Windows/Latin-1 content.
pub(super) fn parse(path: &Path) -> Result<(Vec<Block>, Properties), String> {
    let bytes = std::fs::read(path).map_err(|err| format!("failed to read file: {err}"))?;

    let mut detector = EncodingDetector::new();
    detector.feed(&bytes, true);
    let encoding = detector.guess(None, true);

    let (decoded, _, had_errors) = encoding.decode(&bytes);

    let mut properties = Properties::new();
    properties.insert("encoding".to_string(), Value::String(encoding.name().to_string()));
    properties.insert(
        "encoding_confidence".to_string(),
        Value::from(if had_errors { 0.5 } else { 1.0 }),
    );

    let blocks = split_paragraphs(&decoded)
        .into_iter()
        .enumerate()
        .map(|(idx, text)| Block::new((idx + 1) as i64, "paragraph", text))
        .collect::<Vec<_>>();

    if blocks.is_empty() {
        return Ok((vec![Block::new(1, "paragraph", String::new())], properties));
    }

    Ok((blocks, properties))
}
