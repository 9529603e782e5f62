use std::path::Path;

use serde_json::Value;

use super::{Block, Properties};

/// Re-serializes to canonical pretty-printed form rather than keeping the
/// original byte layout, so two differently-formatted-but-equal documents
/// chunk identically. Emitted as a single block: splitting JSON on
/// structural boundaries would produce fragments that aren't valid JSON on
/// their own and wouldn't mean anything to a downstream embedding model.
pub(super) fn parse(path: &Path) -> Result<(Vec<Block>, Properties), String> {
    let raw = std::fs::read_to_string(path).map_err(|err| format!("failed to read file: {err}"))?;
    let value: Value = serde_json::from_str(&raw).map_err(|err| format!("invalid json: {err}"))?;
    let pretty = serde_json::to_string_pretty(&value).map_err(|err| err.to_string())?;

    Ok((vec![Block::new(1, "json", pretty)], Properties::new()))
}
