use std::path::Path;

use super::{Block, Properties};

/// No general-purpose document-conversion crate is part of this workspace's
/// dependency stack, so an unrecognized extension is read as raw bytes and
/// lossily decoded rather than rejected outright. Good enough to keep an
/// oddly-named text-like file ingestible; binary garbage just produces a
/// low-signal chunk the enrichment stage will flag.
pub(super) fn parse(path: &Path) -> Result<(Vec<Block>, Properties), String> {
    let bytes = std::fs::read(path).map_err(|err| format!("failed to read file: {err}"))?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    Ok((vec![Block::new(1, "paragraph", text)], Properties::new()))
}
