use std::path::Path;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use super::{split_paragraphs, Block, Properties};

/// Strips markup down to text content, treating consecutive text runs
/// separated by a blank line's worth of whitespace as paragraph boundaries,
/// same as the HTML/TXT parsers once markup is gone.
pub(super) fn parse(path: &Path) -> Result<(Vec<Block>, Properties), String> {
    let raw = std::fs::read_to_string(path).map_err(|err| format!("failed to read file: {err}"))?;

    let mut reader = Reader::from_str(&raw);
    reader.config_mut().trim_text(true);

    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Text(event)) => {
                let decoded = event.unescape().map_err(|err| format!("invalid xml: {err}"))?;
                text.push_str(&decoded);
                text.push('\n');
            }
            Ok(Event::CData(event)) => {
                text.push_str(&String::from_utf8_lossy(event.as_ref()));
                text.push('\n');
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(format!("invalid xml: {err}")),
        }
    }

    let blocks = split_paragraphs(&text)
        .into_iter()
        .enumerate()
        .map(|(idx, text)| Block::new((idx + 1) as i64, "paragraph", text))
        .collect::<Vec<_>>();

    if blocks.is_empty() {
        return Ok((vec![Block::new(1, "paragraph", String::new())], Properties::new()));
    }

    Ok((blocks, Properties::new()))
}
