use std::fs::File;
use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde_json::Value;
use zip::ZipArchive;

use super::{Block, Properties};

/// A `.pptx` is a zip of per-slide OOXML parts. We don't pull in a
/// slideshow-aware crate for this — none sits in this workspace's stack —
/// so slides are located by filename convention (`ppt/slides/slideN.xml`)
/// and their text runs (`<a:t>`) concatenated into one block per slide,
/// ordered by slide number rather than zip entry order.
pub(super) fn parse(path: &Path) -> Result<(Vec<Block>, Properties), String> {
    let file = File::open(path).map_err(|err| format!("failed to open file: {err}"))?;
    let mut archive = ZipArchive::new(file).map_err(|err| format!("failed to read pptx: {err}"))?;

    let mut slide_numbers = Vec::new();
    for idx in 0..archive.len() {
        let entry = archive
            .by_index(idx)
            .map_err(|err| format!("failed to read pptx entry: {err}"))?;
        if let Some(number) = slide_number(entry.name()) {
            slide_numbers.push(number);
        }
    }
    slide_numbers.sort_unstable();

    let mut blocks = Vec::new();
    for number in slide_numbers {
        let entry_name = format!("ppt/slides/slide{number}.xml");
        let mut entry = archive
            .by_name(&entry_name)
            .map_err(|err| format!("missing {entry_name}: {err}"))?;
        let mut xml = String::new();
        entry
            .read_to_string(&mut xml)
            .map_err(|err| format!("failed to read {entry_name}: {err}"))?;

        let text = extract_slide_text(&xml)?;
        if text.trim().is_empty() {
            continue;
        }
        let mut block = Block::new(number as i64, "slide_content", text);
        block.section = Some(format!("slide_{number}"));
        blocks.push(block);
    }

    if blocks.is_empty() {
        return Err(format!("no slide content extracted from {}", path.display()));
    }

    let mut properties = Properties::new();
    properties.insert("slide_count".to_string(), Value::from(blocks.len()));

    Ok((blocks, properties))
}

fn slide_number(entry_name: &str) -> Option<u32> {
    let name = entry_name.strip_prefix("ppt/slides/slide")?;
    let name = name.strip_suffix(".xml")?;
    name.parse().ok()
}

fn extract_slide_text(xml: &str) -> Result<String, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut runs = Vec::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(tag)) if tag.local_name().as_ref() == b"t" => in_text_run = true,
            Ok(Event::End(tag)) if tag.local_name().as_ref() == b"t" => in_text_run = false,
            Ok(Event::Text(event)) if in_text_run => {
                let decoded = event.unescape().map_err(|err| format!("invalid slide xml: {err}"))?;
                runs.push(decoded.into_owned());
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(format!("invalid slide xml: {err}")),
        }
    }

    Ok(runs.join(" "))
}
