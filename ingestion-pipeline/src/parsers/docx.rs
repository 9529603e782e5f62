use std::io::Read as _;
use std::path::Path;

use docx_rs::{read_docx, DocumentChild, ParagraphChild, RunChild, TableCellContent, TableChild, TableRowChild};
use serde_json::Value;

use super::{Block, OcrOptions, Properties};

/// Walks the document body in order, turning each paragraph into a block
/// (heading level taken from its `HeadingN` style) and each table into a
/// GFM-style markdown table block, the same shape the chunker's table
/// handler expects from every other format. A paragraph immediately after a
/// table whose style or leading word marks it as a caption is folded into
/// that table's `caption` field instead of becoming its own block.
pub(super) fn parse(path: &Path, ocr: &OcrOptions) -> Result<(Vec<Block>, Properties), String> {
    let bytes = std::fs::read(path).map_err(|err| format!("failed to read file: {err}"))?;
    let docx = read_docx(&bytes).map_err(|err| format!("failed to read docx: {err}"))?;

    let mut blocks = Vec::new();
    let mut next_id = 1i64;
    let children = &docx.document.children;
    let mut i = 0usize;

    while i < children.len() {
        match &children[i] {
            DocumentChild::Paragraph(paragraph) => {
                let text = paragraph_text(paragraph);
                if !text.trim().is_empty() {
                    let mut block = Block::new(next_id, "paragraph", text);
                    if let Some(level) = heading_level(paragraph) {
                        block.block_type = "heading".to_string();
                        block.level = Some(level);
                    }
                    blocks.push(block);
                    next_id += 1;
                }
            }
            DocumentChild::Table(table) => {
                let markdown = table_markdown(table);
                if !markdown.trim().is_empty() {
                    let mut block = Block::new(next_id, "table", markdown);
                    next_id += 1;
                    if let Some(DocumentChild::Paragraph(next_paragraph)) = children.get(i + 1) {
                        let next_text = paragraph_text(next_paragraph);
                        let style_name = next_paragraph.property.style.as_ref().map(|s| s.val.as_str()).unwrap_or("");
                        if is_caption(style_name, &next_text) {
                            block.caption = Some(next_text.trim().to_string());
                            i += 1;
                        }
                    }
                    blocks.push(block);
                }
            }
            _ => {}
        }
        i += 1;
    }

    if ocr.enabled {
        blocks.extend(ocr_embedded_images(&bytes, &mut next_id, &ocr.lang));
    }

    if blocks.is_empty() {
        return Err(format!("no content extracted from {}", path.display()));
    }

    Ok((blocks, Properties::new()))
}

/// A table caption in the source documents is either styled `Caption` (or
/// its localized equivalent) or starts with one of a handful of fixed
/// leading words — there's no structural link between a table and the
/// paragraph describing it, just adjacency and convention.
fn is_caption(style_name: &str, text: &str) -> bool {
    if style_name.to_lowercase().contains("caption") {
        return true;
    }
    let lower = text.trim().to_lowercase();
    lower.starts_with("таблица") || lower.starts_with("table") || lower.starts_with("рис.") || lower.starts_with("рисунок")
}

/// Extracts `word/media/*` entries from the docx zip container and OCRs
/// each one, the same fallback `parse_docx`'s image loop runs over
/// `doc.part.rels`. WMF/EMF vector images are shelled out to ImageMagick
/// when it's on `PATH`; otherwise they're skipped.
fn ocr_embedded_images(bytes: &[u8], next_id: &mut i64, lang: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut archive = match zip::ZipArchive::new(std::io::Cursor::new(bytes)) {
        Ok(archive) => archive,
        Err(err) => {
            tracing::warn!(error = %err, "failed to open docx as zip for image ocr");
            return blocks;
        }
    };

    let media_names: Vec<String> = (0..archive.len())
        .filter_map(|idx| archive.by_index(idx).ok().map(|file| file.name().to_string()))
        .filter(|name| name.starts_with("word/media/"))
        .collect();

    for name in media_names {
        let Ok(mut file) = archive.by_name(&name) else { continue };
        let mut image_bytes = Vec::new();
        if file.read_to_end(&mut image_bytes).is_err() {
            continue;
        }
        drop(file);

        let lower_name = name.to_lowercase();
        let resolved = if lower_name.ends_with(".wmf") || lower_name.ends_with(".emf") {
            convert_vector_image(&image_bytes, &lower_name)
        } else {
            Some(image_bytes)
        };

        let Some(raster_bytes) = resolved else {
            tracing::warn!(image = %name, "unsupported embedded image format skipped");
            continue;
        };

        match super::ocr::ocr_image_bytes(&raster_bytes, lang) {
            Ok(text) if !text.trim().is_empty() => {
                let mut block = Block::new(*next_id, "image_text", text.trim().to_string());
                *next_id += 1;
                block.metadata.insert("source".to_string(), Value::String("ocr_from_embedded_image".to_string()));
                block.metadata.insert("image_ref".to_string(), Value::String(name));
                blocks.push(block);
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(image = %name, error = %err, "ocr failed for embedded image"),
        }
    }

    blocks
}

/// Shells out to `magick`/`convert` (ImageMagick) to rasterize a WMF/EMF
/// embed to PNG, mirroring the original's `subprocess.run(["magick", ...])`
/// fallback. Returns `None` when neither binary is on `PATH`.
fn convert_vector_image(bytes: &[u8], lower_name: &str) -> Option<Vec<u8>> {
    let binary = if which("magick") {
        "magick"
    } else if which("convert") {
        "convert"
    } else {
        return None;
    };

    let suffix = if lower_name.ends_with(".wmf") { ".wmf" } else { ".emf" };
    let mut input = tempfile::Builder::new().suffix(suffix).tempfile().ok()?;
    std::io::Write::write_all(&mut input, bytes).ok()?;
    let output = tempfile::Builder::new().suffix(".png").tempfile().ok()?;

    let status = std::process::Command::new(binary).arg(input.path()).arg(output.path()).status().ok()?;
    if !status.success() {
        return None;
    }
    std::fs::read(output.path()).ok()
}

fn which(binary: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

fn paragraph_text(paragraph: &docx_rs::Paragraph) -> String {
    let mut text = String::new();
    for child in &paragraph.children {
        if let ParagraphChild::Run(run) = child {
            for run_child in &run.children {
                if let RunChild::Text(t) = run_child {
                    text.push_str(&t.text);
                }
            }
        }
    }
    text
}

fn heading_level(paragraph: &docx_rs::Paragraph) -> Option<u8> {
    let style_id = paragraph.property.style.as_ref().map(|s| s.val.as_str())?;
    style_id
        .strip_prefix("Heading")
        .and_then(|suffix| suffix.parse::<u8>().ok())
}

fn table_markdown(table: &docx_rs::Table) -> String {
    let mut rows = Vec::new();
    for row_child in &table.rows {
        let TableChild::TableRow(row) = row_child;
        let mut cells = Vec::new();
        for cell_child in &row.cells {
            let TableRowChild::TableCell(cell) = cell_child;
            let mut cell_text = String::new();
            for content in &cell.children {
                if let TableCellContent::Paragraph(paragraph) = content {
                    if !cell_text.is_empty() {
                        cell_text.push(' ');
                    }
                    cell_text.push_str(&paragraph_text(paragraph));
                }
            }
            cells.push(cell_text.replace('|', "\\|"));
        }
        rows.push(cells);
    }

    if rows.is_empty() {
        return String::new();
    }

    let mut markdown = String::new();
    markdown.push_str(&format!("| {} |\n", rows[0].join(" | ")));
    markdown.push_str(&format!(
        "|{}|\n",
        rows[0].iter().map(|_| " --- ").collect::<Vec<_>>().join("|")
    ));
    for row in &rows[1..] {
        markdown.push_str(&format!("| {} |\n", row.join(" | ")));
    }
    markdown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_style_matches_regardless_of_leading_text() {
        assert!(is_caption("Caption", "Some arbitrary description"));
        assert!(is_caption("caption1", "Anything"));
    }

    #[test]
    fn caption_leading_word_matches_in_russian_and_english() {
        assert!(is_caption("Normal", "Таблица 3. Доходы по регионам"));
        assert!(is_caption("Normal", "Table 2: revenue by region"));
        assert!(is_caption("Normal", "Рис. 1 — схема процесса"));
        assert!(is_caption("Normal", "Рисунок 4"));
    }

    #[test]
    fn plain_paragraph_is_not_a_caption() {
        assert!(!is_caption("Normal", "This paragraph just continues the discussion."));
    }

    #[test]
    fn which_finds_a_binary_known_to_exist_on_path() {
        assert!(which("ls") || which("cmd.exe"));
    }

    #[test]
    fn which_rejects_a_binary_that_cannot_exist() {
        assert!(!which("definitely-not-a-real-binary-xyz"));
    }
}
