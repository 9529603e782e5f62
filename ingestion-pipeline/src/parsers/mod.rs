//! C2 Parser Dispatcher: routes a file to a format-specific parser by
//! extension and normalizes every parser's output into the same block/
//! properties shape, always stamped with filesystem metadata.

mod docx;
mod fallback;
mod html;
mod json;
mod ocr;
mod pdf;
mod pptx;
mod spreadsheet;
mod txt;
mod xml;

use std::path::Path;

use serde_json::{Map, Value};

/// One ordered unit of extracted content. `chunk_id` here is provisional —
/// a position within the parser's own output, re-numbered once chunks are
/// assembled.
#[derive(Debug, Clone)]
pub struct Block {
    pub chunk_id: i64,
    pub block_type: String,
    pub text: String,
    pub section: Option<String>,
    pub level: Option<u8>,
    pub caption: Option<String>,
    pub metadata: Map<String, Value>,
}

impl Block {
    fn new(chunk_id: i64, block_type: &str, text: String) -> Self {
        Self {
            chunk_id,
            block_type: block_type.to_string(),
            text,
            section: None,
            level: None,
            caption: None,
            metadata: Map::new(),
        }
    }

    fn error(message: String) -> Self {
        Self::new(1, "error", message)
    }
}

pub type Properties = Map<String, Value>;

/// OCR fallback knobs, read from `AppConfig` once by the pipeline and
/// passed down to the two formats (`pdf`, `docx`) whose scans can come back
/// with no text layer at all.
#[derive(Clone)]
pub struct OcrOptions {
    pub enabled: bool,
    pub lang: String,
}

/// `parse(path, doc_id) -> (blocks, properties)`. Never propagates a parser
/// failure as an `Err` — a parse error becomes a single `type = error`
/// block so the upload worker can mark the task failed without losing the
/// task row itself.
pub fn parse(
    path: &Path,
    doc_id: &str,
    excel_row_batch_size: usize,
    ocr: &OcrOptions,
) -> (Vec<Block>, Properties) {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let result = match ext.as_str() {
        "pdf" => pdf::parse(path, ocr),
        "docx" => docx::parse(path, ocr),
        "pptx" => pptx::parse(path),
        "html" | "htm" => html::parse(path),
        "txt" => txt::parse(path),
        "xlsx" | "xls" => spreadsheet::parse(path, excel_row_batch_size),
        "json" => json::parse(path),
        "xml" => xml::parse(path),
        _ => fallback::parse(path),
    };

    match result {
        Ok((blocks, mut properties)) => {
            merge_filesystem_metadata(path, &mut properties);
            (blocks, properties)
        }
        Err(message) => {
            tracing::error!(doc_id, error = %message, "parser failed");
            let mut properties = Properties::new();
            merge_filesystem_metadata(path, &mut properties);
            (vec![Block::error(message)], properties)
        }
    }
}

/// Always populated after the format-specific parser runs, even on the
/// error path, so a failed parse still carries `source_filename`/
/// `size_bytes` for the task's audit trail.
fn merge_filesystem_metadata(path: &Path, properties: &mut Properties) {
    let filesystem = filesystem_metadata(path);
    for (key, value) in filesystem {
        properties.entry(key).or_insert(value);
    }
}

fn filesystem_metadata(path: &Path) -> Properties {
    let mut meta = Properties::new();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    meta.insert("source_filename".to_string(), Value::String(filename));

    match std::fs::metadata(path) {
        Ok(fs_meta) => {
            meta.insert("size_bytes".to_string(), Value::from(fs_meta.len()));
            if let Ok(modified) = fs_meta.modified() {
                meta.insert(
                    "modified_fs".to_string(),
                    Value::String(system_time_to_rfc3339(modified)),
                );
            }
            if let Ok(created) = fs_meta.created() {
                meta.insert(
                    "created_fs".to_string(),
                    Value::String(system_time_to_rfc3339(created)),
                );
            }
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read filesystem metadata");
        }
    }

    meta
}

fn system_time_to_rfc3339(time: std::time::SystemTime) -> String {
    let datetime: chrono::DateTime<chrono::Utc> = time.into();
    datetime.to_rfc3339()
}

/// Splits on blank lines, trimming each paragraph and dropping empty ones.
/// Shared by the HTML/TXT/XML parsers, which all reduce to "plain text,
/// paragraph-split" once markup is stripped.
pub(crate) fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_paragraphs_drops_blank_entries() {
        let paragraphs = split_paragraphs("first\n\n\n\nsecond\n\nthird  ");
        assert_eq!(paragraphs, vec!["first", "second", "third"]);
    }

    #[test]
    fn unknown_extension_falls_back_and_still_reports_filesystem_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("note.weird");
        std::fs::write(&path, b"hello there").expect("write");

        let ocr = OcrOptions { enabled: false, lang: "eng".to_string() };
        let (blocks, properties) = parse(&path, "doc1", 200, &ocr);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "hello there");
        assert_eq!(
            properties.get("source_filename").and_then(Value::as_str),
            Some("note.weird")
        );
    }
}
