use std::path::Path;

use lopdf::{Dictionary, Document as PdfDocument, Object, ObjectId};
use serde_json::Value;

use super::{Block, OcrOptions, Properties};

/// One block per page, matching how reviewers actually navigate a source
/// PDF ("see page 4"). `pdf-extract` gives us the text layer only — when a
/// page yields nothing (a scanned image with no embedded text) and OCR is
/// enabled, the page's embedded scan image is pulled out with `lopdf` and
/// run through Tesseract instead of leaving the block empty.
pub(super) fn parse(path: &Path, ocr: &OcrOptions) -> Result<(Vec<Block>, Properties), String> {
    let pages = pdf_extract::extract_text_by_pages(path)
        .map_err(|err| format!("failed to extract pdf text: {err}"))?;

    let mut properties = Properties::new();
    properties.insert("page_count".to_string(), Value::from(pages.len()));

    let scanned_images = if ocr.enabled { extract_page_images(path) } else { Vec::new() };

    let blocks = pages
        .into_iter()
        .enumerate()
        .map(|(idx, text)| {
            let page_num = idx + 1;
            let mut text = text.trim().to_string();
            if text.is_empty() && ocr.enabled {
                if let Some(Some(image_bytes)) = scanned_images.get(idx) {
                    match super::ocr::ocr_image_bytes(image_bytes, &ocr.lang) {
                        Ok(ocr_text) if !ocr_text.trim().is_empty() => text = ocr_text.trim().to_string(),
                        Ok(_) => {}
                        Err(err) => tracing::warn!(page = page_num, error = %err, "pdf page ocr failed"),
                    }
                }
            }
            let mut block = Block::new(page_num as i64, "paragraph", text);
            block.section = Some(format!("Page {page_num}"));
            block
        })
        .collect::<Vec<_>>();

    if blocks.is_empty() {
        return Err(format!("no pages extracted from {}", path.display()));
    }

    Ok((blocks, properties))
}

/// Pulls the first image XObject on each page. Scanned PDFs store a page as
/// a single embedded raster image rather than drawing instructions, so this
/// stands in for rendering the page to a pixmap at a fixed DPI.
fn extract_page_images(path: &Path) -> Vec<Option<Vec<u8>>> {
    let doc = match PdfDocument::load(path) {
        Ok(doc) => doc,
        Err(err) => {
            tracing::warn!(error = %err, "failed to open pdf for ocr image extraction");
            return Vec::new();
        }
    };

    let pages = doc.get_pages();
    let mut images = vec![None; pages.len()];
    for (page_num, page_id) in pages {
        let idx = (page_num as usize).saturating_sub(1);
        if let Some(slot) = images.get_mut(idx) {
            *slot = first_image_on_page(&doc, page_id);
        }
    }
    images
}

fn first_image_on_page(doc: &PdfDocument, page_id: ObjectId) -> Option<Vec<u8>> {
    let page_dict = match doc.get_object(page_id).ok()? {
        Object::Dictionary(dict) => dict,
        _ => return None,
    };
    let resources = resolve_dictionary(doc, page_dict.get(b"Resources").ok()?)?;
    let xobjects = resolve_dictionary(doc, resources.get(b"XObject").ok()?)?;

    for (_, value) in xobjects.iter() {
        let resolved = match value {
            Object::Reference(id) => match doc.get_object(*id) {
                Ok(obj) => obj,
                Err(_) => continue,
            },
            other => other,
        };
        if let Object::Stream(stream) = resolved {
            let is_image = matches!(
                stream.dict.get(b"Subtype"),
                Ok(Object::Name(name)) if name.as_slice() == b"Image"
            );
            if is_image {
                return Some(stream.content.clone());
            }
        }
    }
    None
}

fn resolve_dictionary<'a>(doc: &'a PdfDocument, object: &'a Object) -> Option<&'a Dictionary> {
    let resolved = match object {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    match resolved {
        Object::Dictionary(dict) => Some(dict),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}
