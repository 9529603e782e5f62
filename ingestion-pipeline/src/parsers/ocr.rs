//! OCR fallback for scanned pages/embedded images. Mirrors
//! `ocr_backend.ocr_image_to_text`'s Tesseract call — `leptess` binds the
//! same Leptonica/Tesseract pair the original uses through `pytesseract`.

pub fn ocr_image_bytes(bytes: &[u8], lang: &str) -> Result<String, String> {
    let mut engine =
        leptess::LepTess::new(None, lang).map_err(|err| format!("failed to init ocr engine for lang {lang}: {err}"))?;
    engine
        .set_image_from_mem(bytes)
        .map_err(|err| format!("failed to load image for ocr: {err}"))?;
    engine.get_utf8_text().map_err(|err| format!("ocr recognition failed: {err}"))
}
