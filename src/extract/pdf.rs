use log::{ debug, warn };
use lopdf::Document as PdfDocument;

use crate::error::{ ChatError, Result };

/// Page texts in page order, each followed by `\n`. Pages without extractable
/// text contribute a blank line so page boundaries survive.
pub fn read_pdf(name: &str, bytes: &[u8]) -> Result<String> {
    let doc = PdfDocument::load_mem(bytes).map_err(|e| ChatError::Extraction {
        name: name.to_string(),
        reason: format!("invalid PDF: {}", e),
    })?;

    let pages = doc.get_pages();
    debug!("'{}' has {} page(s)", name, pages.len());

    let mut text = String::new();
    for page_no in pages.keys() {
        match doc.extract_text(&[*page_no]) {
            Ok(page_text) => {
                text.push_str(page_text.trim_matches(['\n', '\r']));
            }
            Err(e) => {
                warn!("No text extracted from page {} of '{}': {}", page_no, name, e);
            }
        }
        text.push('\n');
    }
    Ok(text)
}
