//! Turns uploaded PDF and DOCX files into plain text.
//!
//! Every uploaded file yields an [`ExtractionOutcome`]; files that cannot be
//! read are reported back with a reason instead of being dropped.

pub mod docx;
pub mod pdf;

use log::{ info, warn };
use serde::{ Deserialize, Serialize };

use crate::error::{ ChatError, Result };

pub const PDF_MIME: &str = "application/pdf";
pub const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
}

impl DocumentKind {
    /// Parameters such as `; charset=binary` are ignored.
    pub fn from_mime(mime_type: &str) -> Result<Self> {
        let essence = mime_type.split(';').next().unwrap_or("").trim().to_lowercase();
        match essence.as_str() {
            PDF_MIME => Ok(DocumentKind::Pdf),
            DOCX_MIME => Ok(DocumentKind::Docx),
            _ => Err(ChatError::UnsupportedFileType(mime_type.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Extracted text of one uploaded file, ready to be indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub source: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    Extracted {
        name: String,
        chars: usize,
    },
    Skipped {
        name: String,
        reason: String,
    },
}

pub fn extract(file: &UploadedFile) -> Result<String> {
    match DocumentKind::from_mime(&file.mime_type)? {
        DocumentKind::Pdf => pdf::read_pdf(&file.name, &file.bytes),
        DocumentKind::Docx => docx::read_docx(&file.name, &file.bytes),
    }
}

pub fn extract_all(files: &[UploadedFile]) -> (Vec<Document>, Vec<ExtractionOutcome>) {
    let mut documents = Vec::new();
    let mut outcomes = Vec::with_capacity(files.len());

    for file in files {
        match extract(file) {
            Ok(text) => {
                info!("Extracted {} characters from '{}'", text.chars().count(), file.name);
                outcomes.push(ExtractionOutcome::Extracted {
                    name: file.name.clone(),
                    chars: text.chars().count(),
                });
                documents.push(Document { source: file.name.clone(), text });
            }
            Err(e) => {
                warn!("Skipping '{}': {}", file.name, e);
                outcomes.push(ExtractionOutcome::Skipped {
                    name: file.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    (documents, outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_detection() {
        assert_eq!(DocumentKind::from_mime("application/pdf").unwrap(), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_mime(" Application/PDF ").unwrap(), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_mime(DOCX_MIME).unwrap(), DocumentKind::Docx);
        assert!(
            matches!(
                DocumentKind::from_mime("text/plain"),
                Err(ChatError::UnsupportedFileType(m)) if m == "text/plain"
            )
        );
    }

    #[test]
    fn unsupported_files_are_reported_not_dropped() {
        let files = vec![UploadedFile {
            name: "notes.txt".into(),
            mime_type: "text/plain".into(),
            bytes: b"plain".to_vec(),
        }];
        let (documents, outcomes) = extract_all(&files);

        assert!(documents.is_empty());
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            ExtractionOutcome::Skipped { name, reason } => {
                assert_eq!(name, "notes.txt");
                assert!(reason.contains("text/plain"));
            }
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn malformed_pdf_is_skipped_with_reason() {
        let files = vec![UploadedFile {
            name: "broken.pdf".into(),
            mime_type: PDF_MIME.into(),
            bytes: b"not a pdf".to_vec(),
        }];
        let (documents, outcomes) = extract_all(&files);
        assert!(documents.is_empty());
        assert!(matches!(&outcomes[0], ExtractionOutcome::Skipped { name, .. } if name == "broken.pdf"));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = ExtractionOutcome::Extracted { name: "a.pdf".into(), chars: 4 };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "extracted");
        assert_eq!(json["chars"], 4);
    }
}
