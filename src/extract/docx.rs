use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{ Cursor, Read };
use zip::ZipArchive;

use crate::error::{ ChatError, Result };

const DOCUMENT_PART: &str = "word/document.xml";

/// Body paragraphs in document order, each followed by `\n`.
pub fn read_docx(name: &str, bytes: &[u8]) -> Result<String> {
    let fail = |reason: String| ChatError::Extraction { name: name.to_string(), reason };

    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e|
        fail(format!("not a DOCX archive: {}", e))
    )?;
    let mut xml = String::new();
    archive
        .by_name(DOCUMENT_PART)
        .map_err(|e| fail(format!("missing {}: {}", DOCUMENT_PART, e)))?
        .read_to_string(&mut xml)
        .map_err(|e| fail(format!("unreadable {}: {}", DOCUMENT_PART, e)))?;

    let paragraphs = body_paragraphs(&xml).map_err(|e|
        fail(format!("malformed {}: {}", DOCUMENT_PART, e))
    )?;

    let mut text = String::new();
    for paragraph in paragraphs {
        text.push_str(&paragraph);
        text.push('\n');
    }
    Ok(text)
}

/// Text of each `w:p` that is a direct child of `w:body`. Table cells and
/// text boxes hold their own paragraphs and are not part of the body flow.
fn body_paragraphs(xml: &str) -> std::result::Result<Vec<String>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);

    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current: Option<String> = None;
    let mut nested = 0usize;
    let mut in_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let local = e.local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"p" if current.is_none() && parent_is(&stack, b"body") => {
                        current = Some(String::new());
                    }
                    b"p" if current.is_some() => {
                        nested += 1;
                    }
                    b"t" if current.is_some() && nested == 0 && parent_is(&stack, b"r") => {
                        in_text = true;
                    }
                    _ => {}
                }
                stack.push(local);
            }
            Event::Empty(e) => {
                let in_run = parent_is(&stack, b"r") && nested == 0;
                match e.local_name().as_ref() {
                    b"p" if current.is_none() && parent_is(&stack, b"body") => {
                        paragraphs.push(String::new());
                    }
                    b"tab" if in_run => {
                        if let Some(p) = current.as_mut() {
                            p.push('\t');
                        }
                    }
                    b"br" | b"cr" if in_run => {
                        if let Some(p) = current.as_mut() {
                            p.push('\n');
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                if in_text {
                    if let Some(p) = current.as_mut() {
                        p.push_str(&t.unescape()?);
                    }
                }
            }
            Event::End(e) => {
                stack.pop();
                match e.local_name().as_ref() {
                    b"t" => {
                        in_text = false;
                    }
                    b"p" if nested > 0 => {
                        nested -= 1;
                    }
                    b"p" => {
                        if let Some(p) = current.take() {
                            paragraphs.push(p);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => {
                break;
            }
            _ => {}
        }
    }

    Ok(paragraphs)
}

fn parent_is(stack: &[Vec<u8>], local_name: &[u8]) -> bool {
    stack
        .last()
        .map(|n| n.as_slice() == local_name)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::{ FileOptions, ZipWriter };

    fn wrap_body(body: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\">\
             <w:body>{}</w:body></w:document>",
            body
        )
    }

    fn build_docx(document_xml: &str) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("[Content_Types].xml", FileOptions::default()).unwrap();
        writer.write_all(b"<Types/>").unwrap();
        writer.start_file(DOCUMENT_PART, FileOptions::default()).unwrap();
        writer.write_all(document_xml.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn paragraphs_are_joined_with_newlines() {
        let xml = wrap_body(
            "<w:p><w:r><w:t>Streamlit apps</w:t></w:r><w:r><w:t xml:space=\"preserve\"> rerun</w:t></w:r></w:p>\
             <w:p><w:r><w:t>Second &amp; last</w:t></w:r></w:p>"
        );
        let text = read_docx("guide.docx", &build_docx(&xml)).unwrap();
        assert_eq!(text, "Streamlit apps rerun\nSecond & last\n");
    }

    #[test]
    fn empty_paragraphs_keep_their_line() {
        let xml = wrap_body("<w:p><w:r><w:t>a</w:t></w:r></w:p><w:p/><w:p><w:pPr/></w:p><w:p><w:r><w:t>b</w:t></w:r></w:p>");
        let text = read_docx("gaps.docx", &build_docx(&xml)).unwrap();
        assert_eq!(text, "a\n\n\nb\n");
    }

    #[test]
    fn tabs_and_breaks_inside_runs() {
        let xml = wrap_body(
            "<w:p><w:pPr><w:tabs><w:tab w:val=\"left\" w:pos=\"720\"/></w:tabs></w:pPr>\
             <w:r><w:t>key</w:t><w:tab/><w:t>value</w:t><w:br/><w:t>next</w:t></w:r></w:p>"
        );
        let text = read_docx("tabs.docx", &build_docx(&xml)).unwrap();
        assert_eq!(text, "key\tvalue\nnext\n");
    }

    #[test]
    fn table_paragraphs_are_not_body_paragraphs() {
        let xml = wrap_body(
            "<w:p><w:r><w:t>before</w:t></w:r></w:p>\
             <w:tbl><w:tr><w:tc><w:p><w:r><w:t>cell</w:t></w:r></w:p></w:tc></w:tr></w:tbl>\
             <w:p><w:r><w:t>after</w:t></w:r></w:p>"
        );
        let text = read_docx("table.docx", &build_docx(&xml)).unwrap();
        assert_eq!(text, "before\nafter\n");
    }

    #[test]
    fn archive_without_document_part_fails() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("other.xml", FileOptions::default()).unwrap();
        writer.write_all(b"<x/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let err = read_docx("empty.docx", &bytes).unwrap_err();
        assert!(err.to_string().contains(DOCUMENT_PART));
    }

    #[test]
    fn non_zip_input_fails() {
        assert!(matches!(read_docx("x.docx", b"hello"), Err(ChatError::Extraction { .. })));
    }
}
