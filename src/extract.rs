//! Text extraction for knowledge-base files.
//!
//! Plain-text formats are read as (lossy) UTF-8. PDF goes through
//! `pdf-extract`; DOCX body text is pulled from `word/document.xml` with
//! `zip` + `quick-xml`. Failures never panic: they come back as
//! [`Extracted::error`] and the caller records the file as broken.

use std::io::Read;
use std::path::Path;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Result of extracting one file. `error` is set when `text` could not be
/// produced; `text` is then empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub text: String,
    pub error: Option<String>,
}

impl Extracted {
    fn ok(text: String) -> Self {
        Self { text, error: None }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Extracted;
}

/// Dispatches on file extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtractor;

impl TextExtractor for DefaultExtractor {
    fn extract(&self, path: &Path) -> Extracted {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let result = std::fs::read(path)
            .map_err(ExtractError::from)
            .and_then(|bytes| match ext.as_str() {
                "pdf" => extract_pdf(&bytes),
                "docx" => extract_docx(&bytes),
                _ => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            });
        match result {
            Ok(text) => Extracted::ok(text),
            Err(e) => Extracted::failed(e.to_string()),
        }
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_paragraphs(&xml)
}

/// Text of every `w:t` run, with one line per `w:p` paragraph.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_plain_text_lossy() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, b"hello \xff world").unwrap();
        let out = DefaultExtractor.extract(&path);
        assert!(out.error.is_none());
        assert!(out.text.starts_with("hello "));
        assert!(out.text.ends_with(" world"));
    }

    #[test]
    fn test_missing_file_is_error_not_panic() {
        let out = DefaultExtractor.extract(Path::new("/no/such/file.txt"));
        assert!(out.error.is_some());
        assert!(out.text.is_empty());
    }

    #[test]
    fn test_invalid_pdf_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();
        let out = DefaultExtractor.extract(&path);
        assert!(out.error.unwrap().contains("PDF"));
    }

    #[test]
    fn test_docx_paragraphs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.docx");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file(
            "word/document.xml",
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
        zip.write_all(
            br#"<w:document xmlns:w="x"><w:body><w:p><w:r><w:t>First para.</w:t></w:r></w:p><w:p><w:r><w:t>Second</w:t></w:r><w:r><w:t> para.</w:t></w:r></w:p></w:body></w:document>"#,
        )
        .unwrap();
        zip.finish().unwrap();

        let out = DefaultExtractor.extract(&path);
        assert_eq!(out.error, None);
        assert_eq!(out.text, "First para.\nSecond para.");
    }
}
