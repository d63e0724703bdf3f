use std::io::{Cursor, Read};

use anyhow::{bail, Context, Result};
use quick_xml::events::Event;

/// Upload formats the analyzer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Docx,
    Txt,
}

impl FileKind {
    /// Detect from a filename extension, case-insensitively.
    pub fn from_filename(name: &str) -> Option<Self> {
        let ext = std::path::Path::new(name)
            .extension()?
            .to_str()?
            .to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" => Some(Self::Txt),
            _ => None,
        }
    }
}

/// Extract plain text from an uploaded file held in memory.
pub fn extract(bytes: &[u8], kind: FileKind) -> Result<String> {
    match kind {
        FileKind::Txt => Ok(String::from_utf8_lossy(bytes).into_owned()),
        FileKind::Pdf => extract_pdf(bytes),
        FileKind::Docx => extract_docx(bytes),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    let doc = lopdf::Document::load_mem(bytes).context("not a readable PDF")?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    if pages.is_empty() {
        return Ok(String::new());
    }
    doc.extract_text(&pages)
        .context("failed to extract text from PDF")
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("not a readable DOCX")?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("DOCX has no word/document.xml")?
        .read_to_string(&mut xml)
        .context("failed to read word/document.xml")?;
    docx_paragraphs(&xml)
}

/// Join the text runs (`w:t`) of each paragraph (`w:p`), one paragraph per line.
fn docx_paragraphs(xml: &str) -> Result<String> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut in_paragraph = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"w:p" => {
                    in_paragraph = true;
                    current.clear();
                }
                b"w:t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:tab" if in_paragraph => current.push('\t'),
                b"w:br" if in_paragraph => current.push('\n'),
                b"w:p" => paragraphs.push(String::new()),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                current.push_str(&t.unescape().context("invalid text in DOCX")?);
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => {
                    in_paragraph = false;
                    paragraphs.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => bail!("malformed DOCX XML at {}: {e}", reader.buffer_position()),
        }
    }

    Ok(paragraphs.join("\n"))
}
