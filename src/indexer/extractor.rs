use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use super::walker::SupportedFormat;

pub fn extract_text(path: &Path, format: SupportedFormat) -> Result<String> {
    match format {
        SupportedFormat::PlainText | SupportedFormat::Markdown => extract_plain_text(path),
        SupportedFormat::Pdf => extract_pdf(path),
        SupportedFormat::Docx => extract_docx(path),
    }
}

fn extract_plain_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read text file: {}", path.display()))?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        // Legacy exports are often latin-1; every byte maps to one char
        Err(e) => Ok(e.into_bytes().into_iter().map(char::from).collect()),
    }
}

fn extract_pdf(path: &Path) -> Result<String> {
    pdf_extract::extract_text(path)
        .with_context(|| format!("Failed to extract PDF text: {}", path.display()))
}

fn extract_docx(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open DOCX: {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read DOCX as ZIP: {}", path.display()))?;

    let mut xml_content = String::new();
    archive
        .by_name("word/document.xml")
        .context("No word/document.xml found in DOCX")?
        .read_to_string(&mut xml_content)?;

    Ok(docx_paragraphs(&xml_content).join("\n"))
}

/// Text of each non-empty `<w:p>` paragraph, runs concatenated.
fn docx_paragraphs(xml: &str) -> Vec<String> {
    xml.split("</w:p>")
        .map(|paragraph| xml_tag_text(paragraph, "w:t").concat())
        .filter(|text| !text.trim().is_empty())
        .collect()
}

fn xml_tag_text(xml: &str, tag: &str) -> Vec<String> {
    let open_tag = format!("<{}", tag);
    let close_tag = format!("</{}>", tag);
    let mut texts = Vec::new();
    let mut search_from = 0;

    while let Some(open_pos) = xml[search_from..].find(&open_tag) {
        let abs_open = search_from + open_pos;
        let after_name = abs_open + open_tag.len();
        // `<w:tab/>` and friends share the prefix; only `<w:t>` / `<w:t ...>` count
        if !matches!(xml[after_name..].chars().next(), Some('>') | Some(' ')) {
            search_from = after_name;
            continue;
        }
        let Some(tag_end) = xml[abs_open..].find('>') else {
            break;
        };
        let content_start = abs_open + tag_end + 1;
        let Some(close_pos) = xml[content_start..].find(&close_tag) else {
            break;
        };
        texts.push(unescape_xml(&xml[content_start..content_start + close_pos]));
        search_from = content_start + close_pos + close_tag.len();
    }

    texts
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
