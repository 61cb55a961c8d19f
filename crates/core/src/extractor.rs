use crate::chunking::normalize_whitespace;
use crate::error::IngestError;
use crate::models::FileType;
use lopdf::Document;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    /// 1-based page number.
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor: Send + Sync {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

/// Extracts per-page text for any allow-listed file type that has an extractor.
pub fn extract_page_texts(
    extractor: &dyn PdfExtractor,
    path: &Path,
    file_type: FileType,
) -> Result<Vec<PageText>, IngestError> {
    match file_type {
        FileType::Pdf => extractor.extract_pages(path),
        FileType::Pptx | FileType::Docx => Err(IngestError::InvalidArgument(format!(
            "no text extractor for {file_type} files: {}",
            path.display()
        ))),
    }
}

fn selection_mark() -> Option<&'static Regex> {
    static MARK: OnceLock<Option<Regex>> = OnceLock::new();
    MARK.get_or_init(|| Regex::new(r":(?:un)?selected:").ok()).as_ref()
}

fn bullet_prefix() -> Option<&'static Regex> {
    static BULLET: OnceLock<Option<Regex>> = OnceLock::new();
    BULLET
        .get_or_init(|| Regex::new(r"^(?:[•●▪◦■□▶►·*]+|-+\s)\s*").ok())
        .as_ref()
}

/// Strips layout noise from extracted text while keeping line structure.
///
/// Removes checkbox selection marks, leading bullet glyphs, zero-width characters and
/// non-breaking spaces, and collapses runs of whitespace inside each line.
pub fn clean_page_text(raw: &str) -> String {
    let without_marks = match selection_mark() {
        Some(mark) => mark.replace_all(raw, " "),
        None => raw.into(),
    };

    without_marks
        .lines()
        .map(|line| {
            let line: String = line
                .chars()
                .filter(|ch| !matches!(ch, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}'))
                .collect();
            let collapsed = normalize_whitespace(&line);
            match bullet_prefix() {
                Some(bullet) => bullet.replace(&collapsed, "").into_owned(),
                None => collapsed,
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Splits cleaned page text into paragraphs on blank lines. Lines inside a paragraph are
/// joined with a single space.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }

    paragraphs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cleanup_removes_layout_noise() {
        assert!(selection_mark().is_some() && bullet_prefix().is_some());
        let raw = "• Annual\u{00A0}leave   is 15 days\n:selected: Approved\u{200B} by HR\n  - carry over   allowed";
        assert_eq!(
            clean_page_text(raw),
            "Annual leave is 15 days\nApproved by HR\ncarry over allowed"
        );
    }

    #[test]
    fn paragraphs_break_on_blank_lines() {
        let text = "Leave policy\napplies to all staff.\n\n\nSick leave\nneeds a note.\n";
        assert_eq!(
            split_paragraphs(text),
            vec![
                "Leave policy applies to all staff.".to_string(),
                "Sick leave needs a note.".to_string()
            ]
        );
        assert!(split_paragraphs("  \n\n ").is_empty());
    }

    #[test]
    fn broken_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.4\n%broken")?;

        let result = extract_page_texts(&LopdfExtractor, &path, FileType::Pdf);
        assert!(matches!(result, Err(IngestError::PdfParse(_))));
        Ok(())
    }

    #[test]
    fn office_files_have_no_extractor() {
        let result = extract_page_texts(&LopdfExtractor, Path::new("deck.pptx"), FileType::Pptx);
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
    }
}
