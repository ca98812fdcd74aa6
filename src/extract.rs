//! Text extraction for the supported document formats.
//!
//! [`FileLoader`] turns a file into [`TextSegment`]s: one per PDF page,
//! slide or worksheet, and one for plain text and CSV. An empty result
//! means the file holds no extractable text; an [`ExtractError`] means the
//! parser failed. Neither aborts a build.
//!
//! OOXML formats (docx, pptx, xlsx) are read with `zip` + `quick-xml`.
//! Every ZIP entry is read through a size cap to guard against zip bombs.
//! Legacy `.xls` workbooks are not OOXML and fail with an extraction error.

use std::io::Read;
use std::path::Path;

use findme_core::chunk::char_len;
use findme_core::models::TextSegment;
use quick_xml::events::Event;
use thiserror::Error;

use crate::files::extension;
use crate::layout::path_key;

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const PAGE_BREAK: char = '\u{0C}';

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported extension: {0}")]
    Unsupported(String),
    #[error("cannot read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("CSV parsing failed: {0}")]
    Csv(String),
    #[error("no extractable text")]
    NoText,
}

/// Turns a file into text segments.
///
/// Implementations must not return partial results silently: either every
/// segment that could be read, an empty vector, or an error.
pub trait DocumentLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Vec<TextSegment>, ExtractError>;
}

/// Loader for every extension in [`SUPPORTED_EXTENSIONS`](crate::files::SUPPORTED_EXTENSIONS).
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLoader;

impl DocumentLoader for FileLoader {
    fn load(&self, path: &Path) -> Result<Vec<TextSegment>, ExtractError> {
        let ext = extension(path).unwrap_or_default();
        let source = path_key(path);
        let texts = match ext.as_str() {
            "txt" => vec![decode_text(&std::fs::read(path)?)],
            "csv" => vec![csv_to_text(&decode_text(&std::fs::read(path)?))?],
            "pdf" => extract_pdf(&std::fs::read(path)?)?,
            "docx" => vec![extract_docx(&std::fs::read(path)?)?],
            "pptx" => extract_pptx(&std::fs::read(path)?)?,
            "xlsx" | "xls" => extract_xlsx(&std::fs::read(path)?)?,
            other => return Err(ExtractError::Unsupported(other.to_string())),
        };

        Ok(texts
            .into_iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| TextSegment::new(source.clone(), t))
            .collect())
    }
}

/// Join a file's segments into the text that gets chunked.
///
/// The text starts with `File: <name>` so the name itself is searchable, and
/// is cut at `max_chars` characters with an explicit marker appended.
/// Returns `None` when no segment holds any text.
pub fn prepare_file_text(file_name: &str, segments: &[TextSegment], max_chars: usize) -> Option<String> {
    let body = segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if body.is_empty() {
        return None;
    }

    let mut text = format!("File: {}\n\n{}", file_name, body);
    if char_len(&text) > max_chars {
        tracing::warn!(file = file_name, max_chars, "file text truncated");
        text = text.chars().take(max_chars).collect();
        text.push_str(&format!("\n[content truncated: exceeded {} characters]", max_chars));
    }
    Some(text)
}

/// UTF-8 with BOM stripping; invalid sequences are replaced.
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Render CSV rows as `header: value` lines, one blank-line-separated block per row.
fn csv_to_text(content: &str) -> Result<String, ExtractError> {
    let mut rows = parse_csv(content)?.into_iter();
    let Some(headers) = rows.next() else {
        return Ok(String::new());
    };

    let blocks: Vec<String> = rows
        .filter(|row| row.iter().any(|v| !v.trim().is_empty()))
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, value)| {
                    let header = headers.get(i).map(String::as_str).unwrap_or("");
                    format!("{}: {}", header.trim(), value.trim())
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect();

    if blocks.is_empty() {
        // Header-only file: the header line is the content.
        return Ok(headers.join(", "));
    }
    Ok(blocks.join("\n\n"))
}

/// Minimal RFC 4180 parser: quoted fields, doubled quotes, CRLF or LF rows.
fn parse_csv(content: &str) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(ExtractError::Csv("unterminated quoted field".to_string()));
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(text.split(PAGE_BREAK).map(str::to_string).collect())
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entry names under `prefix` numbered like `prefix<N>.xml`, in numeric order.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml, b"p")
}

fn extract_pptx(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        slides.push(collect_text_runs(&xml, b"p")?);
    }
    Ok(slides)
}

/// Concatenate every `<*:t>` text run, breaking lines at the end of each
/// `<*:{block}>` element.
fn collect_text_runs(xml: &[u8], block: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == block && !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_xlsx(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut archive = open_archive(bytes)
        .map_err(|e| ExtractError::Ooxml(format!("not an OOXML workbook ({})", e)))?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };

    let mut sheets = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        sheets.push(extract_sheet_rows(&xml, &shared_strings)?);
    }
    Ok(sheets)
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One line per row, cells separated by tabs. Shared strings are resolved;
/// numbers and inline strings are kept as written.
fn extract_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    let mut lines: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared = false;
    let mut cells = 0usize;

    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                let resolved = if shared {
                    value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i).cloned())
                } else {
                    Some(value.to_string())
                };
                if let Some(v) = resolved.filter(|v| !v.is_empty()) {
                    row.push(v);
                    cells += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared = false,
                b"row" => {
                    if !row.is_empty() {
                        lines.push(std::mem::take(&mut row).join("\t"));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        lines.push(row.join("\t"));
    }
    Ok(lines.join("\n"))
}
