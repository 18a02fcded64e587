//! rollcall-report — Attendance report output.
//!
//! A report is a title line followed by one numbered line per entry, in the
//! order given. Ordering is the caller's job.

use chrono::NaiveDate;
use printpdf::{BuiltinFont, Mm, PdfDocument};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const PAGE_WIDTH_MM: f32 = 210.0;
const PAGE_HEIGHT_MM: f32 = 297.0;
const MARGIN_MM: f32 = 20.0;
const LINE_HEIGHT_MM: f32 = 10.0;
const TITLE_SIZE_PT: f32 = 16.0;
const ENTRY_SIZE_PT: f32 = 12.0;
const MM_PER_PT: f32 = 25.4 / 72.0;

/// Helvetica advance widths for ' '..='~', in 1/1000 em.
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, // '0'..'?'
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, // '@'..'O'
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556, // 'P'..'_'
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, // '`'..'o'
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584, // 'p'..'~'
];
/// Width used for characters outside the table.
const HELVETICA_DEFAULT_WIDTH: u16 = 556;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("pdf generation failed: {0}")]
    Pdf(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Turns a title and an ordered list of entries into a document artifact.
pub trait ReportEmitter {
    /// Write the report and return where it was written.
    fn emit(&self, title: &str, entries: &[String]) -> Result<PathBuf, ReportError>;
}

pub fn daily_report_title(date: NaiveDate) -> String {
    format!("Attendance Report - {}", date.format("%Y-%m-%d"))
}

/// Same-day reports share a name, so a later run replaces an earlier one.
pub fn daily_report_file_name(date: NaiveDate) -> String {
    format!("attendance_report_{}.pdf", date.format("%Y-%m-%d"))
}

/// One positioned line of text.
#[derive(Debug, Clone, PartialEq)]
struct Line {
    text: String,
    size_pt: f32,
    x_mm: f32,
    /// Baseline height from the bottom of the page.
    y_mm: f32,
}

/// Rendered width of `text` in Helvetica at `size_pt`.
fn helvetica_width_mm(text: &str, size_pt: f32) -> f32 {
    let units: u32 = text
        .chars()
        .map(|c| {
            let w = (c as u32)
                .checked_sub(' ' as u32)
                .and_then(|i| HELVETICA_WIDTHS.get(i as usize))
                .copied()
                .unwrap_or(HELVETICA_DEFAULT_WIDTH);
            u32::from(w)
        })
        .sum();
    units as f32 / 1000.0 * size_pt * MM_PER_PT
}

/// Lay out the title and numbered entries on A4 pages.
fn layout(title: &str, entries: &[String]) -> Vec<Vec<Line>> {
    let top = PAGE_HEIGHT_MM - MARGIN_MM;
    let title_x = ((PAGE_WIDTH_MM - helvetica_width_mm(title, TITLE_SIZE_PT)) / 2.0).max(MARGIN_MM);
    let lines = std::iter::once((title.to_string(), TITLE_SIZE_PT, title_x)).chain(
        entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (format!("{}. {entry}", i + 1), ENTRY_SIZE_PT, MARGIN_MM)),
    );

    let mut pages = vec![Vec::new()];
    let mut y = top;
    for (text, size_pt, x_mm) in lines {
        if y < MARGIN_MM {
            pages.push(Vec::new());
            y = top;
        }
        if let Some(page) = pages.last_mut() {
            page.push(Line {
                text,
                size_pt,
                x_mm,
                y_mm: y,
            });
        }
        y -= LINE_HEIGHT_MM;
    }
    pages
}

/// Writes the report as an A4 PDF at a fixed path.
pub struct PdfReport {
    path: PathBuf,
}

impl PdfReport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Report for `date` inside `dir`, named by [`daily_report_file_name`].
    pub fn daily(dir: &Path, date: NaiveDate) -> Self {
        Self::new(dir.join(daily_report_file_name(date)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn render(&self, title: &str, entries: &[String]) -> Result<Vec<u8>, ReportError> {
        let pages = layout(title, entries);
        let (doc, first_page, first_layer) =
            PdfDocument::new(title, Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "Page 1");
        let font = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|e| ReportError::Pdf(e.to_string()))?;

        for (n, lines) in pages.iter().enumerate() {
            let (page, layer) = if n == 0 {
                (first_page, first_layer)
            } else {
                doc.add_page(Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), format!("Page {}", n + 1))
            };
            let layer = doc.get_page(page).get_layer(layer);
            for line in lines {
                layer.use_text(line.text.clone(), line.size_pt, Mm(line.x_mm), Mm(line.y_mm), &font);
            }
        }

        doc.save_to_bytes().map_err(|e| ReportError::Pdf(e.to_string()))
    }
}

impl ReportEmitter for PdfReport {
    fn emit(&self, title: &str, entries: &[String]) -> Result<PathBuf, ReportError> {
        let bytes = self.render(title, entries)?;

        if self.path.exists() {
            tracing::warn!(path = %self.path.display(), "replacing existing report");
        }
        fs::write(&self.path, bytes).map_err(|source| ReportError::Io {
            path: self.path.clone(),
            source,
        })?;

        tracing::info!(path = %self.path.display(), entries = entries.len(), "report written");
        Ok(self.path.clone())
    }
}
