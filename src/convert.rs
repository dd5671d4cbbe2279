//! Document rasterization.
//!
//! Documents are rendered to one PNG per page by external tools:
//! - `pdftoppm` (poppler) for PDF
//! - Ghostscript (`gs`) for PostScript
//!
//! Pages are rendered into a temporary directory, loaded in page order,
//! filtered by the page selection and optionally stamped with their number.

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{DynamicImage, Rgba, RgbaImage};
use std::fs;
use std::io::ErrorKind;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::config::DocumentOptions;
use crate::error::{ConversionError, ConversionResult};

/// Default PDF rasterizer binary
pub const PDFTOPPM_BIN: &str = "pdftoppm";

/// Default PostScript rasterizer binary
pub const GHOSTSCRIPT_BIN: &str = "gs";

/// One rendered page
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// 1-based page number in the source document
    pub number: usize,
    pub image: DynamicImage,
}

/// Trait for document converters
pub trait DocumentConverter: Send + Sync {
    /// Render the pages of `path` selected by `options`, in page order
    fn convert(&self, path: &Path, options: &DocumentOptions) -> ConversionResult<Vec<RenderedPage>>;
}

/// Document formats recognized by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    PostScript,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "ps" | "eps" => Some(DocumentFormat::PostScript),
            _ => None,
        }
    }
}

// ============================================================================
// Page selection
// ============================================================================

/// Parsed page selection such as `1,3-5`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSelection {
    ranges: Vec<RangeInclusive<usize>>,
}

impl PageSelection {
    /// Parse a comma-separated list of 1-based pages and inclusive ranges
    pub fn parse(expr: &str) -> ConversionResult<Self> {
        let invalid = || ConversionError::InvalidPages(expr.to_string());
        let mut ranges = Vec::new();

        for part in expr.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let range = match part.split_once('-') {
                Some((start, end)) => {
                    let start: usize = start.trim().parse().map_err(|_| invalid())?;
                    let end: usize = end.trim().parse().map_err(|_| invalid())?;
                    start..=end
                }
                None => {
                    let page: usize = part.parse().map_err(|_| invalid())?;
                    page..=page
                }
            };
            if *range.start() == 0 || range.start() > range.end() {
                return Err(invalid());
            }
            ranges.push(range);
        }

        if ranges.is_empty() {
            return Err(invalid());
        }
        Ok(Self { ranges })
    }

    /// Sorted, deduplicated page numbers, checked against `total`.
    ///
    /// Ranges are bounds-checked before they are expanded, so the result never
    /// holds more than `total` pages.
    pub fn pages(&self, total: usize) -> ConversionResult<Vec<usize>> {
        let first_out_of_range = self
            .ranges
            .iter()
            .filter(|r| *r.end() > total)
            .map(|r| (*r.start()).max(total + 1))
            .min();
        if let Some(page) = first_out_of_range {
            return Err(ConversionError::PageOutOfRange { page, total });
        }

        let mut pages: Vec<usize> = self.ranges.iter().flat_map(|r| r.clone()).collect();
        pages.sort_unstable();
        pages.dedup();
        Ok(pages)
    }
}

// ============================================================================
// External tool converter
// ============================================================================

/// Converter that shells out to `pdftoppm` and Ghostscript
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    pdftoppm: PathBuf,
    ghostscript: PathBuf,
}

impl Default for ExternalConverter {
    fn default() -> Self {
        Self {
            pdftoppm: PathBuf::from(PDFTOPPM_BIN),
            ghostscript: PathBuf::from(GHOSTSCRIPT_BIN),
        }
    }
}

impl ExternalConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use specific tool binaries
    pub fn with_tools(pdftoppm: impl Into<PathBuf>, ghostscript: impl Into<PathBuf>) -> Self {
        Self {
            pdftoppm: pdftoppm.into(),
            ghostscript: ghostscript.into(),
        }
    }

    /// Whether at least one rasterizer can be launched
    pub fn probe(&self) -> bool {
        let launches = |tool: &Path, arg: &str| Command::new(tool).arg(arg).output().is_ok();
        launches(&self.pdftoppm, "-v") || launches(&self.ghostscript, "--version")
    }

    fn render_all(&self, path: &Path, format: DocumentFormat, options: &DocumentOptions, out_dir: &Path) -> ConversionResult<()> {
        if !(options.dpi.is_finite() && options.dpi > 0.0) {
            return Err(ConversionError::InvalidDpi(options.dpi));
        }
        let dpi = format!("{}", options.dpi.round() as u32);
        let (tool, mut cmd) = match format {
            DocumentFormat::Pdf => {
                let mut cmd = Command::new(&self.pdftoppm);
                cmd.arg("-png").arg("-r").arg(&dpi);
                if let Some(password) = &options.password {
                    cmd.arg("-upw").arg(password);
                }
                cmd.arg(path).arg(out_dir.join("page"));
                (&self.pdftoppm, cmd)
            }
            DocumentFormat::PostScript => {
                let mut cmd = Command::new(&self.ghostscript);
                cmd.args(["-dSAFER", "-dBATCH", "-dNOPAUSE", "-dQUIET", "-sDEVICE=png16m"])
                    .arg(format!("-r{}", dpi))
                    .arg(format!("-sOutputFile={}", out_dir.join("page-%d.png").display()))
                    .arg(path);
                (&self.ghostscript, cmd)
            }
        };

        let tool_name = tool.display().to_string();
        debug!("Rendering {} with {} at {} dpi", path.display(), tool_name, dpi);
        let output = cmd.output().map_err(|e| match e.kind() {
            ErrorKind::NotFound => ConversionError::ToolMissing(tool_name.clone()),
            _ => ConversionError::Io(e),
        })?;

        if !output.status.success() {
            return Err(ConversionError::ToolFailed {
                tool: tool_name,
                path: path.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl DocumentConverter for ExternalConverter {
    fn convert(&self, path: &Path, options: &DocumentOptions) -> ConversionResult<Vec<RenderedPage>> {
        let format = DocumentFormat::from_path(path)
            .ok_or_else(|| ConversionError::UnsupportedFormat(path.to_path_buf()))?;

        let out_dir = tempfile::tempdir()?;
        self.render_all(path, format, options, out_dir.path())?;
        load_rendered_pages(path, out_dir.path(), options)
    }
}

/// Load the page images rendered from `source` into `dir`.
///
/// Files are expected to be named `<prefix>-<page>.png`. The page selection
/// and page-number overlay of `options` are applied here.
pub fn load_rendered_pages(source: &Path, dir: &Path, options: &DocumentOptions) -> ConversionResult<Vec<RenderedPage>> {
    let files = collect_page_files(dir)?;
    if files.is_empty() {
        return Err(ConversionError::Empty(source.to_path_buf()));
    }

    let selected = match &options.pages {
        Some(expr) => PageSelection::parse(expr)?.pages(files.len())?,
        None => (1..=files.len()).collect(),
    };

    let scale = ((options.dpi / 72.0).round() as u32).max(1);
    let mut pages = Vec::with_capacity(selected.len());
    for number in selected {
        let mut image = image::open(&files[number - 1])?;
        if options.include_page_numbers {
            let mut rgba = image.to_rgba8();
            stamp_page_number(&mut rgba, number, scale);
            image = DynamicImage::ImageRgba8(rgba);
        }
        pages.push(RenderedPage { number, image });
    }
    Ok(pages)
}

/// Rendered page files in `dir`, ordered by the page number in their name
fn collect_page_files(dir: &Path) -> ConversionResult<Vec<PathBuf>> {
    let mut numbered: Vec<(usize, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "png").unwrap_or(false) {
            if let Some(number) = page_number_of(&path) {
                numbered.push((number, path));
            }
        }
    }
    numbered.sort_by_key(|(number, _)| *number);
    Ok(numbered.into_iter().map(|(_, path)| path).collect())
}

/// `page-07.png` -> 7
fn page_number_of(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    stem.rsplit_once('-')?.1.parse().ok()
}

// ============================================================================
// Page number overlay
// ============================================================================

/// Stamp `Page N` in the top-left corner, black on white
pub fn stamp_page_number(image: &mut RgbaImage, number: usize, scale: u32) {
    let text = format!("Page {}", number);
    let margin = 2 * scale;
    draw_text(
        image,
        margin,
        margin,
        &text,
        scale,
        Rgba([0, 0, 0, 255]),
        Rgba([255, 255, 255, 255]),
    );
}

/// Draw text with 8x8 glyphs enlarged by `scale`. Text does not wrap.
fn draw_text(image: &mut RgbaImage, x: u32, y: u32, text: &str, scale: u32, fg: Rgba<u8>, bg: Rgba<u8>) {
    let mut cursor_x = x;
    for ch in text.chars() {
        if cursor_x >= image.width() {
            break;
        }
        draw_char(image, cursor_x, y, ch, scale, fg, bg);
        cursor_x += 8 * scale;
    }
}

fn draw_char(image: &mut RgbaImage, x: u32, y: u32, ch: char, scale: u32, fg: Rgba<u8>, bg: Rgba<u8>) {
    let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
    for (row_idx, row) in glyph.iter().enumerate() {
        for bit in 0..8u32 {
            // font8x8 stores LSB as leftmost pixel
            let color = if (row >> bit) & 1 == 1 { fg } else { bg };
            for dy in 0..scale {
                for dx in 0..scale {
                    let px = x + bit * scale + dx;
                    let py = y + row_idx as u32 * scale + dy;
                    if px < image.width() && py < image.height() {
                        image.put_pixel(px, py, color);
                    }
                }
            }
        }
    }
}
