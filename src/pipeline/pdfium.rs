//! PDF rasterization and text-layer extraction via Google PDFium.
//!
//! Both collaborators are stateless (`Send + Sync`). Each call loads a fresh
//! `Pdfium` handle inside a blocking task; the OS caches the dynamic library,
//! so repeat loads are cheap.

use async_trait::async_trait;
use pdfium_render::prelude::*;
use tracing::{debug, warn};

use super::traits::{Rasterizer, TextLayerExtractor};
use super::types::{Page, TextLayer};
use super::CollaboratorError;

/// Longest rendered side. Guards against absurd page sizes or DPI.
const MAX_DIMENSION_PX: u32 = 4096;

/// Rasterization DPI used by the orchestrator unless configured otherwise.
pub const DEFAULT_RENDER_DPI: u32 = 300;

/// PDF user-space units per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Environment variable pointing at the PDFium shared library.
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_DYNAMIC_LIB_PATH";

/// Load the PDFium dynamic library.
///
/// Discovery order:
/// 1. `PDFIUM_DYNAMIC_LIB_PATH` (explicit path to the library file)
/// 2. next to the running executable, or in its `lib/` sibling
/// 3. system library search paths
fn load_pdfium() -> Result<Pdfium, CollaboratorError> {
    if let Ok(path) = std::env::var(PDFIUM_LIB_PATH_ENV) {
        debug!(path = %path, "Loading PDFium from env var");
        let bindings = Pdfium::bind_to_library(&path).map_err(|e| {
            CollaboratorError::Unavailable(format!("failed to load PDFium from {path}: {e}"))
        })?;
        return Ok(Pdfium::new(bindings));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            for dir in [exe_dir.to_path_buf(), exe_dir.join("..").join("lib")] {
                let lib_path =
                    Pdfium::pdfium_platform_library_name_at_path(dir.to_string_lossy().as_ref());
                if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                    debug!(dir = %dir.display(), "Loaded PDFium next to executable");
                    return Ok(Pdfium::new(bindings));
                }
            }
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| {
        CollaboratorError::Unavailable(format!(
            "PDFium library not found. Set {PDFIUM_LIB_PATH_ENV} or install PDFium: {e}"
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

/// Encrypted and malformed documents are the caller's problem, not PDFium's.
fn map_load_error(e: PdfiumError) -> CollaboratorError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("password") || lower.contains("encrypt") {
        CollaboratorError::InvalidInput("PDF is encrypted".into())
    } else {
        CollaboratorError::InvalidInput(format!("failed to load PDF: {msg}"))
    }
}

/// Pixel size for a page at `dpi`, both sides clamped to `[1, MAX_DIMENSION_PX]`
/// with the aspect ratio preserved when capping.
fn compute_render_dimensions(width_points: f32, height_points: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);

    let longest = raw_w.max(raw_h);
    if longest > MAX_DIMENSION_PX as f32 {
        let ratio = MAX_DIMENSION_PX as f32 / longest;
        let w = ((raw_w * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        let h = ((raw_h * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        (w, h)
    } else {
        (raw_w as u32, raw_h as u32)
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, CollaboratorError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CollaboratorError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| CollaboratorError::Failed(format!("PDFium worker panicked: {e}")))?
}

// ═══════════════════════════════════════════════════════════
// Rasterizer
// ═══════════════════════════════════════════════════════════

pub struct PdfiumRasterizer;

impl PdfiumRasterizer {
    /// Fails fast when the library cannot be loaded.
    pub fn new() -> Result<Self, CollaboratorError> {
        load_pdfium()?;
        Ok(Self)
    }
}

fn render_all_pages(document_bytes: &[u8], dpi: u32) -> Result<Vec<Page>, CollaboratorError> {
    let pdfium = load_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(document_bytes, None)
        .map_err(map_load_error)?;

    let mut pages = Vec::new();
    for (i, page) in document.pages().iter().enumerate() {
        let index = i + 1;
        let width_points = page.width().value;
        let height_points = page.height().value;
        let (target_w, target_h) = compute_render_dimensions(width_points, height_points, dpi);

        let uncapped_w = (width_points * dpi as f32 / POINTS_PER_INCH) as u32;
        let uncapped_h = (height_points * dpi as f32 / POINTS_PER_INCH) as u32;
        if target_w != uncapped_w || target_h != uncapped_h {
            warn!(
                page = index,
                raw_width = uncapped_w,
                raw_height = uncapped_h,
                capped_width = target_w,
                capped_height = target_h,
                "Page dimensions capped to {MAX_DIMENSION_PX}px",
            );
        }

        let config = PdfRenderConfig::new()
            .set_target_width(target_w as i32)
            .set_maximum_height(target_h as i32)
            .render_form_data(true)
            .render_annotations(true);

        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| CollaboratorError::Failed(format!("page {index} rendering failed: {e}")))?;
        let image = bitmap.as_image().to_rgb8();

        debug!(page = index, width = image.width(), height = image.height(), "Rendered PDF page");
        pages.push(Page::new(index, image));
    }

    if pages.is_empty() {
        return Err(CollaboratorError::InvalidInput("PDF has no pages".into()));
    }
    Ok(pages)
}

#[async_trait]
impl Rasterizer for PdfiumRasterizer {
    async fn render(&self, document: &[u8], dpi: u32) -> Result<Vec<Page>, CollaboratorError> {
        let bytes = document.to_vec();
        run_blocking(move || render_all_pages(&bytes, dpi)).await
    }
}

// ═══════════════════════════════════════════════════════════
// Text layer
// ═══════════════════════════════════════════════════════════

pub struct PdfiumTextLayer;

impl PdfiumTextLayer {
    pub fn new() -> Result<Self, CollaboratorError> {
        load_pdfium()?;
        Ok(Self)
    }
}

fn extract_all_text(document_bytes: &[u8]) -> Result<TextLayer, CollaboratorError> {
    let pdfium = load_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(document_bytes, None)
        .map_err(map_load_error)?;

    let mut texts = Vec::new();
    for (i, page) in document.pages().iter().enumerate() {
        // A page whose text cannot be read contributes nothing.
        match page.text() {
            Ok(text) => texts.push(text.all()),
            Err(e) => warn!(page = i + 1, error = %e, "Skipping unreadable page text"),
        }
    }

    Ok(text_layer_from_pages(&texts))
}

/// Pages are joined with single newlines; whitespace-only output is `Absent`.
fn text_layer_from_pages(texts: &[String]) -> TextLayer {
    let joined = texts.join("\n");
    if joined.trim().is_empty() {
        TextLayer::Absent
    } else {
        TextLayer::Text(joined)
    }
}

#[async_trait]
impl TextLayerExtractor for PdfiumTextLayer {
    async fn extract_text(&self, document: &[u8]) -> Result<TextLayer, CollaboratorError> {
        let bytes = document.to_vec();
        run_blocking(move || extract_all_text(&bytes)).await
    }
}
