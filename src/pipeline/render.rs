//! PDF rasterisation: document bytes → ordered page images.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto the blocking pool so the
//! Tokio workers driving other jobs never stall during rendering.
//!
//! Pages are PNG-encoded and base64-wrapped right here: the rest of the
//! pipeline only ever sees [`PageImage`], never a decoded bitmap, and images
//! are dropped as soon as extraction is done with them.

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Cursor;
use tracing::{debug, info};

/// One rasterised page, ready to attach to a model request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// 1-indexed page number in the source document.
    pub page_num: usize,
    /// Base64-encoded image bytes.
    pub data: String,
    pub mime_type: String,
}

/// `rasterize(documentBytes, pageLimit?) -> ordered sequence of page images`.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn rasterize(
        &self,
        document: &[u8],
        page_limit: Option<usize>,
    ) -> Result<Vec<PageImage>, AnalysisError>;

    /// Total page count without rendering anything.
    async fn page_count(&self, document: &[u8]) -> Result<usize, AnalysisError>;
}

/// [`Rasterizer`] backed by pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    dpi: u32,
    max_pixels: u32,
    password: Option<String>,
}

impl PdfiumRasterizer {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
            password: config.password.clone(),
        }
    }
}

#[async_trait]
impl Rasterizer for PdfiumRasterizer {
    async fn rasterize(
        &self,
        document: &[u8],
        page_limit: Option<usize>,
    ) -> Result<Vec<PageImage>, AnalysisError> {
        let bytes = document.to_vec();
        let (dpi, max_pixels) = (self.dpi, self.max_pixels);
        let password = self.password.clone();

        tokio::task::spawn_blocking(move || {
            render_blocking(&bytes, dpi, max_pixels, password.as_deref(), page_limit)
        })
        .await
        .map_err(|e| AnalysisError::Internal(format!("Render task panicked: {}", e)))?
    }

    async fn page_count(&self, document: &[u8]) -> Result<usize, AnalysisError> {
        let bytes = document.to_vec();
        let password = self.password.clone();

        tokio::task::spawn_blocking(move || {
            let pdfium = Pdfium::default();
            let doc = load(&pdfium, &bytes, password.as_deref())?;
            Ok(doc.pages().len() as usize)
        })
        .await
        .map_err(|e| AnalysisError::Internal(format!("Page-count task panicked: {}", e)))?
    }
}

fn load<'a>(
    pdfium: &'a Pdfium,
    bytes: &'a [u8],
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, AnalysisError> {
    pdfium.load_pdf_from_byte_slice(bytes, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.to_ascii_lowercase().contains("password") {
            AnalysisError::PasswordRequired
        } else {
            AnalysisError::CorruptPdf { detail: err_str }
        }
    })
}

/// Blocking implementation of page rendering.
fn render_blocking(
    bytes: &[u8],
    dpi: u32,
    max_pixels: u32,
    password: Option<&str>,
    page_limit: Option<usize>,
) -> Result<Vec<PageImage>, AnalysisError> {
    let pdfium = Pdfium::default();
    let document = load(&pdfium, bytes, password)?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    let wanted = page_limit.map_or(total_pages, |n| n.min(total_pages));
    info!("PDF loaded: {} pages, rendering {}", total_pages, wanted);

    let mut results = Vec::with_capacity(wanted);
    for idx in 0..wanted {
        let page_num = idx + 1;
        let page = pages
            .get(idx as u16)
            .map_err(|e| AnalysisError::RasterisationFailed {
                page: page_num,
                detail: format!("{:?}", e),
            })?;

        let render_config = PdfRenderConfig::new()
            .set_target_width(target_width(page.width().value, dpi, max_pixels))
            .set_maximum_height(max_pixels as i32);
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            AnalysisError::RasterisationFailed {
                page: page_num,
                detail: format!("{:?}", e),
            }
        })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            page_num,
            image.width(),
            image.height()
        );
        results.push(encode_page(page_num, &image)?);
    }

    Ok(results)
}

/// Pixel width for a page `width_pt` points wide at `dpi`, capped at `max_pixels`.
fn target_width(width_pt: f32, dpi: u32, max_pixels: u32) -> i32 {
    let px = (width_pt * dpi as f32 / 72.0).round() as i32;
    px.clamp(1, max_pixels as i32)
}

/// Encode a rendered page as base64 PNG.
///
/// PNG because it is lossless: JPEG artefacts on small print noticeably hurt
/// extraction of dates and dosages.
pub fn encode_page(page_num: usize, img: &DynamicImage) -> Result<PageImage, AnalysisError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| AnalysisError::RasterisationFailed {
            page: page_num,
            detail: format!("Image encoding failed: {}", e),
        })?;

    let data = STANDARD.encode(&buf);
    debug!("Encoded page {} → {} bytes base64", page_num, data.len());

    Ok(PageImage {
        page_num,
        data,
        mime_type: "image/png".to_string(),
    })
}
