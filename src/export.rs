//! Document export: fetch the document from the add-in and turn it into page
//! images.
//!
//! Rendering is delegated to a [`PageRasterizer`]. The default one drives the
//! poppler command-line tools and reads image dimensions from the PNGs they
//! produce.

use std::{
    collections::BTreeSet,
    io::Cursor,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{codecs::png::PngDecoder, ImageDecoder};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncReadExt, process::Command, time::timeout};
use tracing::{debug, info};

use crate::{bridge::Bridge, error::BridgeError};

pub const DEFAULT_SCALE: f32 = 1.0;
const MIN_SCALE: f32 = 0.1;
const MAX_SCALE: f32 = 8.0;
const POINTS_PER_INCH: f32 = 72.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageImage {
    pub page_number: u32,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RasterizedDocument {
    pub total_pages: u32,
    pub pages: Vec<PageImage>,
}

/// Binary document in, ordered page images out.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    async fn rasterize(
        &self,
        document: &[u8],
        scale: f32,
        pages: Option<&[u32]>,
    ) -> Result<RasterizedDocument, BridgeError>;
}

pub fn clamp_scale(scale: Option<f32>) -> f32 {
    match scale {
        Some(value) if value.is_finite() => value.clamp(MIN_SCALE, MAX_SCALE),
        _ => DEFAULT_SCALE,
    }
}

/// Resolves a 1-based page filter against the document's page count.
///
/// Out-of-range numbers are ignored and duplicates collapse; the result is
/// ascending. No filter selects every page.
pub fn select_pages(total_pages: u32, filter: Option<&[u32]>) -> Vec<u32> {
    match filter {
        None => (1..=total_pages).collect(),
        Some(requested) => requested
            .iter()
            .copied()
            .filter(|page| (1..=total_pages).contains(page))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    }
}

/// Reads width and height from an encoded PNG.
pub fn png_dimensions(bytes: &[u8]) -> Result<(u32, u32), BridgeError> {
    let decoder = PngDecoder::new(Cursor::new(bytes))
        .map_err(|error| BridgeError::Export(format!("invalid page image: {error}")))?;
    Ok(decoder.dimensions())
}

/// Fetches the session's document and rasterizes the requested pages.
pub async fn export_pages(
    bridge: &Bridge,
    rasterizer: &dyn PageRasterizer,
    session_id: &str,
    scale: Option<f32>,
    pages: Option<&[u32]>,
    request_timeout: Duration,
) -> Result<RasterizedDocument, BridgeError> {
    let started_at = Instant::now();
    let document = bridge.export_document(session_id, request_timeout).await?;
    let scale = clamp_scale(scale);

    let rendered = rasterizer.rasterize(&document, scale, pages).await?;
    info!(
        session_id,
        document_bytes = document.len(),
        total_pages = rendered.total_pages,
        returned_pages = rendered.pages.len(),
        duration_ms = started_at.elapsed().as_millis() as u64,
        "document exported"
    );
    Ok(rendered)
}

#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    pdftoppm_bin: String,
    pdfinfo_bin: String,
    tool_timeout: Duration,
}

impl PdftoppmRasterizer {
    pub fn new(pdftoppm_bin: String, pdfinfo_bin: String, tool_timeout: Duration) -> Self {
        Self {
            pdftoppm_bin,
            pdfinfo_bin,
            tool_timeout,
        }
    }

    async fn page_count(&self, pdf_path: &Path) -> Result<u32, BridgeError> {
        let args = vec![pdf_path.to_string_lossy().to_string()];
        let output = run_tool(&self.pdfinfo_bin, &args, self.tool_timeout).await?;
        parse_page_count(&output).ok_or_else(|| {
            BridgeError::Export("could not read page count from pdfinfo output".to_string())
        })
    }

    async fn render_page(
        &self,
        pdf_path: &Path,
        out_dir: &Path,
        page: u32,
        dpi: u32,
    ) -> Result<PageImage, BridgeError> {
        let prefix = out_dir.join(format!("page-{page}"));
        let args = vec![
            "-png".to_string(),
            "-r".to_string(),
            dpi.to_string(),
            "-f".to_string(),
            page.to_string(),
            "-l".to_string(),
            page.to_string(),
            "-singlefile".to_string(),
            pdf_path.to_string_lossy().to_string(),
            prefix.to_string_lossy().to_string(),
        ];
        run_tool(&self.pdftoppm_bin, &args, self.tool_timeout).await?;

        let png_path = PathBuf::from(format!("{}.png", prefix.to_string_lossy()));
        let bytes = tokio::fs::read(&png_path).await.map_err(|error| {
            BridgeError::Export(format!("missing rendered page {page}: {error}"))
        })?;
        let (width, height) = png_dimensions(&bytes)?;

        Ok(PageImage {
            page_number: page,
            width,
            height,
            mime_type: "image/png".to_string(),
            data: STANDARD.encode(&bytes),
        })
    }
}

#[async_trait]
impl PageRasterizer for PdftoppmRasterizer {
    async fn rasterize(
        &self,
        document: &[u8],
        scale: f32,
        pages: Option<&[u32]>,
    ) -> Result<RasterizedDocument, BridgeError> {
        let workdir = tempfile::tempdir()
            .map_err(|error| BridgeError::Export(format!("failed to create temp dir: {error}")))?;
        let pdf_path = workdir.path().join("document.pdf");
        tokio::fs::write(&pdf_path, document)
            .await
            .map_err(|error| BridgeError::Export(format!("failed to write document: {error}")))?;

        let total_pages = self.page_count(&pdf_path).await?;
        let dpi = (POINTS_PER_INCH * scale).round().max(1.0) as u32;

        let mut images = Vec::new();
        for page in select_pages(total_pages, pages) {
            images.push(
                self.render_page(&pdf_path, workdir.path(), page, dpi)
                    .await?,
            );
        }

        Ok(RasterizedDocument {
            total_pages,
            pages: images,
        })
    }
}

fn parse_page_count(pdfinfo_output: &str) -> Option<u32> {
    pdfinfo_output.lines().find_map(|line| {
        line.strip_prefix("Pages:")
            .and_then(|rest| rest.trim().parse::<u32>().ok())
    })
}

/// Runs a helper binary to completion and returns its stdout.
async fn run_tool(binary: &str, args: &[String], limit: Duration) -> Result<String, BridgeError> {
    let started_at = Instant::now();
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| BridgeError::Export(format!("failed to spawn {binary}: {error}")))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Export(format!("failed to capture {binary} stdout")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| BridgeError::Export(format!("failed to capture {binary} stderr")))?;

    let stdout_task = tokio::spawn(async move {
        let mut bytes = Vec::new();
        let _ = stdout.read_to_end(&mut bytes).await;
        bytes
    });
    let stderr_task = tokio::spawn(async move {
        let mut bytes = Vec::new();
        let _ = stderr.read_to_end(&mut bytes).await;
        bytes
    });

    let status = match timeout(limit, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(error)) => {
            return Err(BridgeError::Export(format!(
                "failed waiting for {binary}: {error}"
            )))
        }
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            return Err(BridgeError::Export(format!(
                "{binary} timed out after {}ms",
                limit.as_millis()
            )));
        }
    };

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();
    debug!(
        binary,
        code = status.code(),
        duration_ms = started_at.elapsed().as_millis() as u64,
        "helper finished"
    );

    if !status.success() {
        let stderr_text = String::from_utf8_lossy(&stderr_bytes).trim_end().to_string();
        return Err(BridgeError::Export(if stderr_text.is_empty() {
            format!("{binary} exited with {status}")
        } else {
            format!("{binary} failed: {stderr_text}")
        }));
    }

    Ok(String::from_utf8_lossy(&stdout_bytes).to_string())
}
