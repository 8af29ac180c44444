//! Page-by-page structured extraction through a vision model.
//!
//! Every page is isolated: rasterization errors, service errors, timeouts and
//! unparseable answers all end up as a [`PageResult`] for that page, never as
//! an error for the whole document. Only failures that make the document as a
//! whole unreadable escape as [`ExtractError`].

use super::raster::{image_page, PageImage, PageRasterizer, RasterError};
use super::schema::{Element, PageResult, RawElement};
use super::vision::{page_hint, VisionClient, VisionError, VisionResponse, EXTRACTION_PROMPT};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound on a single vision call.
pub const DEFAULT_VISION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported document format: {0}")]
    Unsupported(String),

    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: RasterError,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rasterizer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// How a case file is turned into page images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    /// A single raster image, treated as a one-page document.
    Image,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        match guess_mime_type(&path.to_string_lossy()) {
            "application/pdf" => Some(Self::Pdf),
            "image/png" | "image/jpeg" => Some(Self::Image),
            _ => None,
        }
    }
}

/// Guess MIME type from filename extension.
pub fn guess_mime_type(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Rough token count for text the service did not meter: ⌈chars / 4⌉.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Drives rasterizer and vision client over every page of a document.
#[derive(Clone)]
pub struct PageExtractor {
    rasterizer: Arc<dyn PageRasterizer>,
    vision: Arc<dyn VisionClient>,
    vision_timeout: Duration,
}

impl PageExtractor {
    pub fn new(
        rasterizer: Arc<dyn PageRasterizer>,
        vision: Arc<dyn VisionClient>,
        vision_timeout: Duration,
    ) -> Self {
        Self {
            rasterizer,
            vision,
            vision_timeout,
        }
    }

    /// Extract every page of `path` in document order.
    pub async fn extract(&self, path: &Path) -> Result<Vec<PageResult>, ExtractError> {
        match SourceKind::from_path(path) {
            Some(SourceKind::Pdf) => self.extract_pdf(path).await,
            Some(SourceKind::Image) => self.extract_image(path).await,
            None => Err(ExtractError::Unsupported(format!(
                "{} ({})",
                path.display(),
                guess_mime_type(&path.to_string_lossy())
            ))),
        }
    }

    /// Number of pages the document would yield, without calling the model.
    pub async fn page_count(&self, path: &Path) -> Result<usize, ExtractError> {
        match SourceKind::from_path(path) {
            Some(SourceKind::Pdf) => {
                let rasterizer = Arc::clone(&self.rasterizer);
                let owned = path.to_path_buf();
                tokio::task::spawn_blocking(move || rasterizer.page_count(&owned))
                    .await?
                    .map_err(|source| ExtractError::Open {
                        path: path.to_path_buf(),
                        source,
                    })
            }
            Some(SourceKind::Image) => Ok(1),
            None => Err(ExtractError::Unsupported(path.display().to_string())),
        }
    }

    async fn extract_pdf(&self, path: &Path) -> Result<Vec<PageResult>, ExtractError> {
        let total = self.page_count(path).await?;
        info!(path = %path.display(), pages = total, "extracting document");

        let mut pages = Vec::with_capacity(total);
        for index in 0..total {
            let page_number = (index + 1) as u32;
            let rasterizer = Arc::clone(&self.rasterizer);
            let owned = path.to_path_buf();
            let rendered =
                tokio::task::spawn_blocking(move || rasterizer.render_page(&owned, index)).await;

            let result = match rendered {
                Ok(Ok(image)) => self.analyze(&image, page_number).await,
                Ok(Err(e)) => {
                    warn!(page = page_number, error = %e, "page rasterization failed");
                    PageResult::failed(page_number, format!("rasterization failed: {e}"))
                }
                Err(e) => {
                    warn!(page = page_number, error = %e, "page rasterization task failed");
                    PageResult::failed(page_number, format!("rasterization failed: {e}"))
                }
            };
            pages.push(result);
        }
        Ok(pages)
    }

    async fn extract_image(&self, path: &Path) -> Result<Vec<PageResult>, ExtractError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ExtractError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let image = image_page(bytes).map_err(|e| {
            ExtractError::Unsupported(format!("{}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "extracting single-image document");
        Ok(vec![self.analyze(&image, 1).await])
    }

    async fn analyze(&self, image: &PageImage, page_number: u32) -> PageResult {
        let call = self.vision.analyze_page(image, page_number);
        let response = match tokio::time::timeout(self.vision_timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(page = page_number, error = %e, "vision call failed");
                return PageResult::failed(page_number, e.to_string());
            }
            Err(_) => {
                let e = VisionError::Timeout(self.vision_timeout);
                warn!(page = page_number, error = %e, "vision call failed");
                return PageResult::failed(page_number, e.to_string());
            }
        };
        parse_page_response(page_number, response)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PageResponse {
    #[serde(default, rename = "titlePage", alias = "titulo_pagina", alias = "title")]
    title: Option<String>,
    #[serde(default, alias = "confianza")]
    confidence: Value,
    #[serde(default, alias = "elementos")]
    elements: Vec<Value>,
}

/// Remove Markdown code fences around a model answer.
pub fn strip_code_fences(text: &str) -> &str {
    static OPEN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*```[A-Za-z]*[ \t]*\r?\n?").expect("valid fence regex"));
    static CLOSE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\r?\n?```\s*$").expect("valid fence regex"));

    let mut body = text.trim();
    if let Some(m) = OPEN.find(body) {
        body = &body[m.end()..];
    }
    if let Some(m) = CLOSE.find(body) {
        body = &body[..m.start()];
    }
    body.trim()
}

/// Turn a raw vision answer into a [`PageResult`].
///
/// Malformed JSON keeps the raw text and token counts with zero elements.
/// Elements that cannot be typed are dropped one by one.
pub fn parse_page_response(page_number: u32, response: VisionResponse) -> PageResult {
    let tokens_in = response
        .tokens_in
        .unwrap_or_else(|| estimate_tokens(EXTRACTION_PROMPT) + estimate_tokens(&page_hint(page_number)));
    let tokens_out = response
        .tokens_out
        .unwrap_or_else(|| estimate_tokens(&response.text));

    let mut result = PageResult {
        page: page_number,
        title: String::new(),
        confidence: None,
        elements: Vec::new(),
        raw: response.text,
        tokens_in,
        tokens_out,
        failure: None,
    };

    let parsed: PageResponse = match serde_json::from_str(strip_code_fences(&result.raw)) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(page = page_number, error = %e, "vision answer is not valid page JSON");
            result.failure = Some(format!("malformed response: {e}"));
            return result;
        }
    };

    result.title = parsed.title.unwrap_or_default().trim().to_string();
    result.confidence = parsed
        .confidence
        .as_f64()
        .or_else(|| parsed.confidence.as_str().and_then(|s| s.trim().parse().ok()))
        .map(|c| c.clamp(0.0, 1.0) as f32);

    for (index, value) in parsed.elements.into_iter().enumerate() {
        let element = serde_json::from_value::<RawElement>(value)
            .map_err(|e| e.to_string())
            .and_then(|raw| Element::try_from(raw).map_err(|e| e.to_string()));
        match element {
            Ok(element) => result.elements.push(element),
            Err(reason) => {
                warn!(page = page_number, element = index + 1, %reason, "dropping element");
            }
        }
    }

    normalize_positions(&mut result.elements);
    debug!(page = page_number, elements = result.elements.len(), "page parsed");
    result
}

/// Renumber positions 1..n in received order unless they already increase
/// strictly from 1 or above.
fn normalize_positions(elements: &mut [Element]) {
    let ordered = elements.first().is_none_or(|first| first.position >= 1)
        && elements.windows(2).all(|w| w[0].position < w[1].position);
    if ordered {
        return;
    }
    for (index, element) in elements.iter_mut().enumerate() {
        element.position = (index + 1) as u32;
    }
}
