//! Page rasterization: PDFs through Pdfium, single images passed through.

use std::io::Cursor;
use std::path::{Path, PathBuf};

#[cfg(feature = "rag-pdf")]
use pdfium_render::prelude::{PdfRenderConfig, Pdfium, PdfiumError};

/// A4 at 300 dpi.
pub const DEFAULT_RENDER_WIDTH: u32 = 2480;

#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("PDF rasterization is unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "rag-pdf")]
    #[error("Pdfium error: {0}")]
    Pdfium(#[from] PdfiumError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("page {page_index} out of range (document has {page_count} pages)")]
    PageOutOfRange { page_index: usize, page_count: usize },

    #[error("failed to encode page {page_index} as PNG: {source}")]
    Encode {
        page_index: usize,
        #[source]
        source: image::ImageError,
    },

    #[error("unsupported image data: {0}")]
    UnsupportedImage(String),
}

/// One rendered page, ready to be sent to the vision model.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 0-based page index.
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    pub mime_type: &'static str,
    pub data: Vec<u8>,
}

/// Turns document pages into images. Implementations may block.
pub trait PageRasterizer: Send + Sync {
    fn page_count(&self, path: &Path) -> Result<usize, RasterError>;

    fn render_page(&self, path: &Path, page_index: usize) -> Result<PageImage, RasterError>;
}

/// Wrap an image file as a single page, sniffing its real format.
pub fn image_page(bytes: Vec<u8>) -> Result<PageImage, RasterError> {
    let format =
        image::guess_format(&bytes).map_err(|e| RasterError::UnsupportedImage(e.to_string()))?;
    let mime_type = match format {
        image::ImageFormat::Png => "image/png",
        image::ImageFormat::Jpeg => "image/jpeg",
        other => {
            return Err(RasterError::UnsupportedImage(format!(
                "{} images are not supported",
                other.to_mime_type()
            )))
        }
    };
    let (width, height) = image::ImageReader::with_format(Cursor::new(&bytes), format)
        .into_dimensions()
        .map_err(|e| RasterError::UnsupportedImage(e.to_string()))?;

    Ok(PageImage {
        page_index: 0,
        width,
        height,
        mime_type,
        data: bytes,
    })
}

/// Rasterizer used by the binary. Fails when built without `rag-pdf`.
pub fn default_rasterizer(
    library_path: Option<PathBuf>,
    render_width: u32,
) -> Result<std::sync::Arc<dyn PageRasterizer>, RasterError> {
    #[cfg(feature = "rag-pdf")]
    {
        Ok(std::sync::Arc::new(PdfiumRasterizer::new(library_path, render_width)))
    }
    #[cfg(not(feature = "rag-pdf"))]
    {
        let _ = (library_path, render_width);
        Err(RasterError::Unavailable(
            "built without the rag-pdf feature".to_string(),
        ))
    }
}

/// Pdfium-backed rasterizer. The library is bound per call so a missing
/// runtime only fails the documents that need it.
#[cfg(feature = "rag-pdf")]
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    library_path: Option<PathBuf>,
    render_width: u32,
}

#[cfg(feature = "rag-pdf")]
impl PdfiumRasterizer {
    pub fn new(library_path: Option<PathBuf>, render_width: u32) -> Self {
        Self {
            library_path,
            render_width: render_width.max(1),
        }
    }

    fn bind(&self) -> Result<Pdfium, RasterError> {
        if let Some(path) = &self.library_path {
            if let Some(result) = try_bind_from_path(path) {
                return result.map_err(RasterError::from);
            }
        }
        load_pdfium().map_err(RasterError::from)
    }
}

#[cfg(feature = "rag-pdf")]
impl PageRasterizer for PdfiumRasterizer {
    fn page_count(&self, path: &Path) -> Result<usize, RasterError> {
        let pdfium = self.bind()?;
        let document = pdfium.load_pdf_from_file(path, None)?;
        Ok(document.pages().len() as usize)
    }

    fn render_page(&self, path: &Path, page_index: usize) -> Result<PageImage, RasterError> {
        use image::codecs::png::PngEncoder;
        use image::{ColorType, ImageEncoder};

        let pdfium = self.bind()?;
        let document = pdfium.load_pdf_from_file(path, None)?;
        let page_count = document.pages().len() as usize;
        let page = document
            .pages()
            .iter()
            .nth(page_index)
            .ok_or(RasterError::PageOutOfRange {
                page_index,
                page_count,
            })?;

        let render_config = PdfRenderConfig::new().set_target_width(self.render_width as i32);
        let bitmap = page.render_with_config(&render_config)?;

        let width = bitmap.width() as u32;
        let height = bitmap.height() as u32;
        let rgba = bitmap.as_rgba_bytes();

        let mut encoded = Vec::new();
        PngEncoder::new(&mut encoded)
            .write_image(&rgba, width, height, ColorType::Rgba8.into())
            .map_err(|source| RasterError::Encode { page_index, source })?;

        Ok(PageImage {
            page_index,
            width,
            height,
            mime_type: "image/png",
            data: encoded,
        })
    }
}

#[cfg(feature = "rag-pdf")]
fn load_pdfium() -> Result<Pdfium, PdfiumError> {
    for var in ["PDFIUM_LIBRARY_PATH", "PDFIUM_LIB_DIR", "PDFIUM_DYNAMIC_LIB_PATH"] {
        if let Some(value) = std::env::var_os(var) {
            if let Some(result) = try_bind_from_path(PathBuf::from(value)) {
                if result.is_ok() {
                    return result;
                }
            }
        }
    }

    for candidate in DEFAULT_PDFIUM_LOCATIONS {
        if let Some(result) = try_bind_from_path(candidate) {
            if result.is_ok() {
                return result;
            }
        }
    }

    match Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./")) {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(primary_err) => match Pdfium::bind_to_system_library() {
            Ok(bindings) => Ok(Pdfium::new(bindings)),
            Err(_) => Err(primary_err),
        },
    }
}

#[cfg(feature = "rag-pdf")]
fn try_bind_from_path(path: impl AsRef<Path>) -> Option<Result<Pdfium, PdfiumError>> {
    let path = path.as_ref();
    if path.is_dir() {
        let lib_path = Pdfium::pdfium_platform_library_name_at_path(path);
        Some(Pdfium::bind_to_library(lib_path).map(Pdfium::new))
    } else if path.exists() {
        Some(Pdfium::bind_to_library(path).map(Pdfium::new))
    } else {
        None
    }
}

#[cfg(feature = "rag-pdf")]
const DEFAULT_PDFIUM_LOCATIONS: &[&str] = &[
    "pdfium/lib/libpdfium.so",
    "pdfium/libpdfium.so",
    "libpdfium.so",
    "/usr/local/lib/libpdfium.so",
];

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::png::PngEncoder;
    use image::{ColorType, ImageEncoder};

    fn tiny_png(width: u32, height: u32) -> Vec<u8> {
        let pixels = vec![255u8; (width * height * 4) as usize];
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(&pixels, width, height, ColorType::Rgba8.into())
            .unwrap();
        out
    }

    #[test]
    fn png_files_become_a_single_page() {
        let page = image_page(tiny_png(3, 2)).unwrap();
        assert_eq!(page.page_index, 0);
        assert_eq!((page.width, page.height), (3, 2));
        assert_eq!(page.mime_type, "image/png");
    }

    #[test]
    fn garbage_is_not_an_image() {
        let err = image_page(b"definitely not pixels".to_vec()).unwrap_err();
        assert!(matches!(err, RasterError::UnsupportedImage(_)));
    }
}
