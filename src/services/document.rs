//! Document handles and page rasterization.

use async_trait::async_trait;
use image::DynamicImage;
use lopdf::{Dictionary, Document, Object};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

use crate::models::detection::PageSize;

/// An opened document: page count and per-page dimensions in points.
pub trait DocumentHandle: Send + Sync {
    fn page_count(&self) -> usize;

    /// `None` when the page index is out of range or its size is unreadable.
    fn page_size(&self, index: usize) -> Option<PageSize>;

    fn path(&self) -> &Path;
}

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentHandle>, DocumentError>;
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Renders page `index` (0-based) at `dpi` into an in-memory raster.
    async fn render_page(
        &self,
        document: &dyn DocumentHandle,
        index: usize,
        dpi: u32,
    ) -> Result<DynamicImage, RenderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("failed to parse document: {0}")]
    Parse(#[from] lopdf::Error),

    #[error("document has no pages")]
    Empty,

    #[error("document loader crashed: {0}")]
    Crashed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("page {0} is out of range")]
    OutOfRange(usize),

    #[error("renderer I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("renderer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("rendered raster is unreadable: {0}")]
    Image(#[from] image::ImageError),

    #[error("renderer crashed: {0}")]
    Crashed(String),
}

/// Page sizes of a PDF read once at open time.
#[derive(Debug)]
pub struct PdfDocument {
    path: PathBuf,
    pages: Vec<Option<PageSize>>,
}

impl PdfDocument {
    fn read(path: &Path) -> Result<Self, DocumentError> {
        let doc = Document::load(path)?;
        let pages: Vec<Option<PageSize>> = doc
            .get_pages()
            .values()
            .map(|id| {
                doc.get_dictionary(*id)
                    .ok()
                    .and_then(|page| page_size(&doc, page))
            })
            .collect();

        if pages.is_empty() {
            return Err(DocumentError::Empty);
        }
        Ok(Self {
            path: path.to_path_buf(),
            pages,
        })
    }
}

impl DocumentHandle for PdfDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_size(&self, index: usize) -> Option<PageSize> {
        self.pages.get(index).copied().flatten()
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Looks up an attribute on the page or, failing that, its ancestors.
fn inherited<'a>(doc: &'a Document, page: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
    let mut current = page;
    // Page trees are shallow; the bound guards against reference cycles.
    for _ in 0..32 {
        if let Ok(value) = current.get(key) {
            return Some(resolve(doc, value));
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn resolve<'a>(doc: &'a Document, object: &'a Object) -> &'a Object {
    match object {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(object),
        other => other,
    }
}

fn number(doc: &Document, object: &Object) -> Option<f64> {
    match resolve(doc, object) {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// Visible page size from MediaBox, with /Rotate applied.
fn page_size(doc: &Document, page: &Dictionary) -> Option<PageSize> {
    let media_box = inherited(doc, page, b"MediaBox")?.as_array().ok()?;
    if media_box.len() != 4 {
        return None;
    }
    let coords: Vec<f64> = media_box
        .iter()
        .map(|o| number(doc, o))
        .collect::<Option<_>>()?;
    let width = (coords[2] - coords[0]).abs();
    let height = (coords[3] - coords[1]).abs();
    if width == 0.0 || height == 0.0 {
        return None;
    }

    let rotate = inherited(doc, page, b"Rotate")
        .and_then(|o| number(doc, o))
        .unwrap_or(0.0) as i64;
    if rotate.rem_euclid(180) == 90 {
        Some(PageSize::new(height, width))
    } else {
        Some(PageSize::new(width, height))
    }
}

/// Opens PDFs with `lopdf` off the async runtime.
#[derive(Debug, Default, Clone)]
pub struct PdfDocumentLoader;

#[async_trait]
impl DocumentLoader for PdfDocumentLoader {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentHandle>, DocumentError> {
        let path = path.to_path_buf();
        let document = tokio::task::spawn_blocking(move || PdfDocument::read(&path))
            .await
            .map_err(|e| DocumentError::Crashed(e.to_string()))??;
        Ok(Arc::new(document))
    }
}

/// Rasterizes pages with poppler's `pdftoppm`.
///
/// Each call renders into its own temporary directory under `work_dir`; the
/// directory is removed when the call returns, on success or error. The child
/// process is killed if the call is dropped mid-render.
#[derive(Debug, Clone)]
pub struct PdftoppmRenderer {
    bin: String,
    work_dir: PathBuf,
}

impl PdftoppmRenderer {
    pub fn new(bin: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl PageRenderer for PdftoppmRenderer {
    async fn render_page(
        &self,
        document: &dyn DocumentHandle,
        index: usize,
        dpi: u32,
    ) -> Result<DynamicImage, RenderError> {
        if index >= document.page_count() {
            return Err(RenderError::OutOfRange(index));
        }
        let page = (index + 1).to_string();
        let resolution = dpi.to_string();

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix("page-")
            .tempdir_in(&self.work_dir)?;
        let prefix = scratch.path().join("raster");

        let output = Command::new(&self.bin)
            .args(["-f", page.as_str(), "-l", page.as_str()])
            .args(["-r", resolution.as_str()])
            .args(["-gray", "-png", "-singlefile"])
            .arg(document.path())
            .arg(&prefix)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(RenderError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let png = prefix.with_extension("png");
        let raster = tokio::task::spawn_blocking(move || image::open(png))
            .await
            .map_err(|e| RenderError::Crashed(e.to_string()))??;

        tracing::debug!(
            page = index + 1,
            dpi,
            width = raster.width(),
            height = raster.height(),
            "Page rendered"
        );
        Ok(raster)
    }
}
