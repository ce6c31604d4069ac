use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, GrayImage, ImageFormat};
use reqwest::Client;
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;

/// One region reported by a detector, in raster pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub polygon: [(f32, f32); 4],
    /// `None` when the region was located but not decoded.
    pub payload: Option<String>,
}

#[async_trait]
pub trait CodeDetector: Send + Sync {
    async fn detect(&self, raster: &DynamicImage) -> Result<Vec<RawDetection>, DetectError>;

    /// Short name reported on heuristic results.
    fn method(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decoder responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to encode raster: {0}")]
    Encode(#[from] image::ImageError),

    #[error("detector crashed: {0}")]
    Crashed(String),
}

#[derive(Deserialize)]
struct DecodeResponse {
    #[serde(default)]
    codes: Vec<DecodedCode>,
}

#[derive(Deserialize)]
struct DecodedCode {
    points: [[f32; 2]; 4],
    #[serde(default)]
    data: Option<String>,
}

impl From<DecodedCode> for RawDetection {
    fn from(code: DecodedCode) -> Self {
        Self {
            polygon: code.points.map(|[x, y]| (x, y)),
            payload: code.data.filter(|d| !d.is_empty()),
        }
    }
}

/// Client for an external code-decoding service.
///
/// Posts the raster as a base64 PNG and expects
/// `{"codes": [{"points": [[x, y]; 4], "data": "..."}]}` back.
pub struct HttpCodeDetector {
    http: Client,
    url: String,
}

impl HttpCodeDetector {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DetectError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CodeDetector for HttpCodeDetector {
    async fn detect(&self, raster: &DynamicImage) -> Result<Vec<RawDetection>, DetectError> {
        let mut png = Cursor::new(Vec::new());
        raster.write_to(&mut png, ImageFormat::Png)?;

        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(png.into_inner()),
            "width": raster.width(),
            "height": raster.height(),
        });

        let response = self.http.post(&self.url).json(&request_body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let decoded: DecodeResponse = response.json().await?;
        Ok(decoded.codes.into_iter().map(RawDetection::from).collect())
    }

    fn method(&self) -> &'static str {
        "decoder"
    }
}

/// Finds square, half-dark blocks in a binarized raster.
///
/// The raster is cut into cells; a cell is busy when its dark-pixel share is
/// in the mixed band typical of 2D code modules. Connected busy cells form
/// candidate rectangles, which are kept when roughly square and big enough.
/// Nothing is decoded.
#[derive(Debug, Clone)]
pub struct ContourDetector {
    pub cell: u32,
    pub min_side: u32,
    pub min_aspect: f32,
    pub max_aspect: f32,
}

impl Default for ContourDetector {
    fn default() -> Self {
        Self {
            cell: 8,
            min_side: 30,
            min_aspect: 0.7,
            max_aspect: 1.3,
        }
    }
}

const DARK_THRESHOLD: u8 = 128;
const BUSY_BAND: (f32, f32) = (0.25, 0.75);
/// Minimum share of busy cells inside a candidate's rectangle.
const MIN_FILL: f32 = 0.6;

impl ContourDetector {
    pub fn scan(&self, gray: &GrayImage) -> Vec<RawDetection> {
        let cell = self.cell.max(1);
        let cols = gray.width().div_ceil(cell) as usize;
        let rows = gray.height().div_ceil(cell) as usize;
        if cols == 0 || rows == 0 {
            return Vec::new();
        }

        let mut busy = vec![false; cols * rows];
        for row in 0..rows {
            for col in 0..cols {
                let x0 = col as u32 * cell;
                let y0 = row as u32 * cell;
                let x1 = (x0 + cell).min(gray.width());
                let y1 = (y0 + cell).min(gray.height());
                let mut dark = 0u32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        if gray.get_pixel(x, y)[0] < DARK_THRESHOLD {
                            dark += 1;
                        }
                    }
                }
                let share = dark as f32 / ((x1 - x0) * (y1 - y0)) as f32;
                busy[row * cols + col] = share >= BUSY_BAND.0 && share <= BUSY_BAND.1;
            }
        }

        let mut seen = vec![false; busy.len()];
        let mut found = Vec::new();
        for start in 0..busy.len() {
            if !busy[start] || seen[start] {
                continue;
            }
            let component = flood(&busy, &mut seen, start, cols, rows);
            if let Some(detection) = self.candidate(&component, cols, cell, gray) {
                found.push(detection);
            }
        }
        found
    }

    fn candidate(
        &self,
        component: &[usize],
        cols: usize,
        cell: u32,
        gray: &GrayImage,
    ) -> Option<RawDetection> {
        let (mut c0, mut r0, mut c1, mut r1) = (usize::MAX, usize::MAX, 0, 0);
        for &i in component {
            let (r, c) = (i / cols, i % cols);
            c0 = c0.min(c);
            r0 = r0.min(r);
            c1 = c1.max(c);
            r1 = r1.max(r);
        }
        let cells = (c1 - c0 + 1) * (r1 - r0 + 1);
        if (component.len() as f32) < MIN_FILL * cells as f32 {
            return None;
        }

        let x0 = (c0 as u32 * cell) as f32;
        let y0 = (r0 as u32 * cell) as f32;
        let x1 = (((c1 + 1) as u32 * cell).min(gray.width())) as f32;
        let y1 = (((r1 + 1) as u32 * cell).min(gray.height())) as f32;
        let (w, h) = (x1 - x0, y1 - y0);
        if w < self.min_side as f32 || h < self.min_side as f32 {
            return None;
        }
        let aspect = w / h;
        if aspect < self.min_aspect || aspect > self.max_aspect {
            return None;
        }

        Some(RawDetection {
            polygon: [(x0, y0), (x1, y0), (x1, y1), (x0, y1)],
            payload: None,
        })
    }
}

/// 4-connected component of busy cells containing `start`.
fn flood(busy: &[bool], seen: &mut [bool], start: usize, cols: usize, rows: usize) -> Vec<usize> {
    let mut stack = vec![start];
    let mut component = Vec::new();
    seen[start] = true;
    while let Some(i) = stack.pop() {
        component.push(i);
        let (r, c) = (i / cols, i % cols);
        let mut visit = |j: usize| {
            if busy[j] && !seen[j] {
                seen[j] = true;
                stack.push(j);
            }
        };
        if c > 0 {
            visit(i - 1);
        }
        if c + 1 < cols {
            visit(i + 1);
        }
        if r > 0 {
            visit(i - cols);
        }
        if r + 1 < rows {
            visit(i + cols);
        }
    }
    component
}

#[async_trait]
impl CodeDetector for ContourDetector {
    async fn detect(&self, raster: &DynamicImage) -> Result<Vec<RawDetection>, DetectError> {
        let gray = raster.to_luma8();
        let detector = self.clone();
        tokio::task::spawn_blocking(move || detector.scan(&gray))
            .await
            .map_err(|e| DetectError::Crashed(e.to_string()))
    }

    fn method(&self) -> &'static str {
        "contour"
    }
}
