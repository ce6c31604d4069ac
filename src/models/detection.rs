use serde::{Deserialize, Serialize};
use strum::Display;

/// A point in document coordinate space (PDF points, origin top-left).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned box derived from a detection polygon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    /// Min/max over the given points. Returns a zero box at the origin for an empty slice.
    pub fn enclosing(points: &[Point]) -> Self {
        if points.is_empty() {
            return Self::from_corners(0.0, 0.0, 0.0, 0.0);
        }
        let (mut x1, mut y1) = (f64::INFINITY, f64::INFINITY);
        let (mut x2, mut y2) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in points {
            x1 = x1.min(p.x);
            y1 = y1.min(p.y);
            x2 = x2.max(p.x);
            y2 = y2.max(p.y);
        }
        Self::from_corners(x1, y1, x2, y2)
    }

    fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Area of the intersection with another box (0 when disjoint).
    pub fn intersection_area(&self, other: &BoundingBox) -> f64 {
        let dx = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let dy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        dx * dy
    }
}

/// Heuristic detectors only locate candidates; they never decode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
}

/// What is known about the content of a detected code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodeContent {
    /// Located and decoded by the primary decoder.
    Decoded { data: String },
    /// Located by the primary decoder, payload could not be read.
    Undecodable,
    /// Candidate region found by a fallback heuristic.
    Heuristic { method: String, confidence: Confidence },
}

impl CodeContent {
    pub fn payload(&self) -> Option<&str> {
        match self {
            CodeContent::Decoded { data } => Some(data),
            _ => None,
        }
    }
}

/// One located, optionally decoded, code on a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionResult {
    /// 1-based page number.
    pub page: u32,
    pub polygon: [Point; 4],
    pub bbox: BoundingBox,
    pub center: Point,
    pub content: CodeContent,
}

impl DetectionResult {
    /// Builds a result from a polygon already expressed in document coordinates.
    /// `bbox` and `center` are always derived, never supplied.
    pub fn from_polygon(page: u32, polygon: [Point; 4], content: CodeContent) -> Self {
        let bbox = BoundingBox::enclosing(&polygon);
        Self {
            page,
            polygon,
            center: bbox.center(),
            bbox,
            content,
        }
    }

    /// Converts a polygon measured in raster pixels into document coordinates.
    pub fn from_raster(
        page: u32,
        raster_polygon: [(f32, f32); 4],
        raster_size: (u32, u32),
        page_size: PageSize,
        content: CodeContent,
    ) -> Self {
        let scale = RasterScale::new(raster_size, page_size);
        let polygon = raster_polygon.map(|(x, y)| scale.to_document(x, y));
        Self::from_polygon(page, polygon, content)
    }
}

/// Page dimensions in document units (points).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

impl PageSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Raster dimensions for this page at the given resolution.
    pub fn pixels_at(&self, dpi: u32) -> (u32, u32) {
        let factor = dpi as f64 / 72.0;
        (
            (self.width * factor).round().max(1.0) as u32,
            (self.height * factor).round().max(1.0) as u32,
        )
    }
}

/// Pixel-to-document scale factors for one rendered raster.
#[derive(Debug, Clone, Copy)]
struct RasterScale {
    x: f64,
    y: f64,
}

impl RasterScale {
    fn new(raster_size: (u32, u32), page_size: PageSize) -> Self {
        let (w, h) = raster_size;
        Self {
            x: if w == 0 { 0.0 } else { page_size.width / w as f64 },
            y: if h == 0 { 0.0 } else { page_size.height / h as f64 },
        }
    }

    fn to_document(self, x: f32, y: f32) -> Point {
        Point::new(x as f64 * self.x, y as f64 * self.y)
    }
}

/// Drops detections whose box overlaps an already kept detection on the same
/// page by more than half of the smaller box. Keeps the first occurrence.
pub fn suppress_overlaps(detections: Vec<DetectionResult>) -> Vec<DetectionResult> {
    let mut kept: Vec<DetectionResult> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let overlaps = kept.iter().any(|existing| {
            existing.page == candidate.page && {
                let smaller = existing.bbox.area().min(candidate.bbox.area());
                existing.bbox.intersection_area(&candidate.bbox) > 0.5 * smaller
            }
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}
