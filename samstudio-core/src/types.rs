use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// Identity of an image: a content hash or a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl ImageId {
    /// SHA-256 of the encoded image bytes.
    pub fn from_content(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    pub fn from_path(path: &Path) -> Self {
        Self(format!("path:{}", path.display()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Unique identifier for an open session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an issue thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub Uuid);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session annotation identifier. Never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnnotationId(pub u64);

impl fmt::Display for AnnotationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pixel dimensions of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// An axis-aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Top-left corner X coordinate
    pub x: f32,
    /// Top-left corner Y coordinate
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle spanning two corners given as (x1, y1, x2, y2).
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }

    /// Whether the rectangle lies entirely inside an image of the given size.
    pub fn is_within(&self, size: ImageSize) -> bool {
        self.x >= 0.0
            && self.y >= 0.0
            && self.right() <= size.width as f32
            && self.bottom() <= size.height as f32
    }
}

/// A binary segmentation mask positioned in image coordinates.
///
/// `origin_x`/`origin_y` place the mask's top-left pixel in the image, which
/// lets a mask be moved without touching its pixel data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryMask {
    pub width: u32,
    pub height: u32,
    pub origin_x: i32,
    pub origin_y: i32,
    bits: Vec<bool>,
}

impl BinaryMask {
    /// Create a mask from row-major bits. Returns `None` if the length does
    /// not match `width * height`.
    pub fn new(width: u32, height: u32, bits: Vec<bool>) -> Option<Self> {
        let expected = (width as usize).checked_mul(height as usize)?;
        if bits.len() != expected {
            return None;
        }
        Some(Self {
            width,
            height,
            origin_x: 0,
            origin_y: 0,
            bits,
        })
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> Self {
        let mut bits = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                bits.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            origin_x: 0,
            origin_y: 0,
            bits,
        }
    }

    /// Decode column-free run-length counts, alternating background and
    /// foreground runs and starting with background.
    pub fn from_rle(width: u32, height: u32, counts: &[u32]) -> Option<Self> {
        let expected = (width as usize).checked_mul(height as usize)?;
        let mut bits = Vec::with_capacity(expected);
        let mut value = false;
        for &run in counts {
            if bits.len() + run as usize > expected {
                return None;
            }
            bits.extend(std::iter::repeat(value).take(run as usize));
            value = !value;
        }
        if bits.len() != expected {
            return None;
        }
        Self::new(width, height, bits)
    }

    pub fn to_rle(&self) -> Vec<u32> {
        let mut counts = Vec::new();
        let mut current = false;
        let mut run = 0u32;
        for &bit in &self.bits {
            if bit == current {
                run += 1;
            } else {
                counts.push(run);
                current = bit;
                run = 1;
            }
        }
        counts.push(run);
        counts
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.bits[(y as usize) * (self.width as usize) + x as usize]
    }

    /// Number of foreground pixels
    pub fn area(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Self {
        let mut moved = self.clone();
        moved.origin_x = self.origin_x.saturating_add(dx);
        moved.origin_y = self.origin_y.saturating_add(dy);
        moved
    }

    /// Tight bounding box of the foreground in image coordinates.
    pub fn bounding_box(&self) -> Option<Rect> {
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0u32;
        let mut max_y = 0u32;
        let mut any = false;

        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    any = true;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        if !any {
            return None;
        }

        Some(Rect::new(
            (min_x as i64 + self.origin_x as i64) as f32,
            (min_y as i64 + self.origin_y as i64) as f32,
            (max_x - min_x + 1) as f32,
            (max_y - min_y + 1) as f32,
        ))
    }

    /// Convex hull of the foreground pixels, counter-clockwise, in image
    /// coordinates. Each pixel contributes its four corners so a single pixel
    /// yields a unit square.
    pub fn convex_hull(&self) -> Vec<Point> {
        let mut corners: Vec<(i64, i64)> = Vec::new();
        for y in 0..self.height {
            // Only the extreme pixels of each row can lie on the hull.
            let row: Vec<u32> = (0..self.width).filter(|&x| self.get(x, y)).collect();
            let (Some(&first), Some(&last)) = (row.first(), row.last()) else {
                continue;
            };
            for x in [first, last + 1] {
                corners.push((x as i64, y as i64));
                corners.push((x as i64, y as i64 + 1));
            }
        }

        corners.sort_unstable();
        corners.dedup();
        if corners.len() < 3 {
            return Vec::new();
        }

        fn cross(o: (i64, i64), a: (i64, i64), b: (i64, i64)) -> i64 {
            (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
        }

        let mut lower: Vec<(i64, i64)> = Vec::new();
        for &p in &corners {
            while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0 {
                lower.pop();
            }
            lower.push(p);
        }

        let mut upper: Vec<(i64, i64)> = Vec::new();
        for &p in corners.iter().rev() {
            while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0 {
                upper.pop();
            }
            upper.push(p);
        }

        lower.pop();
        upper.pop();
        lower
            .into_iter()
            .chain(upper)
            .map(|(x, y)| {
                Point::new(
                    (x + self.origin_x as i64) as f32,
                    (y + self.origin_y as i64) as f32,
                )
            })
            .collect()
    }
}
