//! Grid geometry: vectors, cell rectangles, and the Shape family used for
//! token selection, area effects, and the spawn region.
//!
//! Shapes are immutable. Bounds and polygon vertices are computed once at
//! construction; every query after that is allocation-free.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeomError {
    #[error("unknown shape kind '{0}'")]
    UnknownKind(String),
}

// ---------------------------------------------------------------------------
// Basic math
// ---------------------------------------------------------------------------

/// A grid cell coordinate (or a cell-space translation).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: i32,
    pub y: i32,
}

impl Vec2 {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn zero() -> Self {
        Self::new(0, 0)
    }

    pub fn shifted(self, d: Vec2) -> Self {
        Self::new(self.x + d.x, self.y + d.y)
    }

    /// Squared Euclidean distance to `other`, in cells.
    pub fn dist2(self, other: Vec2) -> i64 {
        let dx = (self.x - other.x) as i64;
        let dy = (self.y - other.y) as i64;
        dx * dx + dy * dy
    }
}

impl std::fmt::Display for Vec2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.x, self.y)
    }
}

/// An axis-aligned rectangle of whole grid cells.
///
/// Covers the half-open ranges `[x, x+w)` × `[y, y+h)`; `w` and `h` are
/// at least 1 for every token hitbox.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// The 1×1 rectangle covering a single cell.
    pub fn cell(p: Vec2) -> Self {
        Self::new(p.x, p.y, 1, 1)
    }

    /// Inclusive corner cells.
    pub fn corners(min: Vec2, max: Vec2) -> Self {
        Self::new(min.x, min.y, max.x - min.x + 1, max.y - min.y + 1)
    }

    pub fn min(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }

    /// Inclusive maximum cell.
    pub fn max(&self) -> Vec2 {
        Vec2::new(self.x + self.w - 1, self.y + self.h - 1)
    }

    pub fn contains_cell(&self, p: Vec2) -> bool {
        p.x >= self.x && p.x < self.x + self.w && p.y >= self.y && p.y < self.y + self.h
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.x + other.w
            && other.x < self.x + self.w
            && self.y < other.y + other.h
            && other.y < self.y + self.h
    }

    /// Overlapping region, if any.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let xe = (self.x + self.w).min(other.x + other.w);
        let ye = (self.y + self.h).min(other.y + other.h);
        if x < xe && y < ye {
            Some(Rect::new(x, y, xe - x, ye - y))
        } else {
            None
        }
    }

    pub fn translated(&self, d: Vec2) -> Rect {
        Rect::new(self.x + d.x, self.y + d.y, self.w, self.h)
    }

    /// Width/height swapped in place (a 90° turn around the origin cell).
    pub fn turned(&self) -> Rect {
        Rect::new(self.x, self.y, self.h, self.w)
    }

    /// All covered cells, row by row.
    pub fn cells(&self) -> impl Iterator<Item = Vec2> {
        let Rect { x, y, w, h } = *self;
        (0..h).flat_map(move |dy| (0..w).map(move |dx| Vec2::new(x + dx, y + dy)))
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{} {}x{}]", self.x, self.y, self.w, self.h)
    }
}

// ---------------------------------------------------------------------------
// Shape kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    /// Axis-aligned rectangle spanning start/end inclusive.
    Mask,
    /// Center at start, radius = |start − end|.
    Circle,
    /// Isosceles triangle: apex at start, base centered at end, base
    /// half-width = |start − end| / 2, orthogonal to the axis.
    Cone,
    /// Rectangle along the start→end axis, orthogonal extent |start − end|
    /// centered on the axis.
    Cube,
    /// Cube construction with the orthogonal extent fixed at one cell.
    Line,
}

impl ShapeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeKind::Mask => "mask",
            ShapeKind::Circle => "circle",
            ShapeKind::Cone => "cone",
            ShapeKind::Cube => "cube",
            ShapeKind::Line => "line",
        }
    }
}

impl FromStr for ShapeKind {
    type Err = GeomError;

    fn from_str(s: &str) -> Result<Self, GeomError> {
        match s {
            "mask" => Ok(ShapeKind::Mask),
            "circle" => Ok(ShapeKind::Circle),
            "cone" => Ok(ShapeKind::Cone),
            "cube" => Ok(ShapeKind::Cube),
            "line" => Ok(ShapeKind::Line),
            other => Err(GeomError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Shape
// ---------------------------------------------------------------------------

/// Wire/persist form of a [`Shape`]: kind plus the two defining cells.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShapeSpec {
    pub kind: ShapeKind,
    pub start: Vec2,
    pub end: Vec2,
}

/// An immutable selection/effect shape over the grid.
///
/// Structural equality is (kind, start, end) only; the cached bounds and
/// vertices never participate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ShapeSpec", into = "ShapeSpec")]
pub struct Shape {
    kind: ShapeKind,
    start: Vec2,
    end: Vec2,
    bounds: Rect,
    /// Convex polygon vertices (cone/cube/line only), consistent CCW winding.
    poly: Vec<(f64, f64)>,
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.start == other.start && self.end == other.end
    }
}

impl Eq for Shape {}

impl From<ShapeSpec> for Shape {
    fn from(spec: ShapeSpec) -> Self {
        Shape::new(spec.kind, spec.start, spec.end)
    }
}

impl From<Shape> for ShapeSpec {
    fn from(s: Shape) -> Self {
        ShapeSpec {
            kind: s.kind,
            start: s.start,
            end: s.end,
        }
    }
}

/// Tolerance for the edge-side test; boundary cells count as inside.
const EDGE_EPS: f64 = 1e-9;

impl Shape {
    pub fn new(kind: ShapeKind, start: Vec2, end: Vec2) -> Self {
        let poly = polygon(kind, start, end);
        let bounds = compute_bounds(kind, start, end, &poly);
        Self {
            kind,
            start,
            end,
            bounds,
            poly,
        }
    }

    /// Factory over an untrusted kind string.
    pub fn from_kind(kind: &str, start: Vec2, end: Vec2) -> Result<Self, GeomError> {
        Ok(Self::new(kind.parse()?, start, end))
    }

    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    pub fn start(&self) -> Vec2 {
        self.start
    }

    pub fn end(&self) -> Vec2 {
        self.end
    }

    /// Inclusive min/max cell rectangle covering the shape.
    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /// True iff start == end. A mask is never empty: a degenerate mask
    /// still covers its single cell.
    pub fn is_empty(&self) -> bool {
        self.kind != ShapeKind::Mask && self.start == self.end
    }

    /// The same shape with both defining cells translated by `d`.
    pub fn translated(&self, d: Vec2) -> Shape {
        Shape::new(self.kind, self.start.shifted(d), self.end.shifted(d))
    }

    pub fn contains(&self, p: Vec2) -> bool {
        match self.kind {
            ShapeKind::Mask => self.bounds.contains_cell(p),
            // Compare squared distances; no sqrt on the hot path.
            ShapeKind::Circle => p.dist2(self.start) <= self.end.dist2(self.start),
            ShapeKind::Cone | ShapeKind::Cube | ShapeKind::Line => {
                !self.is_empty() && poly_contains(&self.poly, p)
            }
        }
    }

    /// Rectangle query with the engine's selection semantics: a rectangle
    /// counts as inside as soon as *any* of its covered cells is contained.
    ///
    /// Evaluated over the intersection of the shape's bounds with the
    /// query, so the scan stays proportional to the overlap.
    pub fn contains_rect(&self, r: &Rect) -> bool {
        let Some(overlap) = self.bounds.intersection(r) else {
            return false;
        };
        match self.kind {
            ShapeKind::Mask => true,
            _ => overlap.cells().any(|c| self.contains(c)),
        }
    }

    /// Lazy enumeration of every covered cell. Finite and restartable:
    /// each call starts a fresh pass over the bounds.
    pub fn points(&self) -> impl Iterator<Item = Vec2> + '_ {
        self.bounds.cells().filter(move |c| self.contains(*c))
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}->{})", self.kind, self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Polygon helpers
// ---------------------------------------------------------------------------

/// Vertices for the polygon kinds, in consistent CCW winding.
/// Empty for mask/circle and for degenerate (start == end) shapes.
fn polygon(kind: ShapeKind, start: Vec2, end: Vec2) -> Vec<(f64, f64)> {
    let (sx, sy) = (start.x as f64, start.y as f64);
    let (ex, ey) = (end.x as f64, end.y as f64);
    let (dx, dy) = (ex - sx, ey - sy);
    let len = (dx * dx + dy * dy).sqrt();
    if len == 0.0 {
        return Vec::new();
    }
    // Unit axis and its orthogonal.
    let (ux, uy) = (dx / len, dy / len);
    let (px, py) = (-uy, ux);

    let mut verts = match kind {
        ShapeKind::Cone => {
            let half = len / 2.0;
            vec![
                (sx, sy),
                (ex + px * half, ey + py * half),
                (ex - px * half, ey - py * half),
            ]
        }
        ShapeKind::Cube | ShapeKind::Line => {
            let half = if kind == ShapeKind::Line {
                0.5
            } else {
                len / 2.0
            };
            vec![
                (sx + px * half, sy + py * half),
                (ex + px * half, ey + py * half),
                (ex - px * half, ey - py * half),
                (sx - px * half, sy - py * half),
            ]
        }
        ShapeKind::Mask | ShapeKind::Circle => Vec::new(),
    };

    if signed_area(&verts) < 0.0 {
        verts.reverse();
    }
    verts
}

fn signed_area(verts: &[(f64, f64)]) -> f64 {
    let mut acc = 0.0;
    for (i, &(ax, ay)) in verts.iter().enumerate() {
        let (bx, by) = verts[(i + 1) % verts.len()];
        acc += ax * by - bx * ay;
    }
    acc / 2.0
}

/// A point is inside a CCW convex polygon iff it lies on the positive side
/// of every directed edge.
fn poly_contains(verts: &[(f64, f64)], p: Vec2) -> bool {
    let (px, py) = (p.x as f64, p.y as f64);
    for (i, &(ax, ay)) in verts.iter().enumerate() {
        let (bx, by) = verts[(i + 1) % verts.len()];
        let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
        if cross < -EDGE_EPS {
            return false;
        }
    }
    true
}

fn compute_bounds(kind: ShapeKind, start: Vec2, end: Vec2, poly: &[(f64, f64)]) -> Rect {
    match kind {
        ShapeKind::Mask => Rect::corners(
            Vec2::new(start.x.min(end.x), start.y.min(end.y)),
            Vec2::new(start.x.max(end.x), start.y.max(end.y)),
        ),
        ShapeKind::Circle => {
            let r = ((end.dist2(start)) as f64).sqrt().ceil() as i32;
            Rect::corners(
                Vec2::new(start.x - r, start.y - r),
                Vec2::new(start.x + r, start.y + r),
            )
        }
        ShapeKind::Cone | ShapeKind::Cube | ShapeKind::Line => {
            if poly.is_empty() {
                return Rect::cell(start);
            }
            // Round each vertex outward, away from the centroid, so cells
            // the polygon only partially covers stay inside the bounds.
            let n = poly.len() as f64;
            let cx = poly.iter().map(|v| v.0).sum::<f64>() / n;
            let cy = poly.iter().map(|v| v.1).sum::<f64>() / n;
            let (mut min_x, mut min_y) = (i32::MAX, i32::MAX);
            let (mut max_x, mut max_y) = (i32::MIN, i32::MIN);
            for &(vx, vy) in poly {
                let rx = round_outward(vx, cx);
                let ry = round_outward(vy, cy);
                min_x = min_x.min(rx);
                min_y = min_y.min(ry);
                max_x = max_x.max(rx);
                max_y = max_y.max(ry);
            }
            Rect::corners(Vec2::new(min_x, min_y), Vec2::new(max_x, max_y))
        }
    }
}

fn round_outward(v: f64, center: f64) -> i32 {
    if v < center {
        v.floor() as i32
    } else {
        v.ceil() as i32
    }
}
