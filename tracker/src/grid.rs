use opencv::core::{Point, Rect, Size};

/// The square patch grid of the working resolution.
///
/// Patches are indexed in row-major order, `index = row * cols + col`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchGrid {
    side: i32,
    patch: i32,
}

impl PatchGrid {
    /// Creates a grid over a `side x side` image split into `patch x patch` patches.
    ///
    /// `side` must be a positive multiple of `patch`.
    pub fn new(side: i32, patch: i32) -> Self {
        debug_assert!(patch > 0 && side > 0 && side % patch == 0);
        Self { side, patch }
    }

    #[inline]
    pub fn side(&self) -> i32 {
        self.side
    }

    #[inline]
    pub fn patch_size(&self) -> i32 {
        self.patch
    }

    /// Number of patches along one axis.
    #[inline]
    pub fn cols(&self) -> i32 {
        self.side / self.patch
    }

    /// Total number of patches.
    #[inline]
    pub fn len(&self) -> usize {
        (self.cols() * self.cols()) as usize
    }

    /// Scales a point in a frame of `size` to working resolution.
    #[inline]
    pub fn to_working(&self, point: Point, size: Size) -> Point {
        Point::new(
            scale(point.x, self.side, size.width),
            scale(point.y, self.side, size.height),
        )
    }

    /// Scales a working resolution point back to a frame of `size`.
    #[inline]
    pub fn to_frame(&self, point: Point, size: Size) -> Point {
        Point::new(
            scale(point.x, size.width, self.side),
            scale(point.y, size.height, self.side),
        )
    }

    /// Whether `point` lies inside the working resolution image.
    #[inline]
    pub fn contains(&self, point: Point) -> bool {
        (0..self.side).contains(&point.x) && (0..self.side).contains(&point.y)
    }

    /// Gets the index of the patch containing the working resolution `point`.
    ///
    /// Returns `None` when `point` is outside of the grid.
    pub fn index_of(&self, point: Point) -> Option<usize> {
        if !self.contains(point) {
            return None;
        }
        let row = point.y / self.patch;
        let col = point.x / self.patch;
        Some((row * self.cols() + col) as usize)
    }

    /// Gets the working resolution center pixel of the patch at `index`.
    pub fn center_of(&self, index: usize) -> Point {
        debug_assert!(index < self.len());
        let cols = self.cols() as usize;
        let (row, col) = (index / cols, index % cols);
        let half = self.patch / 2;
        Point::new(col as i32 * self.patch + half, row as i32 * self.patch + half)
    }

    /// Clamps `point` into the working resolution image.
    #[inline]
    pub fn clamp(&self, point: Point) -> Point {
        Point::new(point.x.clamp(0, self.side - 1), point.y.clamp(0, self.side - 1))
    }
}

/// Moves `bbox` so that its center lands on `center` while keeping its size.
///
/// Coordinates saturate at the `i32` bounds.
pub fn recenter(bbox: Rect, center: Point) -> Rect {
    Rect::new(
        center.x.saturating_sub(bbox.width / 2),
        center.y.saturating_sub(bbox.height / 2),
        bbox.width,
        bbox.height,
    )
}

/// Center of `bbox` with integer division, saturating at the `i32` bounds.
#[inline]
pub fn center(bbox: Rect) -> Point {
    Point::new(
        bbox.x.saturating_add(bbox.width / 2),
        bbox.y.saturating_add(bbox.height / 2),
    )
}

#[inline]
fn scale(value: i32, to: i32, from: i32) -> i32 {
    (value as i64 * to as i64 / from as i64) as i32
}
