//! Windows and the tile grid that partitions a raster into them.
//!
//! Every computation walks the same [`TileGrid`]: row-major windows of
//! `tile_size × tile_size` pixels, with the last column and row clipped to
//! the raster edge. Formulas therefore never special-case edges.

use serde::{Deserialize, Serialize};

use crate::error::{RasterIndexError, Result};

/// A rectangular region of a raster in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    /// Create a new window.
    pub fn new(col_off: usize, row_off: usize, width: usize, height: usize) -> Self {
        Self {
            col_off,
            row_off,
            width,
            height,
        }
    }

    /// Number of pixels covered.
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Exclusive right edge.
    pub fn col_end(&self) -> usize {
        self.col_off + self.width
    }

    /// Exclusive bottom edge.
    pub fn row_end(&self) -> usize {
        self.row_off + self.height
    }

    /// Whether the window lies inside a `width × height` raster.
    pub fn fits_within(&self, width: usize, height: usize) -> bool {
        self.col_end() <= width && self.row_end() <= height
    }

    /// Whether the pixel `(col, row)` is inside the window.
    pub fn contains(&self, col: usize, row: usize) -> bool {
        col >= self.col_off && col < self.col_end() && row >= self.row_off && row < self.row_end()
    }

    /// Check if this window overlaps another.
    pub fn intersects(&self, other: &Window) -> bool {
        self.intersection(other).is_some()
    }

    /// The overlapping region of two windows, if any.
    pub fn intersection(&self, other: &Window) -> Option<Window> {
        let col_off = self.col_off.max(other.col_off);
        let row_off = self.row_off.max(other.row_off);
        let col_end = self.col_end().min(other.col_end());
        let row_end = self.row_end().min(other.row_end());

        if col_end <= col_off || row_end <= row_off {
            return None;
        }

        Some(Window::new(col_off, row_off, col_end - col_off, row_end - row_off))
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}+{}+{}",
            self.width, self.height, self.col_off, self.row_off
        )
    }
}

/// Deterministic row-major partition of a raster extent into windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    height: usize,
    width: usize,
    tile_size: usize,
}

impl TileGrid {
    /// Create a grid over a `height × width` raster.
    pub fn new(height: usize, width: usize, tile_size: usize) -> Result<Self> {
        if tile_size == 0 {
            return Err(RasterIndexError::Config(
                "tile_size must be > 0".to_string(),
            ));
        }

        Ok(Self {
            height,
            width,
            tile_size,
        })
    }

    /// Raster width covered by the grid.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Raster height covered by the grid.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Nominal window edge.
    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    /// Number of tile columns.
    pub fn tiles_across(&self) -> usize {
        self.width.div_ceil(self.tile_size)
    }

    /// Number of tile rows.
    pub fn tiles_down(&self) -> usize {
        self.height.div_ceil(self.tile_size)
    }

    /// Total number of windows.
    pub fn len(&self) -> usize {
        self.tiles_across() * self.tiles_down()
    }

    /// Whether the grid has no windows (zero-sized raster).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Window at tile position `(tile_col, tile_row)`.
    pub fn window(&self, tile_col: usize, tile_row: usize) -> Option<Window> {
        if tile_col >= self.tiles_across() || tile_row >= self.tiles_down() {
            return None;
        }

        let col_off = tile_col * self.tile_size;
        let row_off = tile_row * self.tile_size;
        Some(Window::new(
            col_off,
            row_off,
            self.tile_size.min(self.width - col_off),
            self.tile_size.min(self.height - row_off),
        ))
    }

    /// Iterate the windows in row-major order.
    ///
    /// Each call starts a fresh pass over the same sequence.
    pub fn iter(&self) -> TileGridIter {
        TileGridIter {
            grid: *self,
            next: 0,
        }
    }
}

impl<'a> IntoIterator for &'a TileGrid {
    type Item = Window;
    type IntoIter = TileGridIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the windows of a [`TileGrid`].
#[derive(Debug, Clone)]
pub struct TileGridIter {
    grid: TileGrid,
    next: usize,
}

impl Iterator for TileGridIter {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        let across = self.grid.tiles_across();
        if across == 0 || self.next >= self.grid.len() {
            return None;
        }

        let window = self.grid.window(self.next % across, self.next / across);
        self.next += 1;
        window
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileGridIter {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Count how many windows cover each pixel.
    fn coverage(grid: &TileGrid) -> Vec<u32> {
        let mut hits = vec![0u32; grid.width() * grid.height()];
        for window in grid {
            assert!(window.fits_within(grid.width(), grid.height()));
            assert!(window.width > 0 && window.height > 0);
            for row in window.row_off..window.row_end() {
                for col in window.col_off..window.col_end() {
                    hits[row * grid.width() + col] += 1;
                }
            }
        }
        hits
    }

    #[test]
    fn test_partition_covers_every_pixel_once() {
        for &(h, w, t) in &[
            (10, 10, 3),
            (7, 13, 5),
            (64, 64, 64),
            (65, 63, 16),
            (1, 1, 2048),
            (5, 100, 1),
        ] {
            let grid = TileGrid::new(h, w, t).unwrap();
            let hits = coverage(&grid);
            assert!(hits.iter().all(|&n| n == 1), "grid {}x{} tile {}", h, w, t);
            assert_eq!(grid.iter().count(), grid.len());
        }
    }

    #[test]
    fn test_row_major_order_with_clipped_edges() {
        let grid = TileGrid::new(5, 7, 4).unwrap();
        let windows: Vec<Window> = grid.iter().collect();

        assert_eq!(
            windows,
            vec![
                Window::new(0, 0, 4, 4),
                Window::new(4, 0, 3, 4),
                Window::new(0, 4, 4, 1),
                Window::new(4, 4, 3, 1),
            ]
        );
    }

    #[test]
    fn test_iteration_is_restartable() {
        let grid = TileGrid::new(100, 250, 64).unwrap();
        let first: Vec<Window> = grid.iter().collect();
        let second: Vec<Window> = grid.iter().collect();
        assert_eq!(first, second);
        assert_eq!(grid.iter().len(), 8);
    }

    #[test]
    fn test_zero_tile_size_rejected() {
        assert!(TileGrid::new(10, 10, 0).is_err());
    }

    #[test]
    fn test_empty_raster_yields_no_windows() {
        let grid = TileGrid::new(0, 10, 4).unwrap();
        assert!(grid.is_empty());
        assert_eq!(grid.iter().next(), None);
    }

    #[test]
    fn test_window_intersection() {
        let a = Window::new(0, 0, 10, 10);
        let b = Window::new(5, 8, 10, 10);
        let c = Window::new(10, 0, 5, 5);

        assert_eq!(a.intersection(&b), Some(Window::new(5, 8, 5, 2)));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(a.contains(9, 9));
        assert!(!a.contains(10, 0));
    }
}
