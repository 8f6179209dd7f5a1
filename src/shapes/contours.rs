// Conversion of integer label masks into smoothed cell polygons.

use geo::{Coord, Geometry, LineString, MultiPolygon, Polygon, Simplify};
use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use log::{trace, warn};
use ndarray::{s, ArrayView2};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::time::Instant;

use super::{buffer, canonicalize, equivalent_radius};

pub const DEFAULT_SMOOTH_RADIUS_RATIO: f64 = 0.1;

// Contours with fewer points than this cannot enclose any area.
const MIN_CONTOUR_POINTS: usize = 4;

// Inclusive pixel extent of one label.
#[derive(Clone, Copy, Debug)]
struct LabelExtent {
    row_min: usize,
    row_max: usize,
    col_min: usize,
    col_max: usize,
}

impl LabelExtent {
    fn new(row: usize, col: usize) -> Self {
        LabelExtent {
            row_min: row,
            row_max: row,
            col_min: col,
            col_max: col,
        }
    }

    fn include(&mut self, row: usize, col: usize) {
        self.row_min = self.row_min.min(row);
        self.row_max = self.row_max.max(row);
        self.col_min = self.col_min.min(col);
        self.col_max = self.col_max.max(col);
    }
}

fn label_extents(mask: ArrayView2<u32>) -> Vec<(u32, LabelExtent)> {
    let mut extents: BTreeMap<u32, LabelExtent> = BTreeMap::new();
    for ((row, col), &label) in mask.indexed_iter() {
        if label == 0 {
            continue;
        }
        extents
            .entry(label)
            .and_modify(|extent| extent.include(row, col))
            .or_insert_with(|| LabelExtent::new(row, col));
    }
    extents.into_iter().collect()
}

// Outer contours of one label as a multi-part shape in mask coordinates.
// The label is cropped to its extent with a one pixel border so the border
// following never touches the image edge.
fn label_contours(mask: ArrayView2<u32>, label: u32, extent: &LabelExtent) -> MultiPolygon<f64> {
    let height = (extent.row_max - extent.row_min + 3) as u32;
    let width = (extent.col_max - extent.col_min + 3) as u32;
    let mut image = GrayImage::new(width, height);

    let window = mask.slice(s![
        extent.row_min..=extent.row_max,
        extent.col_min..=extent.col_max
    ]);
    for ((row, col), &value) in window.indexed_iter() {
        if value == label {
            image.put_pixel(col as u32 + 1, row as u32 + 1, Luma([255u8]));
        }
    }

    let x0 = extent.col_min as f64 - 1.0;
    let y0 = extent.row_min as f64 - 1.0;

    let parts = find_contours::<i32>(&image)
        .into_iter()
        .filter(|contour| {
            matches!(contour.border_type, BorderType::Outer)
                && contour.points.len() >= MIN_CONTOUR_POINTS
        })
        .map(|contour| {
            let ring: Vec<Coord<f64>> = contour
                .points
                .iter()
                .map(|p| Coord {
                    x: x0 + p.x as f64,
                    y: y0 + p.y as f64,
                })
                .collect();
            Polygon::new(LineString::from(ring), Vec::new())
        })
        .collect();

    MultiPolygon::new(parts)
}

// Mean equivalent radius over labels `1..=max_label`. Labels missing from the
// mask count as cells of radius 0.
fn mean_label_radius(shapes: &[MultiPolygon<f64>], max_label: u32) -> f64 {
    if max_label == 0 {
        return 0.0;
    }
    shapes.iter().map(equivalent_radius).sum::<f64>() / max_label as f64
}

/// Simplification tolerance suited to cells of the given mean radius.
pub fn default_tolerance(mean_radius: f64) -> f64 {
    if mean_radius < 10.0 {
        0.4
    } else if mean_radius < 20.0 {
        1.0
    } else {
        2.0
    }
}

// Morphological opening then closing (in that buffer order) to remove pixel
// staircases and thin spurs, followed by Douglas-Peucker simplification.
fn smooth(shape: MultiPolygon<f64>, radius: f64, tolerance: f64) -> Option<Polygon<f64>> {
    let shape = if radius > 0.0 {
        let shape = buffer(&shape, -radius);
        let shape = buffer(&shape, 2.0 * radius);
        buffer(&shape, -radius)
    } else {
        shape
    };

    canonicalize(Geometry::MultiPolygon(shape.simplify(&tolerance)))
}

/// Convert a label mask into one polygon per cell, ordered by label.
///
/// Every label present in the mask is traced, smoothed with a radius
/// proportional to the mean cell radius, simplified, and canonicalized. The
/// mean radius is taken over labels `1..=max(mask)`, absent labels counting
/// as empty cells.
/// Labels that vanish during smoothing are dropped. `tolerance` defaults to
/// a value chosen from the mean cell radius.
pub fn geometrize(
    mask: ArrayView2<u32>,
    tolerance: Option<f64>,
    smooth_radius_ratio: f64,
) -> Vec<Polygon<f64>> {
    let t0 = Instant::now();
    let extents = label_extents(mask);
    if extents.is_empty() {
        warn!("No cell was returned by the segmentation");
        return Vec::new();
    }

    let shapes: Vec<MultiPolygon<f64>> = extents
        .par_iter()
        .map(|(label, extent)| label_contours(mask, *label, extent))
        .collect();

    let max_label = extents.last().map_or(0, |(label, _)| *label);
    let mean_radius = mean_label_radius(&shapes, max_label);
    let smooth_radius = mean_radius * smooth_radius_ratio;
    let tolerance = tolerance.unwrap_or_else(|| default_tolerance(mean_radius));

    let cells: Vec<Polygon<f64>> = shapes
        .into_par_iter()
        .filter_map(|shape| smooth(shape, smooth_radius, tolerance))
        .collect();

    let ndropped = extents.len() - cells.len();
    if ndropped > 0 {
        warn!("Dropped {} cells that vanished during smoothing", ndropped);
    }
    trace!(
        "geometrized {} labels (mean radius {:.2}): {:?}",
        extents.len(),
        mean_radius,
        t0.elapsed()
    );

    cells
}
