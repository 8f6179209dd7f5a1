// Filling polygons back onto the pixel grid.

use geo::{BoundingRect, Polygon};
use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use ndarray::{s, Array2, Zip};

// Exterior ring in window pixel coordinates with the closing vertex and
// repeated vertices removed.
fn window_ring(polygon: &Polygon<f64>, origin: (f64, f64)) -> Vec<Point<i32>> {
    let mut points: Vec<Point<i32>> = Vec::with_capacity(polygon.exterior().0.len());
    for coord in polygon.exterior().coords() {
        let point = Point::new(
            (coord.x - origin.0).round() as i32,
            (coord.y - origin.1).round() as i32,
        );
        if points.last() != Some(&point) {
            points.push(point);
        }
    }

    while points.len() > 1 && points.first() == points.last() {
        points.pop();
    }

    points
}

/// Fill the exterior ring of every polygon into a binary mask of `shape`
/// (rows, cols), where `origin` is the global coordinate of pixel (0, 0).
///
/// Vertices are rounded to the pixel grid, edges are included, and anything
/// outside the window is clipped.
pub fn rasterize<'a, I>(polygons: I, shape: (usize, usize), origin: (f64, f64)) -> Array2<u8>
where
    I: IntoIterator<Item = &'a Polygon<f64>>,
{
    let (nrows, ncols) = shape;
    if nrows == 0 || ncols == 0 {
        return Array2::zeros(shape);
    }

    let mut canvas = GrayImage::new(ncols as u32, nrows as u32);
    for polygon in polygons {
        let ring = window_ring(polygon, origin);
        match ring.len() {
            0 => {}
            1 => {
                let p = ring[0];
                if p.x >= 0 && p.y >= 0 && (p.x as usize) < ncols && (p.y as usize) < nrows {
                    canvas.put_pixel(p.x as u32, p.y as u32, Luma([1u8]));
                }
            }
            _ => draw_polygon_mut(&mut canvas, &ring, Luma([1u8])),
        }
    }

    Array2::from_shape_fn(shape, |(row, col)| canvas.get_pixel(col as u32, row as u32)[0])
}

/// Paint cells into an instance mask of `shape`, cell `k` taking label
/// `k + 1`. Where cells overlap the later one wins.
pub fn paint_label_mask(cells: &[Polygon<f64>], shape: (usize, usize)) -> Array2<u32> {
    let (nrows, ncols) = shape;
    let mut mask = Array2::<u32>::zeros(shape);

    for (k, cell) in cells.iter().enumerate() {
        let Some(rect) = cell.bounding_rect() else {
            continue;
        };

        let col_min = rect.min().x.floor().max(0.0) as usize;
        let row_min = rect.min().y.floor().max(0.0) as usize;
        let col_max = (rect.max().x.ceil().max(0.0) as usize + 1).min(ncols);
        let row_max = (rect.max().y.ceil().max(0.0) as usize + 1).min(nrows);
        if col_min >= col_max || row_min >= row_max {
            continue;
        }

        let window = rasterize(
            std::iter::once(cell),
            (row_max - row_min, col_max - col_min),
            (col_min as f64, row_min as f64),
        );

        let label = k as u32 + 1;
        Zip::from(mask.slice_mut(s![row_min..row_max, col_min..col_max]))
            .and(&window)
            .for_each(|m, &w| {
                if w != 0 {
                    *m = label;
                }
            });
    }

    mask
}
