// Geometry helpers shared by everything that produces or consumes cell
// polygons: canonicalization, buffering, and population-level radius stats.

pub mod contours;
pub mod raster;

use geo::{Area, Geometry, MultiPolygon, Polygon};
use geo_clipper::{Clipper, EndType, JoinType};
use log::warn;
use rayon::prelude::*;
use std::f64::consts::PI;
use thiserror::Error;

// geo-clipper works on integer coordinates. Geometry is scaled by this factor
// going in, so this is the resolution (in steps per pixel) of every boolean
// and offset operation.
pub const CLIPPER_FACTOR: f64 = 1024.0;

// Maximum distance (in pixels) between a round join and the true arc.
const ARC_TOLERANCE: f64 = 0.1;

/// Radius of the disk with the same area as `shape`.
pub fn equivalent_radius<G: Area<f64>>(shape: &G) -> f64 {
    (shape.unsigned_area() / PI).sqrt()
}

/// Mean equivalent radius over a collection of shapes, or 0 if it is empty.
pub fn mean_radius<'a, G, I>(shapes: I) -> f64
where
    G: Area<f64> + 'a,
    I: IntoIterator<Item = &'a G>,
{
    let mut total = 0.0;
    let mut count = 0;
    for shape in shapes {
        total += equivalent_radius(shape);
        count += 1;
    }

    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

// Grow (distance > 0) or shrink (distance < 0) a shape with round joins.
pub fn buffer(shape: &MultiPolygon<f64>, distance: f64) -> MultiPolygon<f64> {
    shape.offset(
        distance,
        JoinType::Round(ARC_TOLERANCE * CLIPPER_FACTOR),
        EndType::ClosedPolygon,
        CLIPPER_FACTOR,
    )
}

// Self-union with non-zero filling. Removes self-intersections, splits
// figure-eights into separate parts, and drops zero-area slivers.
fn repair(shape: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    shape.union(&MultiPolygon::<f64>::new(Vec::new()), CLIPPER_FACTOR)
}

// Largest part of a multipolygon, reduced to its exterior ring.
fn largest_part(shape: MultiPolygon<f64>) -> Option<Polygon<f64>> {
    shape
        .into_iter()
        .map(|polygon| Polygon::new(polygon.exterior().clone(), Vec::new()))
        .filter(|polygon| polygon.unsigned_area() > 0.0)
        .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area()))
}

fn geometry_kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

// Why a geometry has no canonical polygon.
#[derive(Debug, Error, PartialEq)]
enum Rejection {
    #[error("Removing cell of type {0} with no area left after repair")]
    NoArea(&'static str),

    #[error("Removing cell of type GeometryCollection as it contains no Polygon geometry")]
    NoPolygonMember,

    #[error("Removing cell of unsupported type {0}")]
    Unsupported(&'static str),
}

fn canonical_polygon(geometry: Geometry<f64>) -> std::result::Result<Polygon<f64>, Rejection> {
    let kind = geometry_kind(&geometry);
    let cell = match geometry {
        Geometry::Polygon(polygon) => largest_part(repair(&MultiPolygon::new(vec![polygon]))),
        Geometry::MultiPolygon(multipolygon) => largest_part(repair(&multipolygon)),
        Geometry::Rect(rect) => largest_part(repair(&MultiPolygon::new(vec![rect.to_polygon()]))),
        Geometry::Triangle(triangle) => {
            largest_part(repair(&MultiPolygon::new(vec![triangle.to_polygon()])))
        }
        Geometry::GeometryCollection(collection) => {
            let mut polygons = Vec::new();
            let mut multipolygon_parts = Vec::new();
            for member in collection {
                match member {
                    Geometry::Polygon(polygon) => polygons.push(polygon),
                    Geometry::MultiPolygon(multipolygon) => multipolygon_parts.extend(multipolygon),
                    _ => {}
                }
            }

            let candidates = if polygons.is_empty() {
                multipolygon_parts
            } else {
                polygons
            };

            if candidates.is_empty() {
                return Err(Rejection::NoPolygonMember);
            }

            candidates
                .into_iter()
                .filter_map(|polygon| largest_part(repair(&MultiPolygon::new(vec![polygon]))))
                .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area()))
        }
        _ => return Err(Rejection::Unsupported(kind)),
    };

    cell.ok_or(Rejection::NoArea(kind))
}

/// Reduce any geometry to a single simple polygon without holes.
///
/// The geometry is first repaired. A polygon keeps only its outer boundary,
/// a multipolygon keeps its largest part. Geometry collections use their
/// largest polygon member, falling back to the largest part of any
/// multipolygon members. Anything else, or anything left without area after
/// repair, is discarded with a warning.
///
/// `None` means the cell should be dropped.
pub fn canonicalize(geometry: Geometry<f64>) -> Option<Polygon<f64>> {
    match canonical_polygon(geometry) {
        Ok(cell) => Some(cell),
        Err(rejection) => {
            warn!("{}", rejection);
            None
        }
    }
}

/// Grow every cell outward by `ratio` times the mean equivalent radius of
/// the whole collection.
///
/// The distance is pooled over the population rather than computed per cell,
/// so small and large cells gain the same margin. This approximates the
/// cytoplasm around a nucleus boundary.
pub fn expand_radius(cells: &mut [Polygon<f64>], ratio: Option<f64>) {
    let ratio = match ratio {
        Some(ratio) if ratio != 0.0 => ratio,
        _ => return,
    };

    if cells.is_empty() {
        return;
    }

    let distance = ratio * mean_radius(cells.iter());

    cells.par_iter_mut().for_each(|cell| {
        let expanded = buffer(&MultiPolygon::new(vec![cell.clone()]), distance);
        if let Some(expanded) = largest_part(expanded) {
            *cell = expanded;
        }
    });
}
