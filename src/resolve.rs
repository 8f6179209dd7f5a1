// Consolidating per-patch segmentations into one set of cells.

use geo::{Area, Geometry, Polygon, Translate};
use geojson::GeoJson;
use log::{info, warn};
use ndarray::Array2;
use ndarray_npy::{read_npy, ReadNpyError};
use rayon::prelude::*;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::time::Instant;

use super::conflicts::{solve_conflicts, DEFAULT_THRESHOLD};
use super::errors::{Result, SegmentationError};
use super::patches::methods::PatchOutput;
use super::patches::Patch;
use super::shapes::contours::{geometrize, DEFAULT_SMOOTH_RADIUS_RATIO};
use super::shapes::{canonicalize, expand_radius};

#[derive(Clone, Debug)]
pub struct ResolveParams {
    pub threshold: f64,
    pub min_area: f64,
    pub expand_radius_ratio: Option<f64>,
    pub tolerance: Option<f64>,
    pub smooth_radius_ratio: f64,
}

impl Default for ResolveParams {
    fn default() -> Self {
        ResolveParams {
            threshold: DEFAULT_THRESHOLD,
            min_area: 0.0,
            expand_radius_ratio: None,
            tolerance: None,
            smooth_radius_ratio: DEFAULT_SMOOTH_RADIUS_RATIO,
        }
    }
}

/// Final cells in global coordinates.
pub struct ResolvedCells {
    pub polygons: Vec<Polygon<f64>>,

    // Patch each cell was segmented in, `None` for cells merged across patches.
    pub patches: Vec<Option<usize>>,

    // Index into the concatenation of every patch's cells, `None` when merged.
    pub sources: Vec<Option<usize>>,

    // For each concatenated patch cell, its position in `polygons` or -1.
    pub indices: Vec<i64>,
}

impl ResolvedCells {
    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    pub fn is_merged(&self, i: usize) -> bool {
        self.sources[i].is_none()
    }
}

// Label masks are whatever integer type the segmentation wrote.
fn read_label_mask(path: &Path) -> Result<Array2<u32>> {
    match read_npy::<_, Array2<u32>>(path) {
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        result => return Ok(result?),
    }
    match read_npy::<_, Array2<i32>>(path) {
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        result => return Ok(result?.mapv(|label| label.max(0) as u32)),
    }
    match read_npy::<_, Array2<u16>>(path) {
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        result => return Ok(result?.mapv(u32::from)),
    }
    match read_npy::<_, Array2<i64>>(path) {
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        result => return narrow_labels(result?, path, |label| u32::try_from(label.max(0)).ok()),
    }
    narrow_labels(read_npy::<_, Array2<u64>>(path)?, path, |label| {
        u32::try_from(label).ok()
    })
}

// Convert 64-bit labels, failing on any label that does not fit in a u32.
fn narrow_labels<T, F>(mask: Array2<T>, path: &Path, narrow: F) -> Result<Array2<u32>>
where
    T: Copy + Display,
    F: Fn(T) -> Option<u32>,
{
    let mut labels = Array2::<u32>::zeros(mask.dim());
    for (value, &label) in labels.iter_mut().zip(mask.iter()) {
        *value = narrow(label).ok_or_else(|| {
            SegmentationError::Input(format!(
                "label {} in {} does not fit in 32 bits",
                label,
                path.display()
            ))
        })?;
    }
    Ok(labels)
}

/// Read polygons from a GeoJSON file, canonicalizing each one. Feature
/// collections, single features, and (nested) geometry collections are
/// accepted.
pub fn read_polygons(path: &Path) -> Result<Vec<Polygon<f64>>> {
    let text = fs::read_to_string(path).map_err(|err| SegmentationError::io(path, err))?;
    let geojson: GeoJson = text.parse()?;

    let geometries: Vec<geojson::Geometry> = match geojson {
        GeoJson::FeatureCollection(collection) => collection
            .features
            .into_iter()
            .filter_map(|feature| feature.geometry)
            .collect(),
        GeoJson::Feature(feature) => feature.geometry.into_iter().collect(),
        GeoJson::Geometry(geometry) => match geometry.value {
            geojson::Value::GeometryCollection(members) => members,
            _ => vec![geometry],
        },
    };

    let mut cells = Vec::with_capacity(geometries.len());
    for geometry in geometries {
        let geometry: Geometry<f64> = geometry.value.try_into()?;
        if let Some(cell) = canonicalize(geometry) {
            cells.push(cell);
        }
    }
    Ok(cells)
}

/// Cells produced on one patch, in global coordinates, with cells smaller
/// than `min_area` removed. A patch without output yields no cells.
pub fn read_patch_cells(
    patch: &Patch,
    output: &PatchOutput,
    params: &ResolveParams,
) -> Result<Vec<Polygon<f64>>> {
    let path = patch.path(output.file());
    if !path.exists() {
        warn!(
            "Segmentation output {} not found, patch {} will have no cells",
            path.display(),
            patch.index
        );
        return Ok(Vec::new());
    }

    let cells = match output {
        PatchOutput::LabelMask(_) => {
            let mask = read_label_mask(&path)?;
            let (x0, y0) = patch.origin;
            geometrize(mask.view(), params.tolerance, params.smooth_radius_ratio)
                .into_iter()
                .map(|cell| cell.translate(x0, y0))
                .collect()
        }
        PatchOutput::Polygons(_) => read_polygons(&path)?,
    };

    Ok(cells
        .into_iter()
        .filter(|cell| cell.unsigned_area() >= params.min_area)
        .collect())
}

/// Read every patch's cells, merge cells duplicated across patches, and
/// optionally expand the result.
pub fn resolve_patches(
    patches: &[Patch],
    output: &PatchOutput,
    params: &ResolveParams,
) -> Result<ResolvedCells> {
    let t0 = Instant::now();
    let patch_cells = patches
        .par_iter()
        .map(|patch| read_patch_cells(patch, output, params))
        .collect::<Result<Vec<_>>>()?;

    let mut cells = Vec::new();
    let mut tags = Vec::new();
    for (patch, patch_cells) in patches.iter().zip(patch_cells) {
        tags.extend(std::iter::repeat(patch.index).take(patch_cells.len()));
        cells.extend(patch_cells);
    }
    info!(
        "Read {} cells from {} patches: {:?}",
        cells.len(),
        patches.len(),
        t0.elapsed()
    );

    let resolution = solve_conflicts(cells, params.threshold, Some(tags.as_slice()))?;

    let mut polygons = resolution.cells;
    expand_radius(&mut polygons, params.expand_radius_ratio);

    let cell_patches = resolution
        .sources
        .iter()
        .map(|source| source.map(|i| tags[i]))
        .collect();

    Ok(ResolvedCells {
        polygons,
        patches: cell_patches,
        sources: resolution.sources,
        indices: resolution.indices,
    })
}
