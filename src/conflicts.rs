// Resolving overlapping cells, typically duplicates of the same cell
// segmented in the margin shared by two neighboring patches.

use geo::{Area, BoundingRect, Geometry, Intersects, Polygon};
use geo_clipper::Clipper;
use itertools::Itertools;
use log::{debug, info};
use petgraph::unionfind::UnionFind;
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashMap;
use std::time::Instant;

use super::errors::{Result, SegmentationError};
use super::progress::progress_bar;
use super::shapes::{canonicalize, CLIPPER_FACTOR};

pub const DEFAULT_THRESHOLD: f64 = 0.5;

// Bounding box of one cell, as stored in the R-tree.
struct CellBox {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for CellBox {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Outcome of conflict resolution.
pub struct Resolution {
    /// Non-conflicting cells. Untouched cells first appear in their original
    /// order, followed by merged cells in the order they were created.
    pub cells: Vec<Polygon<f64>>,

    /// For each resolved cell, the index of the input cell it is, or `None`
    /// if it is the union of several input cells.
    pub sources: Vec<Option<usize>>,

    /// For each input cell, its position in `cells`, or -1 if it was merged
    /// into another cell.
    pub indices: Vec<i64>,
}

// Pairs of intersecting cells, as (i, j) with i < j in lexicographic order.
// Pairs from the same patch are excluded.
fn candidate_pairs(cells: &[Polygon<f64>], patch_tags: Option<&[usize]>) -> Vec<(usize, usize)> {
    let boxes: Vec<CellBox> = cells
        .iter()
        .enumerate()
        .filter_map(|(index, cell)| {
            let rect = cell.bounding_rect()?;
            Some(CellBox {
                index,
                envelope: AABB::from_corners(
                    [rect.min().x, rect.min().y],
                    [rect.max().x, rect.max().y],
                ),
            })
        })
        .collect();
    let tree = RTree::bulk_load(boxes);

    tree.iter()
        .flat_map(|a| {
            tree.locate_in_envelope_intersecting(&a.envelope)
                .filter(move |b| a.index < b.index)
                .map(move |b| (a.index, b.index))
        })
        .filter(|&(i, j)| match patch_tags {
            Some(tags) => tags[i] != tags[j],
            None => true,
        })
        .filter(|&(i, j)| cells[i].intersects(&cells[j]))
        .sorted_unstable()
        .collect()
}

// Merge every candidate pair whose overlap is non-empty and at least
// `threshold` times the smaller cell's area. Merging is transitive: a cell overlapping an earlier
// merge is merged with the combined shape.
fn merge_conflicts(
    cells: Vec<Polygon<f64>>,
    pairs: &[(usize, usize)],
    threshold: f64,
) -> Result<Resolution> {
    let ncells = cells.len();

    // Original cells occupy slots 0..ncells, merged cells are appended.
    let mut arena = cells;
    let mut sets: UnionFind<usize> = UnionFind::new(ncells);

    // Arena slot holding the current shape of each set, indexed by set root.
    let mut slot: Vec<usize> = (0..ncells).collect();

    let pb = progress_bar(pairs.len(), "resolving conflicts");
    let mut nmerges = 0;
    for &(i, j) in pairs {
        pb.inc(1);
        let root_i = sets.find_mut(i);
        let root_j = sets.find_mut(j);
        if root_i == root_j {
            continue;
        }

        let a = &arena[slot[root_i]];
        let b = &arena[slot[root_j]];
        let overlap = a.intersection(b, CLIPPER_FACTOR).unsigned_area();
        if overlap <= 0.0 || overlap < threshold * a.unsigned_area().min(b.unsigned_area()) {
            continue;
        }

        let merged = canonicalize(Geometry::MultiPolygon(a.union(b, CLIPPER_FACTOR)))
            .ok_or(SegmentationError::MergeFailed {
                first: i,
                second: j,
            })?;
        arena.push(merged);

        sets.union(root_i, root_j);
        let root = sets.find_mut(root_i);
        slot[root] = arena.len() - 1;
        nmerges += 1;
    }
    pb.finish_and_clear();
    debug!("performed {} merges", nmerges);

    let final_slot: Vec<usize> = (0..ncells).map(|i| slot[sets.find_mut(i)]).collect();
    let kept: Vec<usize> = final_slot.iter().copied().sorted_unstable().dedup().collect();
    let position: HashMap<usize, usize> = kept.iter().enumerate().map(|(k, &s)| (s, k)).collect();

    let indices = final_slot
        .iter()
        .map(|&s| if s < ncells { position[&s] as i64 } else { -1 })
        .collect();
    let sources = kept.iter().map(|&s| (s < ncells).then_some(s)).collect();

    // `kept` is ascending, so this matches its order.
    let cells = arena
        .into_iter()
        .enumerate()
        .filter(|(s, _)| position.contains_key(s))
        .map(|(_, cell)| cell)
        .collect();

    Ok(Resolution {
        cells,
        sources,
        indices,
    })
}

/// Merge overlapping cells into a collection where no two cells overlap by
/// more than `threshold` of the smaller one.
///
/// With `patch_tags`, only cells from different patches are compared.
pub fn solve_conflicts(
    cells: Vec<Polygon<f64>>,
    threshold: f64,
    patch_tags: Option<&[usize]>,
) -> Result<Resolution> {
    if cells.is_empty() {
        return Err(SegmentationError::Input("no cells to resolve".to_string()));
    }

    if let Some(tags) = patch_tags {
        if tags.len() != cells.len() {
            return Err(SegmentationError::Input(format!(
                "{} patch tags given for {} cells",
                tags.len(),
                cells.len()
            )));
        }
    }

    let t0 = Instant::now();
    let ncells = cells.len();
    let pairs = candidate_pairs(&cells, patch_tags);
    debug!("found {} candidate conflicts: {:?}", pairs.len(), t0.elapsed());

    let resolution = merge_conflicts(cells, &pairs, threshold)?;
    info!(
        "Resolved {} cells into {} cells: {:?}",
        ncells,
        resolution.cells.len(),
        t0.elapsed()
    );

    Ok(resolution)
}
