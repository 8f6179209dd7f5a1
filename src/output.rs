use arrow::array::{ArrayRef, BooleanArray, Float64Array, UInt32Array};
use arrow::record_batch::RecordBatch;
use flate2::write::GzEncoder;
use flate2::Compression;
use geo::{Area, BoundingRect, Centroid, Polygon};
use log::info;
use ndarray_npy::write_npy;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression::ZSTD, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use super::errors::{Result, SegmentationError};
use super::resolve::ResolvedCells;
use super::schemas::{cell_metadata_schema, OutputFormat};
use super::shapes::raster::paint_label_mask;

fn create(filename: &str) -> Result<File> {
    File::create(filename).map_err(|err| SegmentationError::io(filename, err))
}

pub fn determine_format(filename: &str, fmt: OutputFormat) -> Result<OutputFormat> {
    if fmt != OutputFormat::Infer {
        return Ok(fmt);
    }

    if filename.ends_with(".csv.gz") {
        Ok(OutputFormat::CsvGz)
    } else if filename.ends_with(".csv") {
        Ok(OutputFormat::Csv)
    } else if filename.ends_with(".parquet") {
        Ok(OutputFormat::Parquet)
    } else {
        Err(SegmentationError::Input(format!(
            "unknown file format for: {}",
            filename
        )))
    }
}

pub fn write_table(filename: &str, fmt: OutputFormat, batch: &RecordBatch) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;
    let file = create(filename)?;

    match fmt {
        OutputFormat::Csv => {
            let mut writer = arrow::csv::Writer::new(file);
            writer.write(batch)?;
        }
        OutputFormat::CsvGz => {
            let mut writer = arrow::csv::Writer::new(GzEncoder::new(file, Compression::default()));
            writer.write(batch)?;
            writer
                .into_inner()
                .finish()
                .map_err(|err| SegmentationError::io(filename, err))?;
        }
        OutputFormat::Parquet => {
            let props = WriterProperties::builder()
                .set_compression(ZSTD(ZstdLevel::try_new(3)?))
                .build();
            let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
            writer.write(batch)?;
            writer.close()?;
        }
        OutputFormat::Infer => unreachable!(),
    }

    Ok(())
}

/// One row per cell: 1-based id, centroid, area, source patch (null when
/// merged across patches), and whether the cell is a merge.
pub fn write_cell_metadata(filename: &str, fmt: OutputFormat, cells: &ResolvedCells) -> Result<()> {
    let ncells = cells.len();
    let centroids: Vec<(f64, f64)> = cells
        .polygons
        .iter()
        .map(|cell| cell.centroid().map_or((f64::NAN, f64::NAN), |c| (c.x(), c.y())))
        .collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new((1..=ncells as u32).collect::<UInt32Array>()),
        Arc::new(centroids.iter().map(|(x, _)| *x).collect::<Float64Array>()),
        Arc::new(centroids.iter().map(|(_, y)| *y).collect::<Float64Array>()),
        Arc::new(
            cells
                .polygons
                .iter()
                .map(|cell| cell.unsigned_area())
                .collect::<Float64Array>(),
        ),
        Arc::new(
            cells
                .patches
                .iter()
                .map(|patch| patch.map(|p| p as u32))
                .collect::<UInt32Array>(),
        ),
        Arc::new(BooleanArray::from(
            (0..ncells).map(|i| cells.is_merged(i)).collect::<Vec<bool>>(),
        )),
    ];

    let batch = RecordBatch::try_new(Arc::new(cell_metadata_schema()), columns)?;
    write_table(filename, fmt, &batch)?;
    info!("Wrote metadata for {} cells to {}", ncells, filename);
    Ok(())
}

/// GeoJSON feature collection of cell polygons, gzipped if `filename` ends
/// in `.gz`.
pub fn write_cell_polygons(filename: &str, cells: &ResolvedCells) -> Result<()> {
    #[derive(Serialize)]
    struct CellFeature {
        #[serde(serialize_with = "geojson::ser::serialize_geometry")]
        geometry: Polygon<f64>,
        cell_id: usize,
        patch: Option<usize>,
    }

    let features: Vec<CellFeature> = cells
        .polygons
        .iter()
        .zip(&cells.patches)
        .enumerate()
        .map(|(i, (polygon, patch))| CellFeature {
            geometry: polygon.clone(),
            cell_id: i + 1,
            patch: *patch,
        })
        .collect();
    let text = geojson::ser::to_feature_collection_string(&features)?;

    let file = create(filename)?;
    let written = if filename.ends_with(".gz") {
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder
            .write_all(text.as_bytes())
            .and_then(|_| encoder.finish().map(|_| ()))
    } else {
        let mut file = file;
        file.write_all(text.as_bytes())
    };
    written.map_err(|err| SegmentationError::io(filename, err))?;

    info!("Wrote {} cell polygons to {}", features.len(), filename);
    Ok(())
}

/// Paint every cell into a `.npy` label mask covering all cells, cell `k`
/// (0-based) taking label `k + 1`.
pub fn write_label_mask(filename: &str, cells: &[Polygon<f64>]) -> Result<()> {
    let (mut nrows, mut ncols) = (0, 0);
    for rect in cells.iter().filter_map(|cell| cell.bounding_rect()) {
        nrows = nrows.max(rect.max().y.ceil().max(0.0) as usize + 1);
        ncols = ncols.max(rect.max().x.ceil().max(0.0) as usize + 1);
    }

    let mask = paint_label_mask(cells, (nrows, ncols));
    write_npy(filename, &mask)?;
    info!(
        "Wrote {}x{} label mask with {} cells to {}",
        nrows,
        ncols,
        cells.len(),
        filename
    );
    Ok(())
}
