
// Schemas of the tables written by output.rs

use arrow::datatypes::{DataType, Field, Schema};
use clap::ValueEnum;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    Infer,
    Csv,
    CsvGz,
    Parquet,
}

pub fn cell_metadata_schema() -> Schema {
    Schema::new(vec![
        Field::new("cell_id", DataType::UInt32, false),
        Field::new("centroid_x", DataType::Float64, false),
        Field::new("centroid_y", DataType::Float64, false),
        Field::new("area", DataType::Float64, false),
        Field::new("patch", DataType::UInt32, true),
        Field::new("merged", DataType::Boolean, false),
    ])
}
