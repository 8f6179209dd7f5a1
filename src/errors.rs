use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SegmentationError>;

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error(
        "segmentation failed on patch {patch} ({status}) with command `{command}`:\n{stdout}{stderr}"
    )]
    ExternalTool {
        patch: usize,
        command: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    #[error("segmentation failed on all {npatches} patches")]
    BatchFailure { npatches: usize },

    #[error("merging cells {first} and {second} produced an empty geometry")]
    MergeFailed { first: usize, second: usize },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to read label mask: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error("unable to write label mask: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error(transparent)]
    GeoJson(#[from] geojson::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("unable to parse config: {0}")]
    TomlRead(#[from] toml::de::Error),

    #[error("unable to write config: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("unable to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl SegmentationError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SegmentationError::Io {
            path: path.into(),
            source,
        }
    }
}
