// Running Baysor on transcript patches.

use log::{debug, info};
use regex::Regex;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use toml::{Table, Value};

use super::methods::PatchOutput;
use super::Patch;
use crate::errors::{Result, SegmentationError};

pub const ARTIFACT_FILE: &str = "segmentation_counts.loom";
pub const POLYGONS_FILE: &str = "segmentation_polygons.json";
pub const CONFIG_FILE: &str = "config.toml";
pub const TRANSCRIPTS_FILE: &str = "transcripts.csv";

// First release accepting `--polygon-format`.
const POLYGON_FORMAT_VERSION: (u32, u32, u32) = (0, 7, 0);

/// How polygons are requested on the command line, which changed in 0.7.0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolygonFormat {
    GeometryCollection,
    LegacyGeoJson,
}

/// Locate the baysor executable: on the `PATH`, or where the julia package
/// manager installs it.
pub fn find_executable() -> Result<PathBuf> {
    let cwd = env::current_dir().map_err(|err| SegmentationError::io(".", err))?;
    find_executable_in(env::var_os("PATH"), env::var_os("HOME"), &cwd)
}

fn find_executable_in(paths: Option<OsString>, home: Option<OsString>, cwd: &Path) -> Result<PathBuf> {
    if let Ok(path) = which::which_in("baysor", paths, cwd) {
        return Ok(path);
    }

    if let Some(home) = home {
        let default_path = PathBuf::from(home).join(".julia").join("bin").join("baysor");
        if default_path.is_file() {
            return Ok(default_path);
        }
    }

    Err(SegmentationError::Input(
        "baysor executable not found. Install baysor and put it on the PATH, or in ~/.julia/bin/baysor"
            .to_string(),
    ))
}

fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let re = Regex::new(r"(\d+)\.(\d+)\.(\d+)").ok()?;
    let caps = re.captures(text)?;
    Some((
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    ))
}

fn format_for_version(version: Option<(u32, u32, u32)>) -> PolygonFormat {
    match version {
        Some(version) if version >= POLYGON_FORMAT_VERSION => PolygonFormat::GeometryCollection,
        _ => PolygonFormat::LegacyGeoJson,
    }
}

// Ask the executable for its version. Anything unparseable is treated as an
// old release.
fn detect_polygon_format(executable: &Path) -> PolygonFormat {
    let version = Command::new(executable)
        .arg("--version")
        .output()
        .ok()
        .and_then(|output| parse_version(&String::from_utf8_lossy(&output.stdout)));
    debug!("baysor version: {:?}", version);
    format_for_version(version)
}

/// Arguments to `baysor`, run from a patch directory.
pub fn baysor_args(format: PolygonFormat, prior_shapes_key: Option<&str>) -> Vec<String> {
    let mut args = vec!["run".to_string()];
    match format {
        PolygonFormat::GeometryCollection => {
            args.extend(["--polygon-format".to_string(), "GeometryCollection".to_string()])
        }
        PolygonFormat::LegacyGeoJson => {
            args.extend(["--save-polygons".to_string(), "GeoJSON".to_string()])
        }
    }
    args.extend([
        "-c".to_string(),
        CONFIG_FILE.to_string(),
        TRANSCRIPTS_FILE.to_string(),
    ]);
    if let Some(key) = prior_shapes_key {
        args.push(format!(":{}", key));
    }
    args
}

/// Config used when none is given, reading transcripts from columns `x`,
/// `y`, and `gene_column`.
pub fn default_config(gene_column: &str) -> Table {
    let mut data = Table::new();
    data.insert("x".to_string(), Value::String("x".to_string()));
    data.insert("y".to_string(), Value::String("y".to_string()));
    data.insert("gene".to_string(), Value::String(gene_column.to_string()));
    data.insert("min_molecules_per_gene".to_string(), Value::Integer(10));
    data.insert("min_molecules_per_cell".to_string(), Value::Integer(20));
    data.insert("force_2d".to_string(), Value::Boolean(true));

    let mut segmentation = Table::new();
    segmentation.insert(
        "prior_segmentation_confidence".to_string(),
        Value::Float(0.8),
    );

    let mut config = Table::new();
    config.insert("data".to_string(), Value::Table(data));
    config.insert("segmentation".to_string(), Value::Table(segmentation));
    config
}

pub fn read_config(path: &Path) -> Result<Table> {
    let text = fs::read_to_string(path).map_err(|err| SegmentationError::io(path, err))?;
    Ok(text.parse::<Table>()?)
}

fn gene_column(config: &Table) -> Option<&str> {
    config
        .get("data")
        .and_then(|data| data.get("gene"))
        .and_then(Value::as_str)
        .filter(|gene| !gene.is_empty())
}

pub struct Baysor {
    executable: PathBuf,
    artifact: PathBuf,
    format: PolygonFormat,
    prior_shapes_key: Option<String>,
    config: Table,
}

impl Baysor {
    /// Set up a run with `executable`, probing its version to decide how to
    /// request polygons.
    pub fn new(executable: PathBuf, config: Table, prior_shapes_key: Option<String>) -> Result<Self> {
        let format = detect_polygon_format(&executable);
        Self::with_format(executable, config, format, prior_shapes_key)
    }

    pub fn with_format(
        executable: PathBuf,
        config: Table,
        format: PolygonFormat,
        prior_shapes_key: Option<String>,
    ) -> Result<Self> {
        if gene_column(&config).is_none() {
            return Err(SegmentationError::Input(
                "gene column not found in config['data']['gene']".to_string(),
            ));
        }

        Ok(Baysor {
            executable,
            artifact: PathBuf::from(ARTIFACT_FILE),
            format,
            prior_shapes_key,
            config,
        })
    }

    pub fn output() -> PatchOutput {
        PatchOutput::Polygons(PathBuf::from(POLYGONS_FILE))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn gene_column(&self) -> &str {
        gene_column(&self.config).unwrap_or_default()
    }

    pub fn args(&self) -> Vec<String> {
        baysor_args(self.format, self.prior_shapes_key.as_deref())
    }

    /// Write the config into every patch directory.
    pub fn write_configs(&self, patches: &[Patch]) -> Result<()> {
        let text = toml::to_string(&self.config)?;
        for patch in patches {
            let path = patch.path(Path::new(CONFIG_FILE));
            fs::write(&path, &text).map_err(|err| SegmentationError::io(&path, err))?;
        }
        info!(
            "Wrote baysor config (gene column '{}') to {} patches",
            self.gene_column(),
            patches.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patches::methods::SegmentationMethod;
    use crate::patches::tests::make_patches;
    use crate::patches::{PatchExecutor, PatchSegmenter, Scheduler};
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("0.7.1\n"), Some((0, 7, 1)));
        assert_eq!(parse_version("Baysor v0.6.2"), Some((0, 6, 2)));
        assert_eq!(parse_version("unknown"), None);

        assert_eq!(format_for_version(Some((0, 7, 0))), PolygonFormat::GeometryCollection);
        assert_eq!(format_for_version(Some((1, 0, 0))), PolygonFormat::GeometryCollection);
        assert_eq!(format_for_version(Some((0, 6, 9))), PolygonFormat::LegacyGeoJson);
        assert_eq!(format_for_version(None), PolygonFormat::LegacyGeoJson);
    }

    #[test]
    fn test_baysor_args() {
        assert_eq!(
            baysor_args(PolygonFormat::GeometryCollection, None),
            vec!["run", "--polygon-format", "GeometryCollection", "-c", "config.toml", "transcripts.csv"]
        );
        assert_eq!(
            baysor_args(PolygonFormat::LegacyGeoJson, Some("cell_id")),
            vec!["run", "--save-polygons", "GeoJSON", "-c", "config.toml", "transcripts.csv", ":cell_id"]
        );
    }

    #[test]
    fn test_config_requires_gene() {
        let mut config = default_config("feature_name");
        config.remove("data");
        let result = Baysor::with_format(
            PathBuf::from("baysor"),
            config,
            PolygonFormat::GeometryCollection,
            None,
        );
        assert!(matches!(result, Err(SegmentationError::Input(_))));

        let config: Table = "[data]\nx = \"x\"\ngene = \"\"\n".parse().unwrap();
        let result = Baysor::with_format(PathBuf::from("baysor"), config, PolygonFormat::LegacyGeoJson, None);
        assert!(matches!(result, Err(SegmentationError::Input(_))));
    }

    #[test]
    fn test_write_configs() {
        let cache = tempfile::tempdir().unwrap();
        let patches = make_patches(cache.path(), 2);

        let baysor = Baysor::with_format(
            PathBuf::from("baysor"),
            default_config("feature_name"),
            PolygonFormat::GeometryCollection,
            None,
        )
        .unwrap();
        assert_eq!(baysor.gene_column(), "feature_name");
        baysor.write_configs(&patches).unwrap();

        for patch in &patches {
            let config = read_config(&patch.dir.join(CONFIG_FILE)).unwrap();
            assert_eq!(config["data"]["gene"].as_str(), Some("feature_name"));
            assert_eq!(config["data"]["min_molecules_per_cell"].as_integer(), Some(20));
            assert_eq!(config["data"]["force_2d"].as_bool(), Some(true));
            assert_eq!(
                config["segmentation"]["prior_segmentation_confidence"].as_float(),
                Some(0.8)
            );
        }
    }

    fn write_script(path: &Path, mode: u32) {
        fs::write(path, "#!/bin/sh\necho 0.7.1\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_find_executable_skips_non_executable() {
        let decoy = tempfile::tempdir().unwrap();
        let real = tempfile::tempdir().unwrap();
        write_script(&decoy.path().join("baysor"), 0o644);
        write_script(&real.path().join("baysor"), 0o755);

        let paths = env::join_paths([decoy.path(), real.path()]).unwrap();
        let found = find_executable_in(Some(paths), None, real.path()).unwrap();
        assert_eq!(found, real.path().join("baysor"));
    }

    #[test]
    fn test_find_executable_julia_fallback() {
        let empty = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let paths = Some(empty.path().as_os_str().to_owned());

        let result = find_executable_in(paths.clone(), Some(home.path().as_os_str().to_owned()), empty.path());
        assert!(matches!(result, Err(SegmentationError::Input(_))));

        let julia_bin = home.path().join(".julia").join("bin");
        fs::create_dir_all(&julia_bin).unwrap();
        write_script(&julia_bin.join("baysor"), 0o755);
        let found = find_executable_in(paths, Some(home.path().as_os_str().to_owned()), empty.path()).unwrap();
        assert_eq!(found, julia_bin.join("baysor"));
    }

    #[test]
    fn test_run_with_fake_executable() {
        let bin = tempfile::tempdir().unwrap();
        let executable = bin.path().join("baysor");
        fs::write(
            &executable,
            "#!/bin/sh\n\
             if [ \"$1\" = \"--version\" ]; then echo 0.7.1; exit 0; fi\n\
             [ -f config.toml ] || exit 2\n\
             echo \"$@\" > args.txt\n\
             touch segmentation_counts.loom\n",
        )
        .unwrap();
        fs::set_permissions(&executable, fs::Permissions::from_mode(0o755)).unwrap();

        let cache = tempfile::tempdir().unwrap();
        let patches = make_patches(cache.path(), 2);

        let baysor = Baysor::new(executable, default_config("gene"), Some("cell".to_string())).unwrap();
        baysor.write_configs(&patches).unwrap();

        let method = SegmentationMethod::Baysor(baysor);
        assert_eq!(method.artifact(), Path::new(ARTIFACT_FILE));
        assert_eq!(method.output(), PatchOutput::Polygons(PathBuf::from(POLYGONS_FILE)));

        let runs = PatchExecutor::new(false, false)
            .run(&method, &patches, &Scheduler::Sequential)
            .unwrap();
        assert!(runs.iter().all(|run| run.succeeded()));

        for patch in &patches {
            assert!(patch.dir.join(ARTIFACT_FILE).exists());
            let args = fs::read_to_string(patch.dir.join("args.txt")).unwrap();
            assert_eq!(
                args.trim(),
                "run --polygon-format GeometryCollection -c config.toml transcripts.csv :cell"
            );
        }
    }
}
