// Running a segmentation method independently on every patch of a tiled
// image. Each patch lives in its own directory under a cache directory,
// named by the patch index.

pub mod baysor;
pub mod methods;

use log::{debug, info, trace, warn};
use rayon::prelude::*;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::errors::{Result, SegmentationError};
use super::progress::progress_bar;

pub const PATCH_METADATA_FILE: &str = "patch.json";

#[derive(Debug, Default, Deserialize)]
struct PatchMetadata {
    #[serde(default)]
    origin: Option<[f64; 2]>,
}

/// One patch working directory.
#[derive(Clone, Debug, PartialEq)]
pub struct Patch {
    pub index: usize,
    pub dir: PathBuf,

    // Global pixel coordinate of the patch's (0, 0).
    pub origin: (f64, f64),
}

impl Patch {
    pub fn open(index: usize, dir: PathBuf) -> Result<Patch> {
        let metadata_path = dir.join(PATCH_METADATA_FILE);
        let metadata = if metadata_path.exists() {
            let text = fs::read_to_string(&metadata_path)
                .map_err(|err| SegmentationError::io(&metadata_path, err))?;
            serde_json::from_str(&text)?
        } else {
            PatchMetadata::default()
        };

        let origin = metadata.origin.map_or((0.0, 0.0), |[x, y]| (x, y));
        Ok(Patch { index, dir, origin })
    }

    pub fn path(&self, file: &Path) -> PathBuf {
        self.dir.join(file)
    }
}

/// Find every patch directory in `cache_dir`, ordered by index. Entries not
/// named by an integer are ignored.
pub fn discover_patches(cache_dir: &Path) -> Result<Vec<Patch>> {
    let entries = fs::read_dir(cache_dir).map_err(|err| SegmentationError::io(cache_dir, err))?;

    let mut patches = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| SegmentationError::io(cache_dir, err))?
            .path();
        if !path.is_dir() {
            continue;
        }

        let index = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse::<usize>().ok());
        if let Some(index) = index {
            patches.push(Patch::open(index, path)?);
        }
    }

    if patches.is_empty() {
        return Err(SegmentationError::Input(format!(
            "no patch directories found in {}",
            cache_dir.display()
        )));
    }

    patches.sort_by_key(|patch| patch.index);
    debug!("found {} patches in {}", patches.len(), cache_dir.display());
    Ok(patches)
}

/// Remove every patch directory. Only called once outputs are written.
pub fn delete_cache(patches: &[Patch]) -> Result<()> {
    for patch in patches {
        fs::remove_dir_all(&patch.dir).map_err(|err| SegmentationError::io(&patch.dir, err))?;
    }
    info!("Deleted {} patch directories", patches.len());
    Ok(())
}

/// Something that segments one patch, leaving its result in the patch
/// directory.
pub trait PatchSegmenter: Sync {
    fn name(&self) -> &str;

    /// File, relative to the patch directory, whose presence marks the patch
    /// as segmented.
    fn artifact(&self) -> &Path;

    fn segment(&self, patch: &Patch) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum PatchState {
    Pending,
    Running,
    Done { recovered: bool },
    Failed { message: String },
}

#[derive(Clone, Debug)]
pub struct PatchRun {
    pub patch: usize,
    pub state: PatchState,
}

impl PatchRun {
    fn new(patch: &Patch) -> PatchRun {
        PatchRun {
            patch: patch.index,
            state: PatchState::Pending,
        }
    }

    fn transition(&mut self, state: PatchState) {
        trace!("patch {}: {:?} -> {:?}", self.patch, self.state, state);
        self.state = state;
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.state, PatchState::Done { .. })
    }
}

/// Where patch jobs run.
pub enum Scheduler {
    Sequential,
    Pool(rayon::ThreadPool),
}

impl Scheduler {
    /// A pool of `nthreads` threads (all cores when `None`), or sequential
    /// execution for a single thread.
    pub fn new(nthreads: Option<usize>) -> Result<Scheduler> {
        match nthreads {
            Some(1) => Ok(Scheduler::Sequential),
            Some(n) => Ok(Scheduler::Pool(
                rayon::ThreadPoolBuilder::new().num_threads(n).build()?,
            )),
            None => Ok(Scheduler::Pool(rayon::ThreadPoolBuilder::new().build()?)),
        }
    }

    /// Run `op` in this scheduler, so nested rayon work uses its threads.
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match self {
            Scheduler::Sequential => op(),
            Scheduler::Pool(pool) => pool.install(op),
        }
    }

    // Apply `f` to every patch, stopping at the first error. Patches already
    // running when an error occurs are allowed to finish.
    fn try_map<T, F>(&self, patches: &[Patch], f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&Patch) -> Result<T> + Sync + Send,
    {
        match self {
            Scheduler::Sequential => patches.iter().map(f).collect(),
            Scheduler::Pool(pool) => pool.install(|| patches.par_iter().map(f).collect()),
        }
    }
}

/// Runs a segmenter on a batch of patches.
///
/// With `recover`, patches whose artifact already exists are skipped. With
/// `force`, a failing patch is logged and left without cells instead of
/// aborting the batch, as long as at least one patch succeeds.
#[derive(Clone, Copy, Debug, Default)]
pub struct PatchExecutor {
    pub recover: bool,
    pub force: bool,
}

impl PatchExecutor {
    pub fn new(recover: bool, force: bool) -> Self {
        PatchExecutor { recover, force }
    }

    fn run_patch<S: PatchSegmenter>(&self, segmenter: &S, patch: &Patch) -> Result<PatchRun> {
        let mut run = PatchRun::new(patch);

        if self.recover && patch.path(segmenter.artifact()).exists() {
            debug!(
                "patch {}: found {}, skipping",
                patch.index,
                segmenter.artifact().display()
            );
            run.transition(PatchState::Done { recovered: true });
            return Ok(run);
        }

        run.transition(PatchState::Running);
        let t0 = Instant::now();
        match segmenter.segment(patch) {
            Ok(()) => {
                trace!("patch {}: segmented in {:?}", patch.index, t0.elapsed());
                run.transition(PatchState::Done { recovered: false });
            }
            Err(err) if self.force => {
                warn!("Patch {} failed and will have no cells: {}", patch.index, err);
                run.transition(PatchState::Failed {
                    message: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }

        Ok(run)
    }

    /// Segment every patch, returning one run record per patch in the same
    /// order.
    pub fn run<S: PatchSegmenter>(
        &self,
        segmenter: &S,
        patches: &[Patch],
        scheduler: &Scheduler,
    ) -> Result<Vec<PatchRun>> {
        let t0 = Instant::now();
        info!("Running {} on {} patches", segmenter.name(), patches.len());

        let pb = progress_bar(patches.len(), "segmenting patches");
        let runs = scheduler.try_map(patches, |patch| {
            let run = self.run_patch(segmenter, patch);
            pb.inc(1);
            run
        });
        pb.finish_and_clear();
        let runs = runs?;

        let nrecovered = runs
            .iter()
            .filter(|run| run.state == PatchState::Done { recovered: true })
            .count();
        if nrecovered > 0 {
            info!("Recovered {} previously segmented patches", nrecovered);
        }

        if self.force {
            let nsegmented = patches
                .iter()
                .filter(|patch| patch.path(segmenter.artifact()).exists())
                .count();
            if nsegmented == 0 {
                return Err(SegmentationError::BatchFailure {
                    npatches: patches.len(),
                });
            }

            let nfailed = runs.iter().filter(|run| !run.succeeded()).count();
            if nfailed > 0 {
                warn!(
                    "Segmentation failed on {} of {} patches",
                    nfailed,
                    patches.len()
                );
            }
        }

        info!("Segmented patches: {:?}", t0.elapsed());
        Ok(runs)
    }
}

#[cfg(test)]
pub mod tests {
    use super::methods::{ExternalCommand, PatchOutput, SegmentationMethod};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub fn make_patches(cache_dir: &Path, n: usize) -> Vec<Patch> {
        (0..n)
            .map(|index| {
                let dir = cache_dir.join(index.to_string());
                fs::create_dir_all(&dir).unwrap();
                Patch::open(index, dir).unwrap()
            })
            .collect()
    }

    // Writes its artifact on patches listed in `succeed`, fails on the rest.
    struct CountingSegmenter {
        artifact: PathBuf,
        succeed: Vec<usize>,
        calls: AtomicUsize,
    }

    impl CountingSegmenter {
        fn new(succeed: Vec<usize>) -> Self {
            CountingSegmenter {
                artifact: PathBuf::from("done.txt"),
                succeed,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PatchSegmenter for CountingSegmenter {
        fn name(&self) -> &str {
            "counting"
        }

        fn artifact(&self) -> &Path {
            &self.artifact
        }

        fn segment(&self, patch: &Patch) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed.contains(&patch.index) {
                fs::write(patch.path(&self.artifact), "ok").unwrap();
                Ok(())
            } else {
                Err(SegmentationError::Input(format!("patch {} failed", patch.index)))
            }
        }
    }

    fn sh(script: &str, artifact: &str) -> SegmentationMethod {
        SegmentationMethod::Command(ExternalCommand::new(
            PathBuf::from("sh"),
            vec!["-c".to_string(), script.to_string()],
            PathBuf::from(artifact),
            PatchOutput::LabelMask(PathBuf::from("mask.npy")),
        ))
    }

    #[test]
    fn test_discover_patches() {
        let cache = tempfile::tempdir().unwrap();
        for name in ["10", "2", "0", "scratch"] {
            fs::create_dir(cache.path().join(name)).unwrap();
        }
        fs::write(cache.path().join("7"), "not a directory").unwrap();
        fs::write(
            cache.path().join("2").join(PATCH_METADATA_FILE),
            r#"{"origin": [512.0, 1024.5]}"#,
        )
        .unwrap();

        let patches = discover_patches(cache.path()).unwrap();
        let indices: Vec<usize> = patches.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 2, 10]);
        assert_eq!(patches[0].origin, (0.0, 0.0));
        assert_eq!(patches[1].origin, (512.0, 1024.5));

        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover_patches(empty.path()),
            Err(SegmentationError::Input(_))
        ));
    }

    #[test]
    fn test_recover_skips_finished_patches() {
        let cache = tempfile::tempdir().unwrap();
        let patches = make_patches(cache.path(), 3);
        fs::write(patches[1].dir.join("done.txt"), "ok").unwrap();

        let segmenter = CountingSegmenter::new(vec![0, 1, 2]);
        let runs = PatchExecutor::new(true, false)
            .run(&segmenter, &patches, &Scheduler::Sequential)
            .unwrap();
        assert_eq!(segmenter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(runs[1].state, PatchState::Done { recovered: true });
        assert_eq!(runs[0].state, PatchState::Done { recovered: false });

        // everything is recovered the second time around
        let segmenter = CountingSegmenter::new(vec![0, 1, 2]);
        PatchExecutor::new(true, false)
            .run(&segmenter, &patches, &Scheduler::Sequential)
            .unwrap();
        assert_eq!(segmenter.calls.load(Ordering::SeqCst), 0);

        // without recover every patch is segmented again
        let segmenter = CountingSegmenter::new(vec![0, 1, 2]);
        PatchExecutor::new(false, false)
            .run(&segmenter, &patches, &Scheduler::new(Some(2)).unwrap())
            .unwrap();
        assert_eq!(segmenter.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_force_tolerates_partial_failure() {
        let cache = tempfile::tempdir().unwrap();
        let patches = make_patches(cache.path(), 4);

        let segmenter = CountingSegmenter::new(vec![2]);
        let runs = PatchExecutor::new(false, true)
            .run(&segmenter, &patches, &Scheduler::Sequential)
            .unwrap();
        assert_eq!(segmenter.calls.load(Ordering::SeqCst), 4);
        let succeeded: Vec<bool> = runs.iter().map(|run| run.succeeded()).collect();
        assert_eq!(succeeded, vec![false, false, true, false]);
        assert!(matches!(runs[0].state, PatchState::Failed { .. }));
    }

    #[test]
    fn test_force_with_all_failing() {
        let cache = tempfile::tempdir().unwrap();
        let patches = make_patches(cache.path(), 3);

        let segmenter = CountingSegmenter::new(Vec::new());
        let result = PatchExecutor::new(false, true).run(&segmenter, &patches, &Scheduler::Sequential);
        assert!(matches!(
            result,
            Err(SegmentationError::BatchFailure { npatches: 3 })
        ));
    }

    #[test]
    fn test_failure_without_force() {
        let cache = tempfile::tempdir().unwrap();
        let patches = make_patches(cache.path(), 2);

        let method = sh("echo boom; echo bust >&2; exit 3", "out.txt");
        let result = PatchExecutor::new(false, false).run(&method, &patches, &Scheduler::Sequential);
        match result {
            Err(SegmentationError::ExternalTool {
                patch,
                command,
                status,
                stdout,
                stderr,
            }) => {
                assert_eq!(patch, 0);
                assert!(command.starts_with("sh -c"));
                assert_eq!(status.code(), Some(3));
                assert_eq!(stdout.trim(), "boom");
                assert_eq!(stderr.trim(), "bust");
            }
            _ => panic!("expected an external tool error"),
        }
    }

    #[test]
    fn test_command_runs_in_patch_dir() {
        let cache = tempfile::tempdir().unwrap();
        let patches = make_patches(cache.path(), 3);

        let method = sh("pwd -P > out.txt", "out.txt");
        let runs = PatchExecutor::new(false, false)
            .run(&method, &patches, &Scheduler::new(Some(3)).unwrap())
            .unwrap();
        assert!(runs.iter().all(|run| run.succeeded()));

        for patch in &patches {
            let written = fs::read_to_string(patch.dir.join("out.txt")).unwrap();
            let written = fs::canonicalize(written.trim()).unwrap();
            assert_eq!(written, fs::canonicalize(&patch.dir).unwrap());
        }
    }

    #[test]
    fn test_force_with_failing_command() {
        let cache = tempfile::tempdir().unwrap();
        let patches = make_patches(cache.path(), 3);

        // only the first patch produces its artifact
        let method = sh(
            "if [ \"$(basename \"$(pwd -P)\")\" = 0 ]; then touch out.txt; else exit 1; fi",
            "out.txt",
        );
        let runs = PatchExecutor::new(false, true)
            .run(&method, &patches, &Scheduler::Sequential)
            .unwrap();
        let succeeded: Vec<bool> = runs.iter().map(|run| run.succeeded()).collect();
        assert_eq!(succeeded, vec![true, false, false]);
    }

    #[test]
    fn test_delete_cache() {
        let cache = tempfile::tempdir().unwrap();
        let patches = make_patches(cache.path(), 2);
        delete_cache(&patches).unwrap();
        assert!(patches.iter().all(|patch| !patch.dir.exists()));
        assert!(cache.path().exists());
    }
}
