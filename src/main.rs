use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::time::Instant;

mod conflicts;
mod errors;
mod output;
mod patches;
mod progress;
mod resolve;
mod schemas;
mod shapes;

use output::{write_cell_metadata, write_cell_polygons, write_label_mask};
use patches::baysor::{default_config, find_executable, read_config, Baysor};
use patches::methods::{ExternalCommand, PatchOutput, SegmentationMethod};
use patches::{delete_cache, discover_patches, Patch, PatchExecutor, Scheduler};
use resolve::{resolve_patches, ResolveParams};
use schemas::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "patchseg")]
#[command(author, version)]
#[command(about = "Segment a tiled image patch by patch and merge the results into one set of cells.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a segmentation method on every patch, then resolve the results
    Run(RunArgs),

    /// Resolve the results of patches that were already segmented
    Resolve(ResolveArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Directory holding one subdirectory per patch, named by patch index
    cache_dir: PathBuf,

    /// Merge two cells when their overlap is at least this fraction of the smaller one
    #[arg(long, default_value_t = 0.5)]
    threshold: f64,

    /// Drop cells smaller than this area (in pixels) before resolving
    #[arg(long, default_value_t = 0.0)]
    min_area: f64,

    /// Grow every cell by this fraction of the mean cell radius
    #[arg(long, default_value = None)]
    expand_radius_ratio: Option<f64>,

    /// Polygon simplification tolerance. Chosen from the mean cell radius if not given.
    #[arg(long, default_value = None)]
    tolerance: Option<f64>,

    /// Smoothing radius, as a fraction of the mean cell radius
    #[arg(long, default_value_t = 0.1)]
    smooth_radius_ratio: f64,

    /// Number of threads. All cores if not given.
    #[arg(short = 't', long, default_value = None)]
    nthreads: Option<usize>,

    #[arg(long, default_value = "cell-polygons.geojson.gz")]
    output_cell_polygons: String,

    #[arg(long, default_value = "cell-metadata.csv.gz")]
    output_cell_metadata: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_cell_metadata_fmt: OutputFormat,

    /// Also write the resolved cells as a label mask (.npy)
    #[arg(long, default_value = None)]
    output_label_mask: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Skip patches that already hold a segmentation result
    #[arg(long, default_value_t = false)]
    recover: bool,

    /// Tolerate failing patches, as long as one succeeds
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Delete patch directories once outputs are written
    #[arg(long, default_value_t = false)]
    delete_cache: bool,

    #[command(subcommand)]
    method: MethodArgs,
}

#[derive(Subcommand, Debug)]
enum MethodArgs {
    /// Baysor on the transcripts of each patch
    Baysor {
        /// Baysor config (TOML). Built from --gene-column if not given.
        #[arg(long, default_value = None)]
        config: Option<PathBuf>,

        #[arg(long, default_value = None)]
        gene_column: Option<String>,

        /// Column of transcripts.csv holding a prior segmentation
        #[arg(long, default_value = None)]
        prior_shapes_key: Option<String>,

        /// Path to baysor. Searched on the PATH and in ~/.julia/bin if not given.
        #[arg(long, default_value = None)]
        executable: Option<PathBuf>,
    },

    /// Any program, run once in each patch directory
    Command {
        /// File whose presence marks a patch as done
        #[arg(long)]
        artifact: PathBuf,

        /// Label mask (.npy) written by the program
        #[arg(long, conflicts_with = "polygons_file", required_unless_present = "polygons_file")]
        mask_file: Option<PathBuf>,

        /// GeoJSON polygons, in global coordinates, written by the program
        #[arg(long)]
        polygons_file: Option<PathBuf>,

        #[arg(required = true, last = true)]
        program: Vec<String>,
    },

    /// Label masks already present in each patch directory
    Mask {
        #[arg(long, default_value = "mask.npy")]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ResolveArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Label mask (.npy) in each patch directory
    #[arg(long, conflicts_with = "polygons_file", required_unless_present = "polygons_file")]
    mask_file: Option<PathBuf>,

    /// GeoJSON polygons in each patch directory, in global coordinates
    #[arg(long)]
    polygons_file: Option<PathBuf>,
}

fn patch_output(mask_file: Option<PathBuf>, polygons_file: Option<PathBuf>) -> anyhow::Result<PatchOutput> {
    match (mask_file, polygons_file) {
        (Some(file), None) => Ok(PatchOutput::LabelMask(file)),
        (None, Some(file)) => Ok(PatchOutput::Polygons(file)),
        _ => bail!("Exactly one of --mask-file and --polygons-file must be given"),
    }
}

fn resolve_params(args: &CommonArgs) -> ResolveParams {
    ResolveParams {
        threshold: args.threshold,
        min_area: args.min_area,
        expand_radius_ratio: args.expand_radius_ratio,
        tolerance: args.tolerance,
        smooth_radius_ratio: args.smooth_radius_ratio,
    }
}

fn build_method(method: MethodArgs, patches: &[Patch]) -> anyhow::Result<SegmentationMethod> {
    match method {
        MethodArgs::Baysor {
            config,
            gene_column,
            prior_shapes_key,
            executable,
        } => {
            let config = match (config, gene_column) {
                (Some(path), _) => read_config(&path)
                    .with_context(|| format!("Reading baysor config {}", path.display()))?,
                (None, Some(gene_column)) => {
                    info!("No config provided, using a default baysor config");
                    default_config(&gene_column)
                }
                (None, None) => bail!("Either --config or --gene-column is required to run baysor"),
            };

            let executable = match executable {
                Some(executable) => executable,
                None => find_executable()?,
            };

            let baysor = Baysor::new(executable, config, prior_shapes_key)?;
            baysor.write_configs(patches)?;
            Ok(SegmentationMethod::Baysor(baysor))
        }
        MethodArgs::Command {
            artifact,
            mask_file,
            polygons_file,
            program,
        } => {
            let output = patch_output(mask_file, polygons_file)?;
            let mut program = program.into_iter();
            let Some(executable) = program.next() else {
                bail!("No program given to run");
            };
            Ok(SegmentationMethod::Command(ExternalCommand::new(
                PathBuf::from(executable),
                program.collect(),
                artifact,
                output,
            )))
        }
        MethodArgs::Mask { file } => Ok(SegmentationMethod::LabelMask(file)),
    }
}

fn write_outputs(args: &CommonArgs, cells: &resolve::ResolvedCells) -> anyhow::Result<()> {
    write_cell_polygons(&args.output_cell_polygons, cells)
        .with_context(|| format!("Writing {}", args.output_cell_polygons))?;

    if let Some(output_cell_metadata) = &args.output_cell_metadata {
        write_cell_metadata(output_cell_metadata, args.output_cell_metadata_fmt, cells)
            .with_context(|| format!("Writing {}", output_cell_metadata))?;
    }

    if let Some(output_label_mask) = &args.output_label_mask {
        write_label_mask(output_label_mask, &cells.polygons)
            .with_context(|| format!("Writing {}", output_label_mask))?;
    }

    Ok(())
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let t0 = Instant::now();
    let patches = discover_patches(&args.common.cache_dir)?;
    let scheduler = Scheduler::new(args.common.nthreads)?;
    let method = build_method(args.method, &patches)?;

    let executor = PatchExecutor::new(args.recover, args.force);
    let runs = executor.run(&method, &patches, &scheduler)?;

    let segmented: Vec<Patch> = patches
        .iter()
        .zip(&runs)
        .filter(|(_, run)| run.succeeded())
        .map(|(patch, _)| patch.clone())
        .collect();

    let params = resolve_params(&args.common);
    let output = method.output();
    let cells = scheduler.install(|| resolve_patches(&segmented, &output, &params))?;
    write_outputs(&args.common, &cells)?;

    if args.delete_cache {
        delete_cache(&patches)?;
    }

    info!("Finished {} cells in {:?}", cells.len(), t0.elapsed());
    Ok(())
}

fn resolve(args: ResolveArgs) -> anyhow::Result<()> {
    let t0 = Instant::now();
    let patches = discover_patches(&args.common.cache_dir)?;
    let scheduler = Scheduler::new(args.common.nthreads)?;
    let output = patch_output(args.mask_file, args.polygons_file)?;

    let params = resolve_params(&args.common);
    let cells = scheduler.install(|| resolve_patches(&patches, &output, &params))?;
    write_outputs(&args.common, &cells)?;

    info!("Finished {} cells in {:?}", cells.len(), t0.elapsed());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Resolve(args) => resolve(args),
    }
}
