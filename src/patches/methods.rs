// The segmentation backends that can be run on patches.

use std::path::{Path, PathBuf};
use std::process::Command;

use super::baysor::Baysor;
use super::{Patch, PatchSegmenter};
use crate::errors::{Result, SegmentationError};

/// What a backend leaves in each patch directory for consolidation.
#[derive(Clone, Debug, PartialEq)]
pub enum PatchOutput {
    /// Integer label mask (`.npy`) in patch pixel coordinates.
    LabelMask(PathBuf),

    /// GeoJSON polygons, already in global coordinates.
    Polygons(PathBuf),
}

impl PatchOutput {
    pub fn file(&self) -> &Path {
        match self {
            PatchOutput::LabelMask(file) => file,
            PatchOutput::Polygons(file) => file,
        }
    }
}

/// An arbitrary executable run once per patch directory.
#[derive(Clone, Debug)]
pub struct ExternalCommand {
    program: PathBuf,
    args: Vec<String>,
    artifact: PathBuf,
    output: PatchOutput,
}

impl ExternalCommand {
    pub fn new(program: PathBuf, args: Vec<String>, artifact: PathBuf, output: PatchOutput) -> Self {
        ExternalCommand {
            program,
            args,
            artifact,
            output,
        }
    }
}

pub enum SegmentationMethod {
    Baysor(Baysor),
    Command(ExternalCommand),

    /// A label mask file already present in every patch directory.
    LabelMask(PathBuf),
}

impl SegmentationMethod {
    pub fn output(&self) -> PatchOutput {
        match self {
            SegmentationMethod::Baysor(_) => Baysor::output(),
            SegmentationMethod::Command(command) => command.output.clone(),
            SegmentationMethod::LabelMask(file) => PatchOutput::LabelMask(file.clone()),
        }
    }
}

impl PatchSegmenter for SegmentationMethod {
    fn name(&self) -> &str {
        match self {
            SegmentationMethod::Baysor(_) => "baysor",
            SegmentationMethod::Command(_) => "external command",
            SegmentationMethod::LabelMask(_) => "label mask",
        }
    }

    fn artifact(&self) -> &Path {
        match self {
            SegmentationMethod::Baysor(baysor) => baysor.artifact(),
            SegmentationMethod::Command(command) => &command.artifact,
            SegmentationMethod::LabelMask(file) => file,
        }
    }

    fn segment(&self, patch: &Patch) -> Result<()> {
        match self {
            SegmentationMethod::Baysor(baysor) => {
                run_command(patch, baysor.executable(), &baysor.args())
            }
            SegmentationMethod::Command(command) => {
                run_command(patch, &command.program, &command.args)
            }
            SegmentationMethod::LabelMask(file) => {
                let path = patch.path(file);
                if path.exists() {
                    Ok(())
                } else {
                    Err(SegmentationError::Input(format!(
                        "patch {}: label mask {} not found",
                        patch.index,
                        path.display()
                    )))
                }
            }
        }
    }
}

// Shell-like rendering of a command, for error messages.
pub fn command_line(program: &Path, args: &[String]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            line.push('\'');
            line.push_str(arg);
            line.push('\'');
        } else {
            line.push_str(arg);
        }
    }
    line
}

/// Run `program` in the patch directory, failing on a non-zero exit status.
pub fn run_command(patch: &Patch, program: &Path, args: &[String]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .current_dir(&patch.dir)
        .output()
        .map_err(|err| SegmentationError::io(program, err))?;

    if !output.status.success() {
        return Err(SegmentationError::ExternalTool {
            patch: patch.index,
            command: command_line(program, args),
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}
