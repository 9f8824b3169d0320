//! Stage program loading and compilation.
//!
//! Stage kernels are external artifacts: OpenCL C sources shipped under a
//! kernel directory, one file per stage. Each stage compiles into its own
//! program; a compile failure names the stage and device so bring-up
//! diagnostics stay actionable.

use std::fs;
use std::path::{Path, PathBuf};

use ocl::Program;

use crate::context::{EngineError, GpuContext};
use crate::stages::Stage;

/// Resolves and compiles stage kernel sources from a directory tree.
pub struct StageLoader {
    root: PathBuf,
}

impl StageLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path of a stage's source file.
    pub fn source_path(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.source_file())
    }

    /// Read a stage's kernel source from disk.
    pub fn read_source(&self, stage: Stage) -> Result<String, EngineError> {
        let path = self.source_path(stage);
        fs::read_to_string(&path).map_err(|source| EngineError::KernelSource {
            stage,
            path,
            source,
        })
    }

    /// Compile a stage's program for the context's device.
    pub fn compile(&self, ctx: &GpuContext, stage: Stage) -> Result<Program, EngineError> {
        let source = self.read_source(stage)?;
        log::debug!(
            "compiling stage {} for {}",
            stage,
            ctx.info().device_name.trim()
        );
        Program::builder()
            .src(source)
            .devices(ctx.device())
            .cmplr_opt("-cl-std=CL1.2")
            .build(ctx.context())
            .map_err(|source| EngineError::StageBuild {
                stage,
                device: ctx.info().device_name.clone(),
                source,
            })
    }
}
