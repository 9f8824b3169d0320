//! The stage registry: kernel identities, argument contracts, and the
//! one-time binding of fixed buffer arguments.
//!
//! Each stage is one compute kernel with a stable positional argument
//! contract. The contracts live here as named constants; everything else
//! in the engine talks about arguments by name and converts to ordinals
//! only at this boundary.

use ocl::{Kernel, Program};

use allium_core::{JobParameters, MIDSTATE_WORDS, TAIL_WORDS};

use crate::buffers::ResourceSet;
use crate::context::{EngineError, GpuContext};
use crate::loader::StageLoader;

/// Number of distinct stage kernels.
pub const STAGE_COUNT: usize = 8;

/// One invocable step of the hash chain.
///
/// The sponge is split into three kernels: `Lyra2Absorb` seeds the big
/// sponge state from the hash state, `Lyra2Mix` works the sponge state
/// lane-parallel, and `Lyra2Squeeze` folds it back into the hash state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Blake32,
    KeccakF1600,
    Lyra2Absorb,
    Lyra2Mix,
    Lyra2Squeeze,
    CubeHash256,
    Skein,
    Groestl256,
}

impl Stage {
    pub const ALL: [Stage; STAGE_COUNT] = [
        Stage::Blake32,
        Stage::KeccakF1600,
        Stage::Lyra2Absorb,
        Stage::Lyra2Mix,
        Stage::Lyra2Squeeze,
        Stage::CubeHash256,
        Stage::Skein,
        Stage::Groestl256,
    ];

    /// Kernel entry point, exactly as exported by the compiled program.
    pub fn kernel_name(self) -> &'static str {
        match self {
            Stage::Blake32 => "blake32",
            Stage::KeccakF1600 => "keccakF1600",
            Stage::Lyra2Absorb => "lyra441p1",
            Stage::Lyra2Mix => "lyra441p2",
            Stage::Lyra2Squeeze => "lyra441p3",
            Stage::CubeHash256 => "cubeHash256",
            Stage::Skein => "skein",
            Stage::Groestl256 => "groestl256",
        }
    }

    /// Source file relative to the kernel directory root.
    pub fn source_file(self) -> &'static str {
        match self {
            Stage::Blake32 => "blake32/blake32.cl",
            Stage::KeccakF1600 => "keccakF1600/keccakF1600.cl",
            Stage::Lyra2Absorb => "lyra2phi2/lyra2p1.cl",
            Stage::Lyra2Mix => "lyra2phi2/lyra2p2.cl",
            Stage::Lyra2Squeeze => "lyra2phi2/lyra2p3.cl",
            Stage::CubeHash256 => "cubeHash256/cubeHash256.cl",
            Stage::Skein => "skein/skein.cl",
            Stage::Groestl256 => "groestl256/groestl256_htarg.cl",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kernel_name())
    }
}

/// Positional argument contract of the seeding stage (`blake32`).
pub mod seed_args {
    use allium_core::{MIDSTATE_WORDS, TAIL_WORDS};

    /// Hash-state buffer.
    pub const HASH_STATE: usize = 0;
    /// First midstate accumulator word; H0..H7 are contiguous from here.
    pub const MIDSTATE0: usize = 1;
    /// First header tail word; the tail words are contiguous from here.
    pub const TAIL0: usize = MIDSTATE0 + MIDSTATE_WORDS;
    /// First nonce of the batch, rebound per run.
    pub const NONCE_BASE: usize = TAIL0 + TAIL_WORDS;
}

/// Positional argument contract of the sponge stages.
pub mod sponge_args {
    /// Hash-state buffer (absorb and squeeze only).
    pub const HASH_STATE: usize = 0;
    /// Sponge scratch buffer for absorb and squeeze.
    pub const SPONGE_STATE: usize = 1;
    /// The mix kernel takes the sponge scratch as its sole argument.
    pub const MIX_SPONGE_STATE: usize = 0;
}

/// Positional argument contract of the terminal target-test stage
/// (`groestl256`).
pub mod final_args {
    /// Hash-state buffer.
    pub const HASH_STATE: usize = 0;
    /// Match record buffer.
    pub const MATCH_RECORD: usize = 1;
    /// 64-bit difficulty target, rebound per job.
    pub const TARGET: usize = 2;
}

/// All eight stage kernels of one engine instance, bound once to the
/// instance's buffers.
pub(crate) struct StageSet {
    seed: Kernel,
    permute: Kernel,
    absorb: Kernel,
    mix: Kernel,
    squeeze: Kernel,
    diffuse: Kernel,
    compress: Kernel,
    final_test: Kernel,
    // Programs outlive their kernels; released together on drop.
    #[allow(dead_code)]
    programs: Vec<Program>,
}

impl StageSet {
    /// Compile every stage program and build its kernel with the fixed
    /// buffer arguments bound. Scalar job arguments start as zero
    /// placeholders until [`StageSet::bind_job`].
    pub(crate) fn build(
        ctx: &GpuContext,
        loader: &StageLoader,
        buffers: &ResourceSet,
        capacity: usize,
    ) -> Result<Self, EngineError> {
        let seed_program = loader.compile(ctx, Stage::Blake32)?;
        let permute_program = loader.compile(ctx, Stage::KeccakF1600)?;
        let absorb_program = loader.compile(ctx, Stage::Lyra2Absorb)?;
        let mix_program = loader.compile(ctx, Stage::Lyra2Mix)?;
        let squeeze_program = loader.compile(ctx, Stage::Lyra2Squeeze)?;
        let diffuse_program = loader.compile(ctx, Stage::CubeHash256)?;
        let compress_program = loader.compile(ctx, Stage::Skein)?;
        let final_program = loader.compile(ctx, Stage::Groestl256)?;

        let mut seed_builder = Kernel::builder();
        seed_builder
            .program(&seed_program)
            .name(Stage::Blake32.kernel_name())
            .queue(ctx.queue().clone())
            .global_work_size(capacity)
            .arg(buffers.hash_state());
        for _ in 0..MIDSTATE_WORDS + TAIL_WORDS {
            seed_builder.arg(0u32);
        }
        seed_builder.arg(0u32); // nonce base, rebound per batch
        let seed = seed_builder
            .build()
            .map_err(|e| kernel_create(ctx, Stage::Blake32, e))?;

        let permute =
            state_only_kernel(ctx, &permute_program, Stage::KeccakF1600, buffers, capacity)?;

        let absorb = Kernel::builder()
            .program(&absorb_program)
            .name(Stage::Lyra2Absorb.kernel_name())
            .queue(ctx.queue().clone())
            .global_work_size(capacity)
            .arg(buffers.hash_state())
            .arg(buffers.sponge_state())
            .build()
            .map_err(|e| kernel_create(ctx, Stage::Lyra2Absorb, e))?;

        let mix = Kernel::builder()
            .program(&mix_program)
            .name(Stage::Lyra2Mix.kernel_name())
            .queue(ctx.queue().clone())
            .global_work_size(capacity * crate::pipeline::SPONGE_LANES)
            .arg(buffers.sponge_state())
            .build()
            .map_err(|e| kernel_create(ctx, Stage::Lyra2Mix, e))?;

        let squeeze = Kernel::builder()
            .program(&squeeze_program)
            .name(Stage::Lyra2Squeeze.kernel_name())
            .queue(ctx.queue().clone())
            .global_work_size(capacity)
            .arg(buffers.hash_state())
            .arg(buffers.sponge_state())
            .build()
            .map_err(|e| kernel_create(ctx, Stage::Lyra2Squeeze, e))?;

        let diffuse =
            state_only_kernel(ctx, &diffuse_program, Stage::CubeHash256, buffers, capacity)?;
        let compress = state_only_kernel(ctx, &compress_program, Stage::Skein, buffers, capacity)?;
        let final_test = Kernel::builder()
            .program(&final_program)
            .name(Stage::Groestl256.kernel_name())
            .queue(ctx.queue().clone())
            .global_work_size(capacity)
            .arg(buffers.hash_state())
            .arg(buffers.match_record())
            .arg(0u64) // target, rebound per job
            .build()
            .map_err(|e| kernel_create(ctx, Stage::Groestl256, e))?;

        let programs = vec![
            seed_program,
            permute_program,
            absorb_program,
            mix_program,
            squeeze_program,
            diffuse_program,
            compress_program,
            final_program,
        ];

        Ok(Self {
            seed,
            permute,
            absorb,
            mix,
            squeeze,
            diffuse,
            compress,
            final_test,
            programs,
        })
    }

    pub(crate) fn kernel(&self, stage: Stage) -> &Kernel {
        match stage {
            Stage::Blake32 => &self.seed,
            Stage::KeccakF1600 => &self.permute,
            Stage::Lyra2Absorb => &self.absorb,
            Stage::Lyra2Mix => &self.mix,
            Stage::Lyra2Squeeze => &self.squeeze,
            Stage::CubeHash256 => &self.diffuse,
            Stage::Skein => &self.compress,
            Stage::Groestl256 => &self.final_test,
        }
    }

    /// Rebind the per-job arguments: the seed stage's midstate and tail
    /// words and the terminal stage's target. Buffer arguments are never
    /// touched after construction.
    pub(crate) fn bind_job(&self, job: &JobParameters) -> Result<(), EngineError> {
        for (i, word) in job.midstate.iter().enumerate() {
            self.set_scalar(Stage::Blake32, seed_args::MIDSTATE0 + i, *word)?;
        }
        for (i, word) in job.tail.iter().enumerate() {
            self.set_scalar(Stage::Blake32, seed_args::TAIL0 + i, *word)?;
        }
        self.final_test
            .set_arg(final_args::TARGET, job.target)
            .map_err(|source| EngineError::ArgBind {
                stage: Stage::Groestl256,
                index: final_args::TARGET,
                source,
            })
    }

    /// Rebind the seed stage's first-nonce argument for one batch.
    pub(crate) fn bind_nonce_base(&self, first_nonce: u32) -> Result<(), EngineError> {
        self.set_scalar(Stage::Blake32, seed_args::NONCE_BASE, first_nonce)
    }

    fn set_scalar(&self, stage: Stage, index: usize, value: u32) -> Result<(), EngineError> {
        self.kernel(stage)
            .set_arg(index, value)
            .map_err(|source| EngineError::ArgBind {
                stage,
                index,
                source,
            })
    }
}

fn state_only_kernel(
    ctx: &GpuContext,
    program: &Program,
    stage: Stage,
    buffers: &ResourceSet,
    capacity: usize,
) -> Result<Kernel, EngineError> {
    Kernel::builder()
        .program(program)
        .name(stage.kernel_name())
        .queue(ctx.queue().clone())
        .global_work_size(capacity)
        .arg(buffers.hash_state())
        .build()
        .map_err(|e| kernel_create(ctx, stage, e))
}

fn kernel_create(ctx: &GpuContext, stage: Stage, source: ocl::Error) -> EngineError {
    EngineError::KernelCreate {
        stage,
        device: ctx.info().device_name.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn registry_names_are_distinct() {
        let names: HashSet<_> = Stage::ALL.iter().map(|s| s.kernel_name()).collect();
        assert_eq!(names.len(), STAGE_COUNT);

        let files: HashSet<_> = Stage::ALL.iter().map(|s| s.source_file()).collect();
        assert_eq!(files.len(), STAGE_COUNT);
    }

    #[test]
    fn seed_argument_contract_is_contiguous() {
        assert_eq!(seed_args::HASH_STATE, 0);
        assert_eq!(seed_args::MIDSTATE0, 1);
        assert_eq!(seed_args::TAIL0, seed_args::MIDSTATE0 + MIDSTATE_WORDS);
        assert_eq!(seed_args::NONCE_BASE, seed_args::TAIL0 + TAIL_WORDS);
        assert_eq!(seed_args::NONCE_BASE, 12);
    }

    #[test]
    fn sponge_argument_contract() {
        assert_eq!(sponge_args::HASH_STATE, 0);
        assert_eq!(sponge_args::SPONGE_STATE, 1);
        assert_eq!(sponge_args::MIX_SPONGE_STATE, 0);
    }

    #[test]
    fn terminal_stage_argument_contract() {
        assert_eq!(final_args::HASH_STATE, 0);
        assert_eq!(final_args::MATCH_RECORD, 1);
        assert_eq!(final_args::TARGET, 2);
    }

    #[test]
    fn display_uses_kernel_entry_names() {
        assert_eq!(Stage::Blake32.to_string(), "blake32");
        assert_eq!(Stage::Lyra2Mix.to_string(), "lyra441p2");
        assert_eq!(Stage::Groestl256.to_string(), "groestl256");
    }
}
