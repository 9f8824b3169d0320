//! Minimal end-to-end walkthrough: enumerate devices, bring up a pipeline,
//! bind a job, run one batch, and read the match record.
//!
//! Usage: `scan [kernel-dir]` (defaults to `kernels`). Set `RUST_LOG=debug`
//! to watch per-stage compilation.

use allium_core::{meets_target, JobParameters, NonceRange};
use allium_gpu::context::GpuContext;
use allium_gpu::pipeline::{Pipeline, PipelineConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let kernel_dir = std::env::args().nth(1).unwrap_or_else(|| "kernels".into());

    println!("Available devices:");
    for dev in GpuContext::enumerate_devices()? {
        println!("  {dev}");
    }

    let mut pipeline = Pipeline::new(PipelineConfig::new(&kernel_dir))?;
    println!(
        "Pipeline up on {} (capacity {})",
        pipeline.device_info(),
        pipeline.capacity()
    );

    // A fixed sample header: midstate, tail, and a permissive target so the
    // walkthrough always finds something.
    let job = JobParameters::new(
        [
            0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab,
            0x5be0cd19,
        ],
        [0x80000000, 0x00000000, 0x00000280],
        u64::MAX >> 16,
    );
    pipeline.set_job(&job)?;

    let batch = NonceRange::new(0, 4096.min(pipeline.capacity()))?;
    pipeline.clear_matches(16)?;
    let processed = pipeline.run_batch(batch.first, batch.len)?;

    let summary = pipeline.read_match_summary()?;
    println!(
        "Evaluated nonces {}..{}: {} match(es)",
        batch.first,
        batch.nonce_at(processed - 1),
        summary.count
    );
    if summary.count == 1 {
        println!("Winning nonce: {}", summary.nonce);
        let record = pipeline.read_hash(summary.nonce.wrapping_sub(batch.first))?;
        println!(
            "Digest tail: {:#018x} (meets target: {})",
            record.digest_tail(),
            meets_target(record.digest_tail(), job.target)
        );
    } else if summary.count > 1 {
        let window = pipeline.read_matches(summary.count as usize, 1)?;
        println!("Matching nonces: {window:?}");
    }

    Ok(())
}
