//! OpenCL pipeline engine for the Allium proof-of-work hash chain.
//!
//! One [`pipeline::Pipeline`] instance owns one device: its context, its
//! in-order command queue, the stage kernels, and the buffers the stages
//! share. Instances are independent; run one per accelerator.

pub mod buffers;
pub mod context;
pub mod loader;
pub mod pipeline;
pub mod stages;
