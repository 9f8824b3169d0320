//! Core types for the Allium proof-of-work hash chain.

#![forbid(unsafe_code)]

mod error;
mod job;
mod nonce;
mod record;

pub use error::Error;
pub use job::{meets_target, JobParameters, MIDSTATE_WORDS, TAIL_WORDS};
pub use nonce::NonceRange;
pub use record::{HashRecord, HASH_BYTES, HASH_WORDS};

pub type Result<T> = std::result::Result<T, Error>;
