use thiserror::Error;

use crate::record::HASH_BYTES;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash record length {got}: expected {} bytes", HASH_BYTES)]
    InvalidRecordLength { got: usize },

    #[error("empty nonce range")]
    EmptyRange,
}
