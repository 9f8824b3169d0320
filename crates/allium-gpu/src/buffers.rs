//! GPU-resident buffers shared by the stage chain.
//!
//! One `ResourceSet` is allocated per engine instance at bring-up, sized
//! against the instance's fixed batch capacity, and reused destructively
//! by every batch.

use ocl::{Buffer, MemFlags};

use allium_core::{HashRecord, HASH_WORDS};

use crate::context::{EngineError, GpuContext};
use crate::pipeline::SPONGE_LANES;

/// First two words of the match record, read together.
///
/// Only reliable when at most one candidate matched: concurrent matches
/// append past word 1, so `nonce` then holds an arbitrary one of them
/// while `count` still reflects the true total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSummary {
    /// Nonce in the first match slot.
    pub nonce: u32,
    /// Match counter at the time of the read.
    pub count: u32,
}

/// The per-instance buffer set: hash state, sponge scratch, match record.
pub struct ResourceSet {
    /// One 8-word hash record per candidate slot.
    hash_state: Buffer<u32>,
    /// Sponge scratch, 4 lanes of 8 words per candidate slot. Contents are
    /// undefined outside the absorb..squeeze window of a running batch.
    sponge_state: Buffer<u32>,
    /// Word 0 is the match counter; words 1.. hold matching nonces.
    match_record: Buffer<u32>,
    capacity: usize,
}

impl ResourceSet {
    /// Allocate all three buffers for `capacity` candidate slots.
    ///
    /// The match record gets `capacity + 1` words so even a pathological
    /// all-candidates-match batch cannot overflow it.
    pub fn new(ctx: &GpuContext, capacity: usize) -> Result<Self, EngineError> {
        let queue = ctx.queue();

        let hash_state = buffer(queue, "hash state", capacity * HASH_WORDS)?;
        let sponge_state = buffer(queue, "sponge state", capacity * SPONGE_LANES * HASH_WORDS)?;
        let match_record = buffer(queue, "match record", capacity + 1)?;

        Ok(Self {
            hash_state,
            sponge_state,
            match_record,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn hash_state(&self) -> &Buffer<u32> {
        &self.hash_state
    }

    pub(crate) fn sponge_state(&self) -> &Buffer<u32> {
        &self.sponge_state
    }

    pub(crate) fn match_record(&self) -> &Buffer<u32> {
        &self.match_record
    }

    /// Zero the match counter, the first `expected_max_matches` nonce
    /// slots, and one extra safety word.
    pub fn clear_matches(&self, expected_max_matches: usize) -> Result<(), EngineError> {
        let span = clear_span_words(expected_max_matches, self.capacity + 1);
        let zeros = vec![0u32; span];
        self.match_record
            .write(&zeros)
            .enq()
            .map_err(EngineError::MatchClear)
    }

    /// Blocking read of the counter word and the first match slot.
    pub fn read_match_summary(&self) -> Result<MatchSummary, EngineError> {
        let mut words = [0u32; 2];
        self.match_record
            .read(&mut words[..])
            .enq()
            .map_err(|source| EngineError::Readback {
                what: "match summary",
                source,
            })?;
        Ok(MatchSummary {
            nonce: words[1],
            count: words[0],
        })
    }

    /// Blocking read of a window of the match record, clamped to the
    /// record's length. `offset` and `count` are in words; word 0 is the
    /// counter.
    pub fn read_match_window(&self, count: usize, offset: usize) -> Result<Vec<u32>, EngineError> {
        let available = (self.capacity + 1).saturating_sub(offset);
        let n = count.min(available);
        let mut words = vec![0u32; n];
        if n > 0 {
            self.match_record
                .read(&mut words)
                .offset(offset)
                .enq()
                .map_err(|source| EngineError::Readback {
                    what: "match window",
                    source,
                })?;
        }
        Ok(words)
    }

    /// Blocking read of the whole hash-state buffer, one record per
    /// candidate slot across the full capacity. Slow; validation only.
    pub fn read_all_hashes(&self) -> Result<Vec<HashRecord>, EngineError> {
        let mut words = vec![0u32; self.capacity * HASH_WORDS];
        self.hash_state
            .read(&mut words)
            .enq()
            .map_err(|source| EngineError::Readback {
                what: "hash state",
                source,
            })?;
        Ok(words
            .chunks_exact(HASH_WORDS)
            .map(|chunk| {
                let mut h = [0u32; HASH_WORDS];
                h.copy_from_slice(chunk);
                HashRecord::from_words(h)
            })
            .collect())
    }

    /// Blocking read of one candidate slot's hash record.
    pub fn read_hash(&self, index: u32) -> Result<HashRecord, EngineError> {
        if index as usize >= self.capacity {
            return Err(EngineError::SlotOutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        let mut words = [0u32; HASH_WORDS];
        self.hash_state
            .read(&mut words[..])
            .offset(index as usize * HASH_WORDS)
            .enq()
            .map_err(|source| EngineError::Readback {
                what: "hash record",
                source,
            })?;
        Ok(HashRecord::from_words(words))
    }
}

fn buffer(queue: &ocl::Queue, name: &'static str, len: usize) -> Result<Buffer<u32>, EngineError> {
    Buffer::<u32>::builder()
        .queue(queue.clone())
        .flags(MemFlags::new().read_write())
        .len(len)
        .build()
        .map_err(|source| EngineError::BufferCreate { name, len, source })
}

/// Words to zero for a clear request: the counter, `expected` nonce slots,
/// and one safety word, clamped to the record length.
pub(crate) fn clear_span_words(expected: usize, record_len: usize) -> usize {
    expected.saturating_add(2).min(record_len)
}
