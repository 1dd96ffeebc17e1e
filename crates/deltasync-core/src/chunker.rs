//! Content-defined chunking (FastCDC, normalized).
//!
//! Boundaries are chosen by a gear rolling hash over the content itself, so
//! an insertion or deletion only disturbs the chunks around the edit. Chunks
//! shorter than `min_size` are never cut (except the tail of the stream) and
//! no chunk exceeds `max_size`.
//!
//! Normalization uses two masks: a strict one (more bits) before the target
//! average and a loose one (fewer bits) after it, which pulls the size
//! distribution towards `avg_size`. Masks test the high bits of the hash;
//! those bits have seen the most input bytes.

use std::io::{self, Read};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::manifest::ChunkRecord;

/// Bits added to / removed from the average mask for normalized chunking.
const NORMALIZATION_LEVEL: u32 = 2;

/// Read granularity when refilling the internal buffer.
const READ_BLOCK: usize = 64 * 1024;

// ── Gear table ────────────────────────────────────────────────────────────────

const fn splitmix64(state: u64) -> (u64, u64) {
    let state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    (state, z ^ (z >> 31))
}

const fn build_gear() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = 0x6465_6c74_6173_796e; // "deltasyn"
    let mut i = 0;
    while i < 256 {
        let (next, value) = splitmix64(state);
        state = next;
        table[i] = value;
        i += 1;
    }
    table
}

/// One pseudo-random 64-bit value per byte value. Fixed at compile time;
/// every participant must use the same table or boundaries will not agree.
static GEAR: [u64; 256] = build_gear();

/// Mask with the top `bits` bits set.
const fn high_mask(bits: u32) -> u64 {
    if bits == 0 {
        0
    } else if bits >= 64 {
        u64::MAX
    } else {
        u64::MAX << (64 - bits)
    }
}

// ── Parameters ────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    #[error("invalid chunk parameters: min={min} avg={avg} max={max} (need 0 < min < avg < max)")]
    InvalidParams { min: usize, avg: usize, max: usize },
    #[error("read failed while chunking: {0}")]
    Io(#[from] io::Error),
}

/// Chunk size bounds. Construct through [`ChunkParams::new`], which
/// enforces `0 < min < avg < max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    min_size: usize,
    avg_size: usize,
    max_size: usize,
}

impl ChunkParams {
    pub fn new(min_size: usize, avg_size: usize, max_size: usize) -> Result<Self, ChunkerError> {
        if min_size == 0 || min_size >= avg_size || avg_size >= max_size {
            return Err(ChunkerError::InvalidParams {
                min: min_size,
                avg: avg_size,
                max: max_size,
            });
        }
        Ok(Self {
            min_size,
            avg_size,
            max_size,
        })
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn avg_size(&self) -> usize {
        self.avg_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn masks(&self) -> (u64, u64) {
        let bits = self.avg_size.next_power_of_two().trailing_zeros();
        let strict = high_mask((bits + NORMALIZATION_LEVEL).min(63));
        let loose = high_mask(bits.saturating_sub(NORMALIZATION_LEVEL).max(1));
        (strict, loose)
    }
}

impl Default for ChunkParams {
    /// 4 KiB / 16 KiB / 64 KiB.
    fn default() -> Self {
        Self {
            min_size: 4 * 1024,
            avg_size: 16 * 1024,
            max_size: 64 * 1024,
        }
    }
}

/// Length of the first chunk in `data`. `data` must hold at least
/// `max_size` bytes unless it is the tail of the stream.
fn cut_point(data: &[u8], params: &ChunkParams, strict: u64, loose: u64) -> usize {
    let len = data.len();
    if len <= params.min_size {
        return len;
    }
    let end = len.min(params.max_size);
    let normal = params.avg_size.min(end);

    let mut hash: u64 = 0;
    let mut i = params.min_size;
    while i < normal {
        hash = (hash << 1).wrapping_add(GEAR[data[i] as usize]);
        if hash & strict == 0 {
            return i + 1;
        }
        i += 1;
    }
    while i < end {
        hash = (hash << 1).wrapping_add(GEAR[data[i] as usize]);
        if hash & loose == 0 {
            return i + 1;
        }
        i += 1;
    }
    end
}

// ── Streaming chunker ─────────────────────────────────────────────────────────

/// Iterator over the chunks of a reader.
///
/// Yields `Err` at most once; after an error the iterator is exhausted.
pub struct Chunker<R> {
    reader: R,
    params: ChunkParams,
    strict: u64,
    loose: u64,
    buf: Vec<u8>,
    pos: usize,
    offset: u64,
    eof: bool,
    failed: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R, params: ChunkParams) -> Self {
        let (strict, loose) = params.masks();
        Self {
            reader,
            params,
            strict,
            loose,
            buf: Vec::with_capacity(params.max_size.max(READ_BLOCK) * 2),
            pos: 0,
            offset: 0,
            eof: false,
            failed: false,
        }
    }

    /// Ensure at least `max_size` unread bytes are buffered, or hit EOF.
    fn fill(&mut self) -> io::Result<()> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let mut block = [0u8; READ_BLOCK];
        while !self.eof && self.buf.len() < self.params.max_size {
            match self.reader.read(&mut block) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&block[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<ChunkRecord, ChunkerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buf.len() - self.pos < self.params.max_size && !self.eof {
            if let Err(e) = self.fill() {
                self.failed = true;
                return Some(Err(ChunkerError::Io(e)));
            }
        }
        let pending = &self.buf[self.pos..];
        if pending.is_empty() {
            return None;
        }
        let len = cut_point(pending, &self.params, self.strict, self.loose);
        let content = Bytes::copy_from_slice(&pending[..len]);
        let record = ChunkRecord::new(self.offset, content);
        self.pos += len;
        self.offset += len as u64;
        Some(Ok(record))
    }
}

/// Chunk an in-memory buffer. Never fails once the parameters are valid.
pub fn chunk_bytes(data: &[u8], params: &ChunkParams) -> Vec<ChunkRecord> {
    let (strict, loose) = params.masks();
    let shared = Bytes::copy_from_slice(data);
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let len = cut_point(&data[pos..], params, strict, loose);
        records.push(ChunkRecord::new(pos as u64, shared.slice(pos..pos + len)));
        pos += len;
    }
    records
}

/// Chunk everything `reader` yields. Any read error aborts the whole run.
pub fn chunk_reader<R: Read>(
    reader: R,
    params: &ChunkParams,
) -> Result<Vec<ChunkRecord>, ChunkerError> {
    Chunker::new(reader, *params).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> ChunkParams {
        ChunkParams::new(256, 1024, 4096).unwrap()
    }

    /// xorshift64*, deterministic test data.
    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state >> 12;
                state ^= state << 25;
                state ^= state >> 27;
                (state.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 56) as u8
            })
            .collect()
    }

    fn concat(records: &[ChunkRecord]) -> Vec<u8> {
        records
            .iter()
            .flat_map(|r| r.content.as_ref().unwrap().iter().copied())
            .collect()
    }

    #[test]
    fn rejects_unordered_params() {
        assert!(ChunkParams::new(0, 10, 20).is_err());
        assert!(ChunkParams::new(10, 10, 20).is_err());
        assert!(ChunkParams::new(10, 20, 20).is_err());
        assert!(ChunkParams::new(30, 20, 10).is_err());
        assert!(ChunkParams::new(1, 2, 3).is_ok());
    }

    #[test]
    fn chunks_are_contiguous_and_bounded() {
        let params = small_params();
        let data = pseudo_random(200_000, 7);
        let records = chunk_bytes(&data, &params);

        let mut expected_offset = 0u64;
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.offset, expected_offset, "chunk {i} not contiguous");
            assert_eq!(r.size as usize, r.content.as_ref().unwrap().len());
            assert!(r.size as usize <= params.max_size());
            if i + 1 < records.len() {
                assert!(r.size as usize >= params.min_size(), "chunk {i} below min");
            }
            assert_eq!(r.checksum, crate::hash::hash(r.content.as_ref().unwrap()));
            expected_offset += r.size;
        }
        assert_eq!(expected_offset as usize, data.len());
        assert_eq!(concat(&records), data);
    }

    #[test]
    fn chunking_is_deterministic() {
        let params = small_params();
        let data = pseudo_random(50_000, 11);
        assert_eq!(chunk_bytes(&data, &params), chunk_bytes(&data, &params));
    }

    #[test]
    fn streaming_matches_in_memory() {
        let params = small_params();
        let data = pseudo_random(300_000, 3);
        let streamed = chunk_reader(std::io::Cursor::new(&data), &params).unwrap();
        assert_eq!(streamed, chunk_bytes(&data, &params));
    }

    #[test]
    fn empty_input_has_no_chunks() {
        assert!(chunk_bytes(&[], &small_params()).is_empty());
        assert!(chunk_reader(std::io::empty(), &small_params())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn short_input_is_one_chunk() {
        let records = chunk_bytes(b"HELLOWORLD", &small_params());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size, 10);
    }

    #[test]
    fn local_edit_only_disturbs_nearby_chunks() {
        let params = small_params();
        let original = pseudo_random(64 * 1024, 42);
        let mut edited = original.clone();
        let at = 32 * 1024;
        edited.splice(at..at, b"an inserted phrase".iter().copied());

        let before = chunk_bytes(&original, &params);
        let after = chunk_bytes(&edited, &params);
        let old: std::collections::HashSet<_> = before.iter().map(|r| r.checksum).collect();
        let shared = after.iter().filter(|r| old.contains(&r.checksum)).count();

        assert!(
            shared + 4 >= after.len(),
            "only {shared} of {} chunks survived a single insertion",
            after.len()
        );
        // Everything fully before the edit is untouched.
        for r in before.iter().filter(|r| r.end() + params.max_size() as u64 <= at as u64) {
            assert!(after.contains(r));
        }
    }

    struct FailingReader {
        served: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served >= 10_000 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
            }
            let n = buf.len().min(1000);
            buf[..n].fill(0xab);
            self.served += n;
            Ok(n)
        }
    }

    #[test]
    fn read_error_aborts_chunking() {
        let result = chunk_reader(FailingReader { served: 0 }, &small_params());
        assert!(matches!(result, Err(ChunkerError::Io(_))));
    }

    #[test]
    fn iterator_is_fused_after_error() {
        let mut chunker = Chunker::new(FailingReader { served: 0 }, small_params());
        let mut saw_error = false;
        for item in chunker.by_ref() {
            if item.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(chunker.next().is_none());
    }
}
