//! Data block layout: a run of prefix-compressed entries followed by a
//! restart-point array.
//!
//! ```text
//! entry: shared(varint) | unshared(varint) | value_len(varint) | unshared_key_bytes | value_bytes
//! ...
//! restart_offsets: u32 LE, one per restart point
//! num_restarts: u32 LE
//! ```
//!
//! Every 16th entry is a restart point: its `shared` prefix length is
//! reset to zero so a block can be binary-searched without decoding every
//! preceding entry.

use std::sync::Arc;

use super::varint;

pub const RESTART_INTERVAL: usize = 16;

/// Incrementally builds one data block's payload (without the on-disk
/// compression/CRC trailer, which the table builder adds separately).
pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
    restart_interval: usize,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        BlockBuilder {
            buf: Vec::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
            restart_interval,
        }
    }

    /// Appends one entry. `key` must be strictly greater than the
    /// previously added key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.counter < self.restart_interval {
            common_prefix_len(&self.last_key, key)
        } else {
            0
        };
        if self.counter >= self.restart_interval {
            self.restarts.push(self.buf.len() as u32);
            self.counter = 0;
        }
        let unshared = &key[shared..];
        varint::encode(shared as u64, &mut self.buf);
        varint::encode(unshared.len() as u64, &mut self.buf);
        varint::encode(value.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(unshared);
        self.buf.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn current_size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    /// Finalizes the block payload, consuming the builder.
    pub fn finish(mut self) -> Vec<u8> {
        for &offset in &self.restarts {
            self.buf.extend_from_slice(&offset.to_le_bytes());
        }
        self.buf
            .extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());
        self.buf
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A decoded entry read from a block.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub key: Vec<u8>,
    pub value_range: (usize, usize),
}

/// Forward/seekable iterator over one decoded data block.
pub struct BlockIterator {
    data: Arc<Vec<u8>>,
    restart_offsets: Vec<u32>,
    // Current entry position, as a byte offset into `data`, or `data.len()`
    // (minus trailer) when exhausted.
    entries_end: usize,
    pos: usize,
    current_key: Vec<u8>,
    current_value: (usize, usize),
    valid: bool,
}

impl BlockIterator {
    pub fn new(data: Arc<Vec<u8>>) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let num_restarts =
            u32::from_le_bytes(data[data.len() - 4..].try_into().ok()?) as usize;
        let restart_array_start = data.len().checked_sub(4 + num_restarts * 4)?;
        let mut restart_offsets = Vec::with_capacity(num_restarts);
        for i in 0..num_restarts {
            let base = restart_array_start + i * 4;
            restart_offsets.push(u32::from_le_bytes(data[base..base + 4].try_into().ok()?));
        }
        Some(BlockIterator {
            data,
            restart_offsets,
            entries_end: restart_array_start,
            pos: 0,
            current_key: Vec::new(),
            current_value: (0, 0),
            valid: false,
        })
    }

    fn decode_entry_at(&self, offset: usize, prev_key: &[u8]) -> Option<(Vec<u8>, (usize, usize), usize)> {
        let buf = &self.data[offset..self.entries_end];
        let (shared, n1) = varint::decode(buf)?;
        let (unshared, n2) = varint::decode(&buf[n1..])?;
        let (value_len, n3) = varint::decode(&buf[n1 + n2..])?;
        let header_len = n1 + n2 + n3;
        let key_start = offset + header_len;
        let key_end = key_start + unshared as usize;
        if key_end > self.entries_end {
            return None;
        }
        let mut key = Vec::with_capacity(shared as usize + unshared as usize);
        key.extend_from_slice(&prev_key[..shared as usize]);
        key.extend_from_slice(&self.data[key_start..key_end]);
        let value_start = key_end;
        let value_end = value_start + value_len as usize;
        if value_end > self.entries_end {
            return None;
        }
        let next_offset = value_end;
        Some((key, (value_start, value_end), next_offset))
    }

    pub fn seek_to_first(&mut self) {
        self.current_key.clear();
        self.advance_from(0);
    }

    fn advance_from(&mut self, offset: usize) {
        if offset >= self.entries_end {
            self.valid = false;
            return;
        }
        match self.decode_entry_at(offset, &self.current_key) {
            Some((key, value_range, next)) => {
                self.current_key = key;
                self.current_value = value_range;
                self.pos = next;
                self.valid = true;
            }
            None => self.valid = false,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn next(&mut self) {
        if !self.valid {
            return;
        }
        let next_pos = self.pos;
        self.advance_from(next_pos);
    }

    pub fn key(&self) -> &[u8] {
        &self.current_key
    }

    pub fn value(&self) -> &[u8] {
        &self.data[self.current_value.0..self.current_value.1]
    }

    /// Binary-searches restart points for the greatest one whose key is
    /// `<= target`, then linearly scans forward to the first entry with
    /// key `>= target`.
    pub fn seek(&mut self, target: &[u8]) {
        if self.restart_offsets.is_empty() {
            self.valid = false;
            return;
        }
        let mut lo = 0usize;
        let mut hi = self.restart_offsets.len();
        while lo + 1 < hi {
            let mid = (lo + hi) / 2;
            let offset = self.restart_offsets[mid] as usize;
            // Restart entries always have shared = 0, so prev_key is irrelevant.
            match self.decode_entry_at(offset, &[]) {
                Some((key, _, _)) => {
                    if key.as_slice() <= target {
                        lo = mid;
                    } else {
                        hi = mid;
                    }
                }
                None => {
                    hi = mid;
                }
            }
        }
        self.current_key.clear();
        self.advance_from(self.restart_offsets[lo] as usize);
        while self.valid && self.current_key.as_slice() < target {
            self.next();
        }
    }
}
