//! Internal key encoding: `[user_key_bytes | trailer(8 bytes LE)]`.
//!
//! The trailer packs a 56-bit sequence number and a one-byte record type
//! as `(seq << 8) | type`. Because the trailer is little-endian, raw
//! byte-lexicographic comparison of the encoded form does **not** recover
//! the order documents need (newest sequence first for a given user key);
//! callers must compare through [`InternalKey`] / [`InternalKeyRef`],
//! never by `Vec<u8>`/`&[u8]` equality of the encoded bytes.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Largest sequence number representable in the 56-bit trailer field.
pub const MAX_SEQUENCE_NUMBER: u64 = (1u64 << 56) - 1;

/// Errors produced while encoding or decoding internal keys.
#[derive(Debug, Error)]
pub enum InternalKeyError {
    /// The sequence number does not fit in 56 bits.
    #[error("sequence number {0} exceeds the 56-bit limit ({MAX_SEQUENCE_NUMBER})")]
    SequenceOverflow(u64),

    /// The encoded key is shorter than the mandatory 8-byte trailer.
    #[error("internal key too short: {0} bytes (need at least 8)")]
    TooShort(usize),

    /// The trailer's type byte is neither `Value` nor `Tombstone`.
    #[error("invalid record type byte: 0x{0:02X}")]
    InvalidType(u8),
}

/// One-byte discriminant stored in the low byte of the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// A live value.
    Value = 0x01,
    /// A deletion marker.
    Tombstone = 0x02,
}

impl ValueType {
    fn from_u8(b: u8) -> Result<Self, InternalKeyError> {
        match b {
            0x01 => Ok(ValueType::Value),
            0x02 => Ok(ValueType::Tombstone),
            other => Err(InternalKeyError::InvalidType(other)),
        }
    }
}

/// Encode `(user_key, seq, type)` into the on-disk internal-key representation.
pub fn encode(user_key: &[u8], seq: u64, kind: ValueType) -> Result<Vec<u8>, InternalKeyError> {
    if seq > MAX_SEQUENCE_NUMBER {
        return Err(InternalKeyError::SequenceOverflow(seq));
    }
    let mut out = Vec::with_capacity(user_key.len() + 8);
    out.extend_from_slice(user_key);
    let trailer = (seq << 8) | (kind as u64);
    out.extend_from_slice(&trailer.to_le_bytes());
    Ok(out)
}

/// Decode an internal key into `(user_key, seq, type)`.
pub fn decode(buf: &[u8]) -> Result<(&[u8], u64, ValueType), InternalKeyError> {
    if buf.len() < 8 {
        return Err(InternalKeyError::TooShort(buf.len()));
    }
    let split = buf.len() - 8;
    let (user_key, trailer_bytes) = buf.split_at(split);
    let trailer = u64::from_le_bytes(trailer_bytes.try_into().expect("8-byte slice"));
    let (seq, kind) = decode_trailer(trailer)?;
    Ok((user_key, seq, kind))
}

/// Extract only the user-key prefix without validating the trailer's type byte.
pub fn extract_user_key(buf: &[u8]) -> Result<&[u8], InternalKeyError> {
    if buf.len() < 8 {
        return Err(InternalKeyError::TooShort(buf.len()));
    }
    Ok(&buf[..buf.len() - 8])
}

/// Extract `(seq, type)` from the trailing 8 bytes of an encoded internal key.
pub fn extract_trailer(buf: &[u8]) -> Result<(u64, ValueType), InternalKeyError> {
    if buf.len() < 8 {
        return Err(InternalKeyError::TooShort(buf.len()));
    }
    let trailer_bytes = &buf[buf.len() - 8..];
    let trailer = u64::from_le_bytes(trailer_bytes.try_into().expect("8-byte slice"));
    decode_trailer(trailer)
}

fn decode_trailer(trailer: u64) -> Result<(u64, ValueType), InternalKeyError> {
    let seq = trailer >> 8;
    let kind = ValueType::from_u8((trailer & 0xFF) as u8)?;
    Ok((seq, kind))
}

/// Borrowed view over an encoded internal key, ordered per the store's
/// internal-key comparator: user key ascending, then seq descending, then
/// type ascending.
#[derive(Debug, Clone, Copy)]
pub struct InternalKeyRef<'a> {
    bytes: &'a [u8],
}

impl<'a> InternalKeyRef<'a> {
    /// Wrap an already-encoded internal key. Does not validate the trailer;
    /// use [`InternalKeyRef::user_key`]/[`seq`](Self::seq)/[`kind`](Self::kind)
    /// which return errors lazily.
    pub fn new(bytes: &'a [u8]) -> Self {
        InternalKeyRef { bytes }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn user_key(&self) -> Result<&'a [u8], InternalKeyError> {
        extract_user_key(self.bytes)
    }

    pub fn seq_and_type(&self) -> Result<(u64, ValueType), InternalKeyError> {
        extract_trailer(self.bytes)
    }
}

impl PartialEq for InternalKeyRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for InternalKeyRef<'_> {}

impl PartialOrd for InternalKeyRef<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKeyRef<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        let (uk_a, seq_a, ty_a) = match (self.user_key(), self.seq_and_type()) {
            (Ok(uk), Ok((s, t))) => (uk, s, t),
            // A malformed key sorts as maximal so corruption surfaces as
            // "missing expected entry" rather than a silent misplacement.
            _ => return corrupt_ordering(self.bytes, other.bytes),
        };
        let (uk_b, seq_b, ty_b) = match (other.user_key(), other.seq_and_type()) {
            (Ok(uk), Ok((s, t))) => (uk, s, t),
            _ => return corrupt_ordering(self.bytes, other.bytes),
        };
        uk_a.cmp(uk_b)
            .then_with(|| seq_b.cmp(&seq_a))
            .then_with(|| ty_a.cmp(&ty_b))
    }
}

fn corrupt_ordering(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Owned variant of [`InternalKeyRef`] for use as a map key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey(pub Vec<u8>);

impl InternalKey {
    pub fn new(user_key: &[u8], seq: u64, kind: ValueType) -> Result<Self, InternalKeyError> {
        Ok(InternalKey(encode(user_key, seq, kind)?))
    }

    pub fn as_ref(&self) -> InternalKeyRef<'_> {
        InternalKeyRef::new(&self.0)
    }

    pub fn user_key(&self) -> Result<&[u8], InternalKeyError> {
        extract_user_key(&self.0)
    }

    pub fn seq_and_type(&self) -> Result<(u64, ValueType), InternalKeyError> {
        extract_trailer(&self.0)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_ref().cmp(&other.as_ref())
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.user_key(), self.seq_and_type()) {
            (Ok(uk), Ok((seq, ty))) => {
                write!(f, "{}@{}/{:?}", String::from_utf8_lossy(uk), seq, ty)
            }
            _ => write!(f, "<corrupt internal key, {} bytes>", self.0.len()),
        }
    }
}
