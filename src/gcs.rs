//! Golomb-coded set (BIP158) filters: construction, decoding, membership
//! tests, and the chained header commitment.
//!
//! Determinism is the load-bearing property here: two nodes constructing a
//! filter from the same `(key, element set)` must produce byte-identical
//! output, because filter-header agreement between peers depends on it.
use std::collections::BTreeSet;
use std::io::Cursor;

use bitcoin::consensus::encode::VarInt;
use bitcoin::consensus::{Decodable, Encodable};
use bitcoin::hashes::{siphash24, Hash as _};
use bitcoin::{BlockHash, FilterHash, FilterHeader};

use crate::error::OracleError;

/// BIP158 Golomb-Rice parameter for the basic filter type.
pub const FILTER_P: u8 = 19;

/// BIP158 modulus for the basic filter type (note: not `2^P`).
pub const FILTER_M: u64 = 784_931;

/// SipHash key derived from the hash of the block being filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterKey {
    k0: u64,
    k1: u64,
}

impl FilterKey {
    /// BIP158 key derivation: the first 16 bytes of the block hash, read as
    /// two little-endian u64 halves.
    pub fn for_block(block_hash: &BlockHash) -> Self {
        let bytes = block_hash.to_byte_array();
        let k0 = u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes"));
        let k1 = u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes"));
        Self { k0, k1 }
    }

    /// Hash an element into `[0, nm)` using the BIP158 multiply-shift
    /// reduction (unbiased, unlike a plain modulo).
    fn hash_to_range(&self, element: &[u8], nm: u64) -> u64 {
        let sip = siphash24::Hash::hash_to_u64_with_keys(self.k0, self.k1, element);
        ((sip as u128 * nm as u128) >> 64) as u64
    }
}

/// An immutable Golomb-coded set filter for one block.
///
/// Constructed once, never mutated. `content` holds the Golomb-Rice coded,
/// delta-compressed, sorted-hash stream; `n` is the element count that
/// prefixes it in the serialized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsFilter {
    block_hash: BlockHash,
    n: u64,
    content: Vec<u8>,
    key: FilterKey,
}

impl GcsFilter {
    /// Build a filter over raw byte-string elements, keyed by the block hash.
    ///
    /// Empty elements are skipped and duplicates are collapsed before
    /// hashing, so the element *set* alone determines the encoding.
    pub fn construct<I, T>(block_hash: &BlockHash, elements: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let key = FilterKey::for_block(block_hash);

        let set: BTreeSet<Vec<u8>> = elements
            .into_iter()
            .filter(|e| !e.as_ref().is_empty())
            .map(|e| e.as_ref().to_vec())
            .collect();

        let n = set.len() as u64;
        if n == 0 {
            return Self { block_hash: *block_hash, n: 0, content: Vec::new(), key };
        }

        let nm = n * FILTER_M;
        let mut values: Vec<u64> = set.iter().map(|e| key.hash_to_range(e, nm)).collect();
        values.sort_unstable();

        let mut writer = BitWriter::new();
        let mut prev = 0u64;
        for value in values {
            golomb_rice_encode(&mut writer, value - prev, FILTER_P);
            prev = value;
        }

        Self { block_hash: *block_hash, n, content: writer.finish(), key }
    }

    /// Reassemble a filter from stored parts without re-encoding.
    pub fn from_parts(block_hash: &BlockHash, n: u64, content: Vec<u8>) -> Self {
        Self {
            block_hash: *block_hash,
            n,
            content,
            key: FilterKey::for_block(block_hash),
        }
    }

    /// Parse the count-prefixed serialized form (the `cfilter` payload).
    pub fn from_encoded(block_hash: &BlockHash, encoded: &[u8]) -> Result<Self, OracleError> {
        let mut cursor = Cursor::new(encoded);
        let n = VarInt::consensus_decode(&mut cursor)
            .map_err(|_| OracleError::MalformedFilter(*block_hash))?;
        let content = encoded[cursor.position() as usize..].to_vec();
        Ok(Self::from_parts(block_hash, n.0, content))
    }

    /// Hash of the block this filter covers (also the key source).
    pub fn block_hash(&self) -> BlockHash {
        self.block_hash
    }

    /// Number of elements the filter was built over.
    pub fn element_count(&self) -> u64 {
        self.n
    }

    /// The Golomb-Rice coded stream without the element-count prefix
    /// (the compressed wire form).
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Count-prefixed serialization: `VarInt(n) || content`. This is the
    /// form the filter hash commits to.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.content.len() + 5);
        VarInt(self.n)
            .consensus_encode(&mut out)
            .expect("writing to a Vec cannot fail");
        out.extend_from_slice(&self.content);
        out
    }

    /// Double-SHA256 of [`Self::encode`].
    pub fn filter_hash(&self) -> FilterHash {
        FilterHash::hash(&self.encode())
    }

    /// Chained header: `sha256d(filter_hash || prev_header)`.
    pub fn header(&self, prev_header: &FilterHeader) -> FilterHeader {
        self.filter_hash().filter_header(prev_header)
    }

    /// Walk the full stream once, confirming every delta decodes. Used to
    /// reject malformed peer bodies before any hashing is trusted.
    pub fn validate(&self) -> Result<(), OracleError> {
        let mut reader = BitReader::new(&self.content);
        for _ in 0..self.n {
            golomb_rice_decode(&mut reader, FILTER_P)
                .ok_or(OracleError::MalformedFilter(self.block_hash))?;
        }
        Ok(())
    }

    /// Membership test for a single element. False positives are possible
    /// (rate ~`1/M`); false negatives are not.
    pub fn matches(&self, target: &[u8]) -> Result<bool, OracleError> {
        self.matches_any(std::iter::once(target))
    }

    /// Membership test for any of the given elements, in a single pass over
    /// the decoded stream.
    pub fn matches_any<I, T>(&self, targets: I) -> Result<bool, OracleError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        if self.n == 0 {
            return Ok(false);
        }
        let nm = self.n * FILTER_M;

        let mut queries: Vec<u64> = targets
            .into_iter()
            .filter(|t| !t.as_ref().is_empty())
            .map(|t| self.key.hash_to_range(t.as_ref(), nm))
            .collect();
        if queries.is_empty() {
            return Ok(false);
        }
        queries.sort_unstable();
        queries.dedup();

        // Both sides are sorted; merge-walk them.
        let mut reader = BitReader::new(&self.content);
        let mut value = 0u64;
        let mut next_query = 0usize;
        for _ in 0..self.n {
            let delta = golomb_rice_decode(&mut reader, FILTER_P)
                .ok_or(OracleError::MalformedFilter(self.block_hash))?;
            value += delta;
            while next_query < queries.len() && queries[next_query] < value {
                next_query += 1;
            }
            if next_query == queries.len() {
                return Ok(false);
            }
            if queries[next_query] == value {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// MSB-first bit accumulator for Golomb-Rice encoding.
struct BitWriter {
    data: Vec<u8>,
    current_byte: u8,
    bit_count: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self { data: Vec::new(), current_byte: 0, bit_count: 0 }
    }

    fn write_bit(&mut self, bit: bool) {
        if bit {
            self.current_byte |= 1u8 << (7 - self.bit_count);
        }
        self.bit_count += 1;
        if self.bit_count == 8 {
            self.data.push(self.current_byte);
            self.current_byte = 0;
            self.bit_count = 0;
        }
    }

    fn write_bits(&mut self, value: u64, num_bits: u8) {
        for i in 0..num_bits {
            self.write_bit(((value >> (num_bits - 1 - i)) & 1) != 0);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bit_count > 0 {
            self.data.push(self.current_byte);
        }
        self.data
    }
}

/// MSB-first bit cursor for decoding.
struct BitReader<'a> {
    data: &'a [u8],
    bit_offset: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit_offset: 0 }
    }

    fn read_bit(&mut self) -> Option<bool> {
        if self.bit_offset >= self.data.len() * 8 {
            return None;
        }
        let byte = self.data[self.bit_offset / 8];
        let bit = (byte >> (7 - self.bit_offset % 8)) & 1;
        self.bit_offset += 1;
        Some(bit == 1)
    }

    fn read_bits(&mut self, num_bits: u8) -> Option<u64> {
        let mut value = 0u64;
        for _ in 0..num_bits {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Some(value)
    }
}

/// Quotient in unary (q ones then a zero), remainder in `p` binary bits.
fn golomb_rice_encode(writer: &mut BitWriter, value: u64, p: u8) {
    debug_assert!(p > 0 && p < 32, "golomb parameter out of range");
    let quotient = value >> p;
    let remainder = value & ((1u64 << p) - 1);
    for _ in 0..quotient {
        writer.write_bit(true);
    }
    writer.write_bit(false);
    writer.write_bits(remainder, p);
}

fn golomb_rice_decode(reader: &mut BitReader<'_>, p: u8) -> Option<u64> {
    let mut quotient = 0u64;
    loop {
        match reader.read_bit()? {
            true => quotient += 1,
            false => break,
        }
    }
    let remainder = reader.read_bits(p)?;
    Some((quotient << p) | remainder)
}
