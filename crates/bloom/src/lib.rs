//! Persisted Bloom filter guarding bucket lookups.
//!
//! Sized from a declared capacity and target false-positive rate, hashed
//! deterministically so an exported filter answers identically after import.
//! The sidecar file is a length-prefixed bincode image followed by a CRC32 of
//! the payload.


use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

const MAGIC: u32 = 0x424C_4D31; // "BLM1"
const LN2: f64 = std::f64::consts::LN_2;

fn bincode_config() -> impl Config {
    config::legacy()
}

/// What a membership probe can tell you.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    MightBePresent,
    DefinitelyAbsent,
}

#[derive(Serialize, Deserialize)]
struct BloomImage {
    magic: u32,
    bits: u64,
    hashes: u32,
    inserted: u64,
    checks: u64,
    words: Vec<u64>,
}

/// Fixed-capacity probabilistic set over byte-string keys.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: u64,
    hashes: u32,
    inserted: u64,
    checks: u64,
    words: Vec<u64>,
}

impl BloomFilter {
    /// Size the filter for `capacity` keys at the given false-positive rate:
    /// `m = -n ln p / ln^2 2` bits and `k = (m/n) ln 2` hash functions.
    pub fn with_capacity(capacity: u64, fp_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let fp_rate = fp_rate.clamp(1e-9, 0.5);
        let bits = ((-(capacity as f64) * fp_rate.ln()) / (LN2 * LN2)).ceil() as u64;
        let bits = bits.max(64);
        let hashes = (((bits as f64 / capacity as f64) * LN2).round() as u32).clamp(1, 30);
        let words = vec![0u64; bits.div_ceil(64) as usize];
        Self {
            bits,
            hashes,
            inserted: 0,
            checks: 0,
            words,
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.bits;
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.inserted += 1;
    }

    pub fn maybe_contains(&mut self, key: &[u8]) -> Membership {
        self.checks += 1;
        let (h1, h2) = hash_pair(key);
        for i in 0..self.hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.bits;
            if self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) == 0 {
                return Membership::DefinitelyAbsent;
            }
        }
        Membership::MightBePresent
    }

    /// Write the filter image to `path`, replacing any previous export.
    pub fn export(&self, path: &Path) -> StoreResult<()> {
        let image = BloomImage {
            magic: MAGIC,
            bits: self.bits,
            hashes: self.hashes,
            inserted: self.inserted,
            checks: self.checks,
            words: self.words.clone(),
        };
        let payload = encode_to_vec(&image, bincode_config())
            .map_err(|e| StoreError::Bloom(format!("encode failed: {e}")))?;
        let mut file = File::create(path)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        Ok(())
    }

    /// Load a filter previously written by `export`.
    pub fn import(path: &Path) -> StoreResult<Self> {
        let mut file = File::open(path)?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;
        let mut crc_buf = [0u8; 4];
        file.read_exact(&mut crc_buf)?;
        if crc32fast::hash(&payload) != u32::from_le_bytes(crc_buf) {
            return Err(StoreError::Bloom("checksum mismatch".into()));
        }
        let (image, _): (BloomImage, usize) = decode_from_slice(&payload, bincode_config())
            .map_err(|e| StoreError::Bloom(format!("decode failed: {e}")))?;
        if image.magic != MAGIC {
            return Err(StoreError::Bloom("bad magic".into()));
        }
        if image.hashes == 0
            || image.bits == 0
            || image.words.len() as u64 != image.bits.div_ceil(64)
        {
            return Err(StoreError::Bloom("inconsistent image".into()));
        }
        Ok(Self {
            bits: image.bits,
            hashes: image.hashes,
            inserted: image.inserted,
            checks: image.checks,
            words: image.words,
        })
    }

    /// Number of keys added so far.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Number of membership probes answered so far.
    pub fn checks(&self) -> u64 {
        self.checks
    }

    pub fn bit_count(&self) -> u64 {
        self.bits
    }

    pub fn hash_count(&self) -> u32 {
        self.hashes
    }

    /// Fraction of bits set; a filter past ~0.5 is overloaded.
    pub fn fill_ratio(&self) -> f64 {
        let set: u64 = self.words.iter().map(|w| w.count_ones() as u64).sum();
        set as f64 / self.bits as f64
    }
}

/// Two independent 64-bit hashes; the k probe positions are derived by double
/// hashing. Seeded folds keep the result stable across processes.
fn hash_pair(key: &[u8]) -> (u64, u64) {
    let h1 = mix(fold(key, 0x9E37_79B9_7F4A_7C15));
    let h2 = mix(fold(key, 0xC2B2_AE3D_27D4_EB4F)) | 1;
    (h1, h2)
}

fn fold(key: &[u8], seed: u64) -> u64 {
    let mut h = seed ^ 0xCBF2_9CE4_8422_2325;
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01B3);
    }
    h
}

fn mix(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    h = h.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    h ^= h >> 33;
    h
}
