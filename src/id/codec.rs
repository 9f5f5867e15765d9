//! Opaque record identifier codec
//!
//! Every record id is a fixed 32-character string that self-describes
//! its owning shard:
//!
//! ```text
//! chars  0..10   timestamp, ms since epoch, base36, zero-padded
//! chars 10..20   shard-id hash, base36 of FNV-1a
//! chars 20..24   record-type hash, base36 of FNV-1a
//! chars 24..32   random segment
//! ```
//!
//! The hash segments are pure deterministic functions of the shard id
//! and record type, so any process that registers the same names can
//! decode any id regardless of where it was generated. The reverse
//! mappings live in bounded LRU caches; decoding a hash this codec has
//! never seen fails with `UnknownMapping`.

use super::cache::{BidiCache, CacheStats};
use crate::core::{Result, ShardError};
use std::sync::Mutex;
use uuid::Uuid;

pub const ID_LENGTH: usize = 32;
const TIMESTAMP_LEN: usize = 10;
const SHARD_HASH_LEN: usize = 10;
const TYPE_HASH_LEN: usize = 4;
const RANDOM_LEN: usize = 8;
const DEFAULT_CACHE_CAPACITY: usize = 1000;

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Inputs for identifier generation.
#[derive(Debug, Clone)]
pub struct IdRequest {
    pub shard_id: String,
    pub record_type: String,
    /// Milliseconds since epoch; defaults to now.
    pub timestamp: Option<i64>,
}

impl IdRequest {
    pub fn new(shard_id: impl Into<String>, record_type: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            record_type: record_type.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Fields recovered from a decoded identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedId {
    pub shard_id: String,
    pub record_type: String,
    pub timestamp: i64,
    pub random: String,
}

/// Identifier generator/decoder with bounded bidirectional hash caches.
pub struct IdCodec {
    shards: Mutex<BidiCache>,
    types: Mutex<BidiCache>,
    capacity: usize,
}

impl Default for IdCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl IdCodec {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shards: Mutex::new(BidiCache::new(capacity)),
            types: Mutex::new(BidiCache::new(capacity)),
            capacity,
        }
    }

    /// Generate a fresh identifier embedding shard, record type,
    /// timestamp and randomness.
    pub fn generate(&self, request: &IdRequest) -> Result<String> {
        if request.shard_id.is_empty() {
            return Err(ShardError::Validation("shard id is required".into()));
        }
        if request.record_type.is_empty() {
            return Err(ShardError::Validation("record type is required".into()));
        }

        let timestamp = request
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        if timestamp < 0 {
            return Err(ShardError::Validation(format!(
                "timestamp must be non-negative, got {timestamp}"
            )));
        }

        let shard_hash = self.register_shard(&request.shard_id)?;
        let type_hash = self.register_record_type(&request.record_type)?;

        let mut id = String::with_capacity(ID_LENGTH);
        id.push_str(&encode_base36(timestamp as u64, TIMESTAMP_LEN));
        id.push_str(&shard_hash);
        id.push_str(&type_hash);
        id.push_str(&random_segment());

        debug_assert_eq!(id.len(), ID_LENGTH);
        Ok(id)
    }

    /// Decode an identifier back into the fields it was generated from.
    pub fn decode(&self, id: &str) -> Result<DecodedId> {
        if id.len() != ID_LENGTH || !id.is_ascii() {
            return Err(ShardError::InvalidLength {
                expected: ID_LENGTH,
                actual: id.len(),
            });
        }

        let ts_segment = &id[..TIMESTAMP_LEN];
        let shard_segment = &id[TIMESTAMP_LEN..TIMESTAMP_LEN + SHARD_HASH_LEN];
        let type_segment = &id[TIMESTAMP_LEN + SHARD_HASH_LEN..ID_LENGTH - RANDOM_LEN];
        let random = &id[ID_LENGTH - RANDOM_LEN..];

        let timestamp = decode_base36(ts_segment).ok_or_else(|| {
            ShardError::UnknownMapping(format!("malformed timestamp segment '{ts_segment}'"))
        })?;

        let shard_id = self
            .shards
            .lock()?
            .name_for(shard_segment)
            .ok_or_else(|| {
                ShardError::UnknownMapping(format!("unknown shard hash '{shard_segment}'"))
            })?;

        let record_type = self.types.lock()?.name_for(type_segment).ok_or_else(|| {
            ShardError::UnknownMapping(format!("unknown record type hash '{type_segment}'"))
        })?;

        Ok(DecodedId {
            shard_id,
            record_type,
            timestamp: timestamp as i64,
            random: random.to_string(),
        })
    }

    /// Pre-seed the shard cache so ids generated elsewhere decode here.
    /// Returns the shard's hash segment.
    pub fn register_shard(&self, shard_id: &str) -> Result<String> {
        let mut cache = self.shards.lock()?;
        if let Some(hash) = cache.hash_for(shard_id) {
            return Ok(hash);
        }
        let hash = encode_base36(fnv1a64(shard_id), SHARD_HASH_LEN);
        cache.insert(shard_id, &hash);
        Ok(hash)
    }

    /// Pre-seed the record-type cache. Returns the type's hash segment.
    pub fn register_record_type(&self, record_type: &str) -> Result<String> {
        let mut cache = self.types.lock()?;
        if let Some(hash) = cache.hash_for(record_type) {
            return Ok(hash);
        }
        let hash = encode_base36(fnv1a64(record_type), TYPE_HASH_LEN);
        cache.insert(record_type, &hash);
        Ok(hash)
    }

    /// Cache occupancy, for observability endpoints.
    pub fn cache_stats(&self) -> Result<CacheStats> {
        let shards = self.shards.lock()?;
        let types = self.types.lock()?;
        Ok(CacheStats {
            shard_cache_size: shards.len(),
            type_cache_size: types.len(),
            reverse_shard_cache_size: shards.reverse_len(),
            reverse_type_cache_size: types.reverse_len(),
            max_cache_size: self.capacity,
        })
    }
}

fn fnv1a64(input: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    input.bytes().fold(OFFSET, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(PRIME)
    })
}

/// Fixed-width base36 rendering of `value mod 36^width`.
fn encode_base36(mut value: u64, width: usize) -> String {
    let mut buf = vec![b'0'; width];
    for slot in buf.iter_mut().rev() {
        *slot = BASE36_ALPHABET[(value % 36) as usize];
        value /= 36;
    }
    buf.iter().map(|b| *b as char).collect()
}

fn decode_base36(segment: &str) -> Option<u64> {
    segment.chars().try_fold(0u64, |acc, c| {
        let digit = c.to_digit(36)? as u64;
        acc.checked_mul(36)?.checked_add(digit)
    })
}

fn random_segment() -> String {
    Uuid::new_v4().simple().to_string()[..RANDOM_LEN].to_string()
}
