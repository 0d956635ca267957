//! Signal-index cache.
//!
//! Each subscription compiles its filter expression into a cache mapping a
//! compact 16-bit runtime index to the full signal identity (signal ID,
//! source, numeric id, point tag). The cache is frozen for the subscription's
//! lifetime and replaced atomically on re-subscribe.
//!
//! # Wire layout
//!
//! ```text
//! u32 entry_count
//! per entry:
//!   u32 runtime_index
//!   16-byte signal ID (GEP layout)
//!   u32 source_len, source bytes
//!   u32 id
//!   u32 tag_len, tag bytes
//! u32 unauthorized_count, 16-byte signal IDs…   (zero-length when open)
//! ```

use std::collections::HashMap;

use uuid::Uuid;

use crate::codec::{self, ByteReader, Encoding};
use crate::error::{PublisherError, Result};

/// Invertible mapping between 16-bit runtime indices and signal identities.
#[derive(Debug, Clone, Default)]
pub struct SignalIndexCache {
    reference: HashMap<u16, usize>,
    signal_ids: Vec<Uuid>,
    sources: Vec<String>,
    ids: Vec<u32>,
    tags: Vec<String>,
    signal_id_lookup: HashMap<Uuid, u16>,
    unauthorized_ids: Vec<Uuid>,
}

impl SignalIndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a signal, assigning the next sequential runtime index.
    pub fn add(&mut self, signal_id: Uuid, source: &str, id: u32, tag: &str) -> u16 {
        let runtime_index = self.signal_ids.len() as u16;
        self.reference.insert(runtime_index, self.signal_ids.len());
        self.signal_ids.push(signal_id);
        self.sources.push(source.to_string());
        self.ids.push(id);
        self.tags.push(tag.to_string());
        self.signal_id_lookup.insert(signal_id, runtime_index);
        runtime_index
    }

    /// Records a signal the subscriber requested but is not authorized for.
    pub fn add_unauthorized(&mut self, signal_id: Uuid) {
        self.unauthorized_ids.push(signal_id);
    }

    pub fn contains(&self, runtime_index: u16) -> bool {
        self.reference.contains_key(&runtime_index)
    }

    pub fn signal_id(&self, runtime_index: u16) -> Option<Uuid> {
        self.reference
            .get(&runtime_index)
            .map(|&slot| self.signal_ids[slot])
    }

    pub fn source(&self, runtime_index: u16) -> Option<&str> {
        self.reference
            .get(&runtime_index)
            .map(|&slot| self.sources[slot].as_str())
    }

    pub fn id(&self, runtime_index: u16) -> Option<u32> {
        self.reference.get(&runtime_index).map(|&slot| self.ids[slot])
    }

    pub fn tag(&self, runtime_index: u16) -> Option<&str> {
        self.reference
            .get(&runtime_index)
            .map(|&slot| self.tags[slot].as_str())
    }

    /// Runtime index for a signal ID, if the signal is in this cache.
    pub fn runtime_index(&self, signal_id: &Uuid) -> Option<u16> {
        self.signal_id_lookup.get(signal_id).copied()
    }

    pub fn signal_ids(&self) -> &[Uuid] {
        &self.signal_ids
    }

    pub fn unauthorized_ids(&self) -> &[Uuid] {
        &self.unauthorized_ids
    }

    pub fn len(&self) -> usize {
        self.signal_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signal_ids.is_empty()
    }

    /// Serializes the cache for an `UpdateSignalIndexCache` response.
    ///
    /// Source and tag strings always use UTF-8 regardless of the negotiated
    /// command encoding; the cache layout is encoding-independent.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(64 * self.len() + 8);
        codec::write_u32(&mut buffer, self.len() as u32);

        for (slot, signal_id) in self.signal_ids.iter().enumerate() {
            let runtime_index = slot as u32;
            codec::write_u32(&mut buffer, runtime_index);
            codec::write_guid(&mut buffer, signal_id);
            codec::write_string(&mut buffer, &self.sources[slot], Encoding::Utf8);
            codec::write_u32(&mut buffer, self.ids[slot]);
            codec::write_string(&mut buffer, &self.tags[slot], Encoding::Utf8);
        }

        codec::write_u32(&mut buffer, self.unauthorized_ids.len() as u32);
        for signal_id in &self.unauthorized_ids {
            codec::write_guid(&mut buffer, signal_id);
        }

        buffer
    }

    /// Parses a serialized cache (inverse of [`Self::serialize`]).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let mut cache = SignalIndexCache::new();

        let entry_count = reader.read_u32()?;
        for _ in 0..entry_count {
            let runtime_index = reader.read_u32()?;
            if runtime_index > u32::from(u16::MAX) {
                return Err(PublisherError::ProtocolViolation(format!(
                    "runtime index {runtime_index} exceeds 16-bit range"
                )));
            }
            let signal_id = reader.read_guid()?;
            let source = reader.read_string(Encoding::Utf8)?;
            let id = reader.read_u32()?;
            let tag = reader.read_string(Encoding::Utf8)?;

            let assigned = cache.add(signal_id, &source, id, &tag);
            if u32::from(assigned) != runtime_index {
                return Err(PublisherError::ProtocolViolation(format!(
                    "non-sequential runtime index {runtime_index} (expected {assigned})"
                )));
            }
        }

        let unauthorized_count = reader.read_u32()?;
        for _ in 0..unauthorized_count {
            cache.add_unauthorized(reader.read_guid()?);
        }

        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cache() -> SignalIndexCache {
        let mut cache = SignalIndexCache::new();
        cache.add(Uuid::new_v4(), "PPA", 1, "SHELBY-FQ");
        cache.add(Uuid::new_v4(), "PPA", 2, "SHELBY-PA1");
        cache.add(Uuid::new_v4(), "PPA", 3, "SHELBY-PM1");
        cache
    }

    #[test]
    fn test_sequential_runtime_indices() {
        let cache = sample_cache();
        assert_eq!(cache.len(), 3);
        for index in 0..3u16 {
            assert!(cache.contains(index));
        }
        assert!(!cache.contains(3));
    }

    #[test]
    fn test_invertible_mapping() {
        let cache = sample_cache();
        for index in 0..3u16 {
            let signal_id = cache.signal_id(index).expect("entry present");
            assert_eq!(cache.runtime_index(&signal_id), Some(index));
        }
        assert_eq!(cache.runtime_index(&Uuid::new_v4()), None);
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let mut cache = sample_cache();
        cache.add_unauthorized(Uuid::new_v4());

        let parsed = SignalIndexCache::parse(&cache.serialize()).expect("parse");
        assert_eq!(parsed.len(), cache.len());
        for index in 0..cache.len() as u16 {
            assert_eq!(parsed.signal_id(index), cache.signal_id(index));
            assert_eq!(parsed.source(index), cache.source(index));
            assert_eq!(parsed.id(index), cache.id(index));
            assert_eq!(parsed.tag(index), cache.tag(index));
        }
        assert_eq!(parsed.unauthorized_ids(), cache.unauthorized_ids());
    }

    #[test]
    fn test_parse_truncated_fails() {
        let serialized = sample_cache().serialize();
        assert!(SignalIndexCache::parse(&serialized[..serialized.len() - 3]).is_err());
    }
}
