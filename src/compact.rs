//! Measurement record encoding.
//!
//! Two record formats exist. The **fixed** format carries the full runtime id,
//! 64-bit flags, `f64` value, and absolute tick timestamp. The **compact**
//! format packs a record into as few as 7 bytes: one state-flags byte, a
//! 16-bit runtime index, an `f32` value, and a timestamp differenced against a
//! shared base-time offset when it fits.
//!
//! # Compact state flags
//!
//! | bit | meaning |
//! |---|---|
//! | 0 | data-quality issue (compressed from the 32-bit flag masks) |
//! | 1 | system issue |
//! | 2 | time index selecting `base_time_offsets[0\|1]` |
//! | 3 | timestamp-quality issue |
//! | 4 | timestamp is an offset from the active base time |
//! | 5 | offset has millisecond (2-byte) rather than tick (4-byte) resolution |
//!
//! A publisher maintains two base-time offsets covering adjacent ten-minute
//! windows. When the wall clock crosses into the inactive window, the stale
//! slot is reassigned to the window after it and the time index flips. A
//! timestamp that fits neither window is emitted as an absolute 8-byte value.

use crate::cache::SignalIndexCache;
use crate::codec::{self, ByteReader};
use crate::error::{PublisherError, Result};
use crate::measurement::Measurement;
use crate::ticks;

pub const COMPACT_DATA_QUALITY_FLAG: u8 = 0x01;
pub const COMPACT_SYSTEM_ISSUE_FLAG: u8 = 0x02;
pub const COMPACT_TIME_INDEX_FLAG: u8 = 0x04;
pub const COMPACT_TIME_QUALITY_FLAG: u8 = 0x08;
pub const COMPACT_BASE_TIME_OFFSET_FLAG: u8 = 0x10;
pub const COMPACT_MILLISECOND_RESOLUTION_FLAG: u8 = 0x20;

// Regions of the full 32-bit state flags that fold into the compact bits.
const DATA_RANGE_MASK: u32 = 0x0000_00FC;
const DATA_QUALITY_MASK: u32 = 0x0000_EF03;
const TIME_QUALITY_MASK: u32 = 0x00BF_0000;
const SYSTEM_ISSUE_MASK: u32 = 0xE000_0000;
const CALCULATED_VALUE_MASK: u32 = 0x0000_1000;
const DISCARDED_VALUE_MASK: u32 = 0x0040_0000;

/// Byte length of a fixed-format record.
pub const FIXED_LENGTH: usize = 30;

/// Folds full 32-bit state flags into the three compact quality bits.
pub fn map_to_compact_flags(full_flags: u32) -> u8 {
    let mut compact = 0u8;

    if full_flags & (DATA_RANGE_MASK | DATA_QUALITY_MASK) != 0 {
        compact |= COMPACT_DATA_QUALITY_FLAG;
    }

    if full_flags & (SYSTEM_ISSUE_MASK | CALCULATED_VALUE_MASK | DISCARDED_VALUE_MASK) != 0 {
        compact |= COMPACT_SYSTEM_ISSUE_FLAG;
    }

    if full_flags & TIME_QUALITY_MASK != 0 {
        compact |= COMPACT_TIME_QUALITY_FLAG;
    }

    compact
}

/// Expands compact quality bits back to full mask values.
///
/// Expansion is idempotent with [`map_to_compact_flags`] rather than lossless:
/// each compact bit restores the whole mask region it summarizes.
pub fn map_to_full_flags(compact_flags: u8) -> u32 {
    let mut full = 0u32;

    if compact_flags & COMPACT_DATA_QUALITY_FLAG != 0 {
        full |= DATA_RANGE_MASK | DATA_QUALITY_MASK;
    }

    if compact_flags & COMPACT_SYSTEM_ISSUE_FLAG != 0 {
        full |= SYSTEM_ISSUE_MASK | CALCULATED_VALUE_MASK | DISCARDED_VALUE_MASK;
    }

    if compact_flags & COMPACT_TIME_QUALITY_FLAG != 0 {
        full |= TIME_QUALITY_MASK;
    }

    full
}

/// The two adjacent base-time windows shared by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseTimeWindows {
    pub offsets: [i64; 2],
    pub index: usize,
}

impl BaseTimeWindows {
    /// Starts the active window at `now` and the inactive one right after it.
    pub fn new(now: i64) -> Self {
        Self {
            offsets: [now, now + ticks::BASE_TIME_WINDOW],
            index: 0,
        }
    }

    pub fn active_offset(&self) -> i64 {
        self.offsets[self.index]
    }

    /// Flips to the inactive window once `now` reaches it, reassigning the
    /// stale slot to the following window. Returns true when a flip occurred.
    pub fn rotate_if_needed(&mut self, now: i64) -> bool {
        let inactive = 1 - self.index;
        if now >= self.offsets[inactive] {
            self.offsets[self.index] = self.offsets[inactive] + ticks::BASE_TIME_WINDOW;
            self.index = inactive;
            true
        } else {
            false
        }
    }
}

/// Encoder/decoder for compact measurement records, bound to one
/// subscription's signal-index cache, base-time windows, and time options.
pub struct CompactMeasurementCodec<'a> {
    cache: &'a SignalIndexCache,
    base_times: Option<&'a BaseTimeWindows>,
    include_time: bool,
    use_millisecond_resolution: bool,
}

impl<'a> CompactMeasurementCodec<'a> {
    pub fn new(
        cache: &'a SignalIndexCache,
        base_times: Option<&'a BaseTimeWindows>,
        include_time: bool,
        use_millisecond_resolution: bool,
    ) -> Self {
        Self {
            cache,
            base_times,
            include_time,
            use_millisecond_resolution,
        }
    }

    /// Byte length of one record given whether its timestamp fits the base
    /// offset.
    pub fn byte_length(&self, using_base_time_offset: bool) -> usize {
        let mut length = 7;

        if self.include_time {
            if using_base_time_offset {
                if self.use_millisecond_resolution {
                    length += 2;
                } else {
                    length += 4;
                }
            } else {
                length += 8;
            }
        }

        length
    }

    fn offset_fits(&self, difference: i64) -> bool {
        if difference < 0 {
            return false;
        }
        if self.use_millisecond_resolution {
            difference / ticks::PER_MILLISECOND <= i64::from(u16::MAX)
        } else {
            difference <= i64::from(u32::MAX)
        }
    }

    /// Appends one compact record to `buffer`, returning its length.
    pub fn serialize(
        &self,
        measurement: &Measurement,
        runtime_index: u16,
        buffer: &mut Vec<u8>,
    ) -> usize {
        let mut compact_flags = map_to_compact_flags(measurement.flags);

        let mut difference = 0i64;
        let mut using_base_time_offset = false;

        if let Some(base_times) = self.base_times {
            difference = measurement.timestamp - base_times.active_offset();
            using_base_time_offset = self.offset_fits(difference);

            if using_base_time_offset {
                if base_times.index != 0 {
                    compact_flags |= COMPACT_TIME_INDEX_FLAG;
                }
                compact_flags |= COMPACT_BASE_TIME_OFFSET_FLAG;
                if self.use_millisecond_resolution {
                    compact_flags |= COMPACT_MILLISECOND_RESOLUTION_FLAG;
                }
            }
        }

        let start = buffer.len();
        buffer.push(compact_flags);
        codec::write_u16(buffer, runtime_index);
        codec::write_f32(buffer, measurement.adjusted_value() as f32);

        if self.include_time {
            if using_base_time_offset {
                if self.use_millisecond_resolution {
                    codec::write_u16(buffer, (difference / ticks::PER_MILLISECOND) as u16);
                } else {
                    codec::write_u32(buffer, difference as u32);
                }
            } else {
                codec::write_i64(buffer, measurement.timestamp);
            }
        }

        buffer.len() - start
    }

    /// Parses one compact record, resolving the signal through the cache.
    pub fn parse(&self, reader: &mut ByteReader<'_>) -> Result<Measurement> {
        let compact_flags = reader.read_u8()?;
        let time_index = usize::from(compact_flags & COMPACT_TIME_INDEX_FLAG != 0);
        let using_base_time_offset = compact_flags & COMPACT_BASE_TIME_OFFSET_FLAG != 0;
        let millisecond_resolution = compact_flags & COMPACT_MILLISECOND_RESOLUTION_FLAG != 0;

        let runtime_index = reader.read_u16()?;
        let signal_id = self.cache.signal_id(runtime_index).ok_or_else(|| {
            PublisherError::ProtocolViolation(format!(
                "runtime index {runtime_index} not present in signal-index cache"
            ))
        })?;

        let value = f64::from(reader.read_f32()?);

        let mut timestamp = 0i64;
        if self.include_time {
            if !using_base_time_offset {
                timestamp = reader.read_i64()?;
            } else {
                let base_times = self.base_times.ok_or_else(|| {
                    PublisherError::ProtocolViolation(
                        "record references undefined base-time offset".to_string(),
                    )
                })?;
                let base = base_times.offsets[time_index];
                if millisecond_resolution {
                    timestamp = i64::from(reader.read_u16()?) * ticks::PER_MILLISECOND + base;
                } else {
                    timestamp = i64::from(reader.read_u32()?) + base;
                }
            }
        }

        Ok(Measurement {
            runtime_id: u32::from(runtime_index),
            signal_id,
            value,
            adder: 0.0,
            multiplier: 1.0,
            timestamp,
            flags: map_to_full_flags(compact_flags),
        })
    }
}

/// Appends one fixed-format record to `buffer`.
pub fn serialize_fixed(measurement: &Measurement, runtime_id: u32, buffer: &mut Vec<u8>) {
    codec::write_u32(buffer, runtime_id);
    codec::write_u64(buffer, u64::from(measurement.flags));
    codec::write_f64(buffer, measurement.adjusted_value());
    codec::write_i64(buffer, measurement.timestamp);
    codec::write_u16(buffer, 0); // reserved
}

/// Parses one fixed-format record. The signal ID resolves through `cache`
/// when the runtime id is a known index; otherwise it is left nil.
pub fn parse_fixed(
    reader: &mut ByteReader<'_>,
    cache: Option<&SignalIndexCache>,
) -> Result<Measurement> {
    let runtime_id = reader.read_u32()?;
    let flags = reader.read_u64()?;
    let value = reader.read_f64()?;
    let timestamp = reader.read_i64()?;
    let _reserved = reader.read_u16()?;

    let signal_id = cache
        .and_then(|cache| u16::try_from(runtime_id).ok().and_then(|i| cache.signal_id(i)))
        .unwrap_or_default();

    Ok(Measurement {
        runtime_id,
        signal_id,
        value,
        adder: 0.0,
        multiplier: 1.0,
        timestamp,
        flags: flags as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_cache() -> SignalIndexCache {
        let mut cache = SignalIndexCache::new();
        cache.add(Uuid::new_v4(), "PPA", 1, "SHELBY-FQ");
        cache.add(Uuid::new_v4(), "PPA", 2, "SHELBY-PA1");
        cache
    }

    #[test]
    fn test_compact_roundtrip_tick_offset() {
        let cache = sample_cache();
        let now = ticks::now();
        let base_times = BaseTimeWindows::new(now);
        let codec = CompactMeasurementCodec::new(&cache, Some(&base_times), true, false);

        let mut measurement = Measurement::new(cache.signal_id(0).unwrap(), 60.02, now + 1_234_567);
        measurement.runtime_id = 0;

        let mut buffer = Vec::new();
        let length = codec.serialize(&measurement, 0, &mut buffer);
        assert_eq!(length, codec.byte_length(true));
        assert_eq!(buffer.len(), 7 + 4);

        let mut reader = ByteReader::new(&buffer);
        let decoded = codec.parse(&mut reader).expect("parse");
        assert_eq!(decoded.signal_id, measurement.signal_id);
        assert_eq!(decoded.timestamp, measurement.timestamp);
        assert!((decoded.value - measurement.value).abs() <= f64::from(f32::EPSILON) * 61.0);
    }

    #[test]
    fn test_compact_roundtrip_millisecond_offset() {
        let cache = sample_cache();
        let now = ticks::now();
        let base_times = BaseTimeWindows::new(now);
        let codec = CompactMeasurementCodec::new(&cache, Some(&base_times), true, true);

        // Whole milliseconds survive; sub-millisecond detail is truncated.
        let timestamp = now + 250 * ticks::PER_MILLISECOND;
        let measurement = Measurement::new(cache.signal_id(1).unwrap(), -1.5, timestamp);

        let mut buffer = Vec::new();
        codec.serialize(&measurement, 1, &mut buffer);
        assert_eq!(buffer.len(), 7 + 2);

        let mut reader = ByteReader::new(&buffer);
        let decoded = codec.parse(&mut reader).expect("parse");
        assert_eq!(decoded.timestamp, timestamp);
        assert_eq!(decoded.value, -1.5);
    }

    #[test]
    fn test_compact_absolute_timestamp_outside_window() {
        let cache = sample_cache();
        let now = ticks::now();
        let base_times = BaseTimeWindows::new(now);
        let codec = CompactMeasurementCodec::new(&cache, Some(&base_times), true, false);

        // Older than the active window start: cannot be differenced.
        let timestamp = now - ticks::PER_SECOND;
        let measurement = Measurement::new(cache.signal_id(0).unwrap(), 0.0, timestamp);

        let mut buffer = Vec::new();
        codec.serialize(&measurement, 0, &mut buffer);
        assert_eq!(buffer.len(), 7 + 8);
        assert_eq!(buffer[0] & COMPACT_BASE_TIME_OFFSET_FLAG, 0);

        let mut reader = ByteReader::new(&buffer);
        let decoded = codec.parse(&mut reader).expect("parse");
        assert_eq!(decoded.timestamp, timestamp);
    }

    #[test]
    fn test_compact_without_time() {
        let cache = sample_cache();
        let codec = CompactMeasurementCodec::new(&cache, None, false, false);
        let measurement = Measurement::new(cache.signal_id(0).unwrap(), 42.0, ticks::now());

        let mut buffer = Vec::new();
        codec.serialize(&measurement, 0, &mut buffer);
        assert_eq!(buffer.len(), 7);

        let mut reader = ByteReader::new(&buffer);
        let decoded = codec.parse(&mut reader).expect("parse");
        assert_eq!(decoded.timestamp, 0);
        assert_eq!(decoded.value, 42.0);
    }

    #[test]
    fn test_nan_survives_f32_cast() {
        let cache = sample_cache();
        let codec = CompactMeasurementCodec::new(&cache, None, false, false);
        let measurement = Measurement::new(cache.signal_id(0).unwrap(), f64::NAN, 0);

        let mut buffer = Vec::new();
        codec.serialize(&measurement, 0, &mut buffer);
        let mut reader = ByteReader::new(&buffer);
        assert!(codec.parse(&mut reader).unwrap().value.is_nan());
    }

    #[test]
    fn test_unknown_runtime_index_rejected() {
        let cache = sample_cache();
        let codec = CompactMeasurementCodec::new(&cache, None, false, false);

        let mut buffer = Vec::new();
        buffer.push(0);
        codec::write_u16(&mut buffer, 999);
        codec::write_f32(&mut buffer, 1.0);

        let mut reader = ByteReader::new(&buffer);
        assert!(codec.parse(&mut reader).is_err());
    }

    #[test]
    fn test_adjusted_value_encoded() {
        let cache = sample_cache();
        let codec = CompactMeasurementCodec::new(&cache, None, false, false);
        let mut measurement = Measurement::new(cache.signal_id(0).unwrap(), 10.0, 0);
        measurement.multiplier = 3.0;
        measurement.adder = 1.0;

        let mut buffer = Vec::new();
        codec.serialize(&measurement, 0, &mut buffer);
        let mut reader = ByteReader::new(&buffer);
        assert_eq!(codec.parse(&mut reader).unwrap().value, 31.0);
    }

    #[test]
    fn test_fixed_roundtrip() {
        let cache = sample_cache();
        let mut measurement =
            Measurement::new(cache.signal_id(1).unwrap(), 0.0001220703125, 636_000_000_000_000_000);
        measurement.flags = 0x00BF_0003;
        measurement.runtime_id = 1;

        let mut buffer = Vec::new();
        serialize_fixed(&measurement, 1, &mut buffer);
        assert_eq!(buffer.len(), FIXED_LENGTH);

        let mut reader = ByteReader::new(&buffer);
        let decoded = parse_fixed(&mut reader, Some(&cache)).expect("parse");
        assert_eq!(decoded, measurement);
    }

    #[test]
    fn test_flag_compression_idempotent() {
        for full in [0u32, 0x0000_0003, 0xE000_0000, 0x00BF_0000, 0xFFFF_FFFF] {
            let expanded = map_to_full_flags(map_to_compact_flags(full));
            let twice = map_to_full_flags(map_to_compact_flags(expanded));
            assert_eq!(expanded, twice);
        }
    }

    #[test]
    fn test_base_time_rotation() {
        let start = ticks::now();
        let mut windows = BaseTimeWindows::new(start);
        assert_eq!(windows.index, 0);
        assert_eq!(windows.active_offset(), start);

        // Still inside the active window.
        assert!(!windows.rotate_if_needed(start + ticks::BASE_TIME_WINDOW - 1));

        // Crossing the boundary flips to the second window and reassigns the
        // stale slot to the window after it.
        assert!(windows.rotate_if_needed(start + ticks::BASE_TIME_WINDOW));
        assert_eq!(windows.index, 1);
        assert_eq!(windows.active_offset(), start + ticks::BASE_TIME_WINDOW);
        assert_eq!(windows.offsets[0], start + 2 * ticks::BASE_TIME_WINDOW);

        // Both offsets straddle the clock.
        let now = start + ticks::BASE_TIME_WINDOW + 1;
        assert!(windows.active_offset() <= now);
        assert!(windows.offsets[0] > now);
    }

    #[test]
    fn test_time_index_flag_reflected() {
        let cache = sample_cache();
        let start = ticks::now();
        let mut windows = BaseTimeWindows::new(start);
        windows.rotate_if_needed(start + ticks::BASE_TIME_WINDOW);
        assert_eq!(windows.index, 1);

        let codec = CompactMeasurementCodec::new(&cache, Some(&windows), true, false);
        let timestamp = windows.active_offset() + 5 * ticks::PER_SECOND;
        let measurement = Measurement::new(cache.signal_id(0).unwrap(), 1.0, timestamp);

        let mut buffer = Vec::new();
        codec.serialize(&measurement, 0, &mut buffer);
        assert_ne!(buffer[0] & COMPACT_TIME_INDEX_FLAG, 0);

        let mut reader = ByteReader::new(&buffer);
        assert_eq!(codec.parse(&mut reader).unwrap().timestamp, timestamp);
    }
}
