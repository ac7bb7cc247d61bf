//! Event block encoding for the backing store
//!
//! Implements column-major restructuring + LZ4 compression for event
//! payload blocks.
//!
//! Strategy:
//! 1. Split events into per-field columns (coordinates per dimension,
//!    signals, errors, tags)
//! 2. Serialize the columns to a compact binary format
//! 3. LZ4 compress the result
//!
//! Columns compress far better than interleaved records because adjacent
//! values within a leaf box are numerically close.

use crate::error::{EngineError, EngineResult};
use crate::tree::types::MdEvent;
use serde::{Deserialize, Serialize};

/// Intermediate column-major form of an event block
#[derive(Debug, Serialize, Deserialize)]
struct EncodedBlock {
    /// Dimensionality the block was written with
    nd: u32,
    /// Number of events
    count: u64,
    /// Coordinates, dimension-major: `coords[d * count + i]`
    coords: Vec<f32>,
    /// Signal per event
    signals: Vec<f32>,
    /// Squared error per event
    errors: Vec<f32>,
    /// Run index per event
    run_indexes: Vec<u16>,
    /// Detector id per event
    detector_ids: Vec<u32>,
}

/// Compress a block of events ready for storage
pub fn encode_events<const ND: usize>(events: &[MdEvent<ND>]) -> EngineResult<Vec<u8>> {
    let count = events.len();

    let mut coords = Vec::with_capacity(ND * count);
    for d in 0..ND {
        coords.extend(events.iter().map(|ev| ev.center[d]));
    }

    let block = EncodedBlock {
        nd: ND as u32,
        count: count as u64,
        coords,
        signals: events.iter().map(|ev| ev.signal).collect(),
        errors: events.iter().map(|ev| ev.error_sq).collect(),
        run_indexes: events.iter().map(|ev| ev.run_index).collect(),
        detector_ids: events.iter().map(|ev| ev.detector_id).collect(),
    };

    let serialized = bincode::serialize(&block)?;
    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decompress a block back to events
///
/// Fails with `CorruptedCache` if the stored dimensionality does not match
/// `ND` or the columns disagree on length.
pub fn decode_events<const ND: usize>(data: &[u8]) -> EngineResult<Vec<MdEvent<ND>>> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| EngineError::Compression(format!("LZ4 decompression failed: {}", e)))?;

    let block: EncodedBlock = bincode::deserialize(&decompressed)?;

    if block.nd as usize != ND {
        return Err(EngineError::CorruptedCache(format!(
            "Block dimensionality {} does not match engine dimensionality {}",
            block.nd, ND
        )));
    }

    let count = block.count as usize;
    if block.coords.len() != ND * count
        || block.signals.len() != count
        || block.errors.len() != count
        || block.run_indexes.len() != count
        || block.detector_ids.len() != count
    {
        return Err(EngineError::CorruptedCache(
            "Block column lengths are inconsistent".to_string(),
        ));
    }

    let mut events = Vec::with_capacity(count);
    for i in 0..count {
        let mut center = [0.0_f32; ND];
        for (d, c) in center.iter_mut().enumerate() {
            *c = block.coords[d * count + i];
        }
        events.push(MdEvent {
            center,
            signal: block.signals[i],
            error_sq: block.errors[i],
            run_index: block.run_indexes[i],
            detector_id: block.detector_ids[i],
        });
    }

    Ok(events)
}

/// Compression statistics for a block
#[derive(Debug)]
pub struct EncodingStats {
    /// Number of events
    pub event_count: usize,
    /// Raw in-memory size (bytes)
    pub raw_size: usize,
    /// Encoded size (bytes)
    pub encoded_size: usize,
    /// Compression ratio (raw / encoded)
    pub ratio: f64,
}

/// Calculate encoding statistics
pub fn encoding_stats<const ND: usize>(events: &[MdEvent<ND>], encoded: &[u8]) -> EncodingStats {
    let raw_size = events.len() * std::mem::size_of::<MdEvent<ND>>();
    let encoded_size = encoded.len();
    let ratio = if encoded_size > 0 {
        raw_size as f64 / encoded_size as f64
    } else {
        0.0
    };

    EncodingStats {
        event_count: events.len(),
        raw_size,
        encoded_size,
        ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_empty() {
        let events: Vec<MdEvent<3>> = vec![];
        let encoded = encode_events(&events).unwrap();
        let decoded: Vec<MdEvent<3>> = decode_events(&encoded).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_encode_decode_single() {
        let events = vec![MdEvent::new([1.0, 2.0], 3.5, 0.25).tagged(7, 42)];
        let encoded = encode_events(&events).unwrap();
        let decoded: Vec<MdEvent<2>> = decode_events(&encoded).unwrap();

        assert_eq!(decoded, events);
    }

    #[test]
    fn test_encode_decode_many() {
        let events: Vec<MdEvent<3>> = (0..500)
            .map(|i| {
                let x = i as f32 * 0.01;
                MdEvent::new([x, x * 2.0, x * 3.0], 1.0, 1.0).tagged((i % 4) as u16, i)
            })
            .collect();

        let encoded = encode_events(&events).unwrap();
        let decoded: Vec<MdEvent<3>> = decode_events(&encoded).unwrap();

        assert_eq!(decoded, events);
    }

    #[test]
    fn test_dimension_mismatch() {
        let events = vec![MdEvent::<2>::at([0.5, 0.5])];
        let encoded = encode_events(&events).unwrap();

        let result: EngineResult<Vec<MdEvent<3>>> = decode_events(&encoded);
        assert!(matches!(result, Err(EngineError::CorruptedCache(_))));
    }

    #[test]
    fn test_compression_ratio() {
        // Events clustered in a small region compress well column-wise
        let events: Vec<MdEvent<2>> = (0..1000)
            .map(|i| {
                let t = i as f32 * 1e-4;
                MdEvent::new([0.5 + t, 0.25 + t], 1.0, 1.0)
            })
            .collect();

        let encoded = encode_events(&events).unwrap();
        let stats = encoding_stats(&events, &encoded);

        assert!(
            stats.ratio > 1.5,
            "Compression ratio too low: {}",
            stats.ratio
        );
    }

    #[test]
    fn test_garbage_input() {
        let result: EngineResult<Vec<MdEvent<2>>> = decode_events(&[1, 2, 3, 4]);
        assert!(result.is_err());
    }
}
