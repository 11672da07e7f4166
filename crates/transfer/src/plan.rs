//! Part planning: how an object is cut into byte ranges.

use crate::TransferError;
use crate::types::{ByteRange, Part};

/// Splits `[0, total_size)` into ordered, contiguous parts.
///
/// Objects at or below `threshold` become a single part covering the
/// whole object. Otherwise there are `ceil(total_size / part_size)` parts
/// and only the last one may be shorter than `part_size`.
pub fn plan(total_size: u64, part_size: u64, threshold: u64) -> Result<Vec<Part>, TransferError> {
    if part_size == 0 {
        return Err(TransferError::InvalidConfiguration(
            "part size must be greater than zero".into(),
        ));
    }

    if total_size <= threshold {
        return Ok(vec![Part::new(0, ByteRange::new(0, total_size))]);
    }

    let count = total_size.div_ceil(part_size);
    let parts = (0..count)
        .map(|i| {
            let start = i * part_size;
            let end = (start + part_size).min(total_size);
            Part::new(i as usize, ByteRange::new(start, end))
        })
        .collect();
    Ok(parts)
}
