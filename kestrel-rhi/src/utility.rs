use std::ops::{Bound, RangeBounds};

use crate::error::{RhiError, RhiResult};

macro_rules! normalize_range_function {
    ($unsigned:ty) => {
        ::paste::paste! {
            /// Resolve `bounds` against a resource of `size` elements into `(offset, length)`.
            pub(crate) fn [<normalize_range_ $unsigned>]<R: RangeBounds<$unsigned>>(
                bounds: R,
                size: $unsigned,
            ) -> RhiResult<($unsigned, $unsigned)> {
                let overflow = || RhiError::invalid_descriptor("range bound overflows");
                let start = match bounds.start_bound() {
                    Bound::Included(&v) => v,
                    Bound::Excluded(&v) => v.checked_add(1).ok_or_else(overflow)?,
                    Bound::Unbounded => 0,
                };
                let end_exclusive = match bounds.end_bound() {
                    Bound::Included(&v) => v.checked_add(1).ok_or_else(overflow)?,
                    Bound::Excluded(&v) => v,
                    Bound::Unbounded => size,
                };

                if start > end_exclusive {
                    return Err(RhiError::invalid_descriptor(format!(
                        "range start {start} is past its end {end_exclusive}"
                    )));
                }
                if end_exclusive > size {
                    return Err(RhiError::invalid_descriptor(format!(
                        "range end {end_exclusive} exceeds size {size}"
                    )));
                }

                Ok((start, end_exclusive - start))
            }
        }
    };
}

normalize_range_function!(u64);
normalize_range_function!(u32);

/// Check that `offset..offset + length` lies inside `size`.
pub(crate) fn check_span(offset: u64, length: u64, size: u64, what: &str) -> RhiResult<()> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RhiError::invalid_descriptor(format!(
            "{what}: span {offset}+{length} exceeds size {size}"
        ))),
    }
}

/// Number of mip levels of a full chain for the largest extent.
pub(crate) fn full_mip_chain(width: u32, height: u32, depth: u32) -> u32 {
    let largest = width.max(height).max(depth).max(1);
    u32::BITS - largest.leading_zeros()
}

#[inline]
pub(crate) fn mip_extent(extent: u32, level: u32) -> u32 {
    (extent >> level).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_ranges() {
        assert_eq!(normalize_range_u64(.., 64).unwrap(), (0, 64));
        assert_eq!(normalize_range_u64(16..32, 64).unwrap(), (16, 16));
        assert_eq!(normalize_range_u64(16..=31, 64).unwrap(), (16, 16));
        assert_eq!(normalize_range_u32(4.., 8).unwrap(), (4, 4));
        assert!(normalize_range_u64(0..65, 64).is_err());
        assert!(normalize_range_u64(u64::MAX..=u64::MAX, 64).is_err());
    }

    #[test]
    fn spans() {
        assert!(check_span(0, 64, 64, "copy").is_ok());
        assert!(check_span(1, 64, 64, "copy").is_err());
        assert!(check_span(u64::MAX, 2, 64, "copy").is_err());
    }

    #[test]
    fn mip_chain() {
        assert_eq!(full_mip_chain(1, 1, 1), 1);
        assert_eq!(full_mip_chain(256, 128, 1), 9);
        assert_eq!(full_mip_chain(300, 1, 1), 9);
        assert_eq!(mip_extent(256, 3), 32);
        assert_eq!(mip_extent(4, 5), 1);
    }
}
