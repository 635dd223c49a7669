//! Row-major region copies between shard buffers
//!
//! Every shard buffer is a dense row-major array covering a rectangular slice
//! of the global tensor. Gathering, scattering and shard-to-shard resharding
//! all reduce to copying the intersection of two such slices.

use std::ops::Range;

/// Number of elements in a shape (1 for a scalar)
pub fn elem_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Extent of every dimension of a slice
pub fn slice_shape(slices: &[Range<usize>]) -> Vec<usize> {
    slices.iter().map(|r| r.end.saturating_sub(r.start)).collect()
}

/// Number of elements covered by a slice
pub fn slice_volume(slices: &[Range<usize>]) -> usize {
    elem_count(&slice_shape(slices))
}

/// The slice covering a whole array
pub fn full_slices(shape: &[usize]) -> Vec<Range<usize>> {
    shape.iter().map(|&len| 0..len).collect()
}

/// Intersection of two slices of the same rank, `None` when empty
pub fn intersect(a: &[Range<usize>], b: &[Range<usize>]) -> Option<Vec<Range<usize>>> {
    let region: Vec<Range<usize>> = a
        .iter()
        .zip(b)
        .map(|(x, y)| x.start.max(y.start)..x.end.min(y.end))
        .collect();
    if region.iter().any(|r| r.start >= r.end) {
        return None;
    }
    Some(region)
}

/// Row-major strides, in elements
fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Copy the global `region` from a buffer covering `src_slices` into one covering `dst_slices`
///
/// `region` must lie inside both slices. Copies one contiguous run per row of
/// the innermost dimension.
pub fn copy_region(
    src: &[u8],
    src_slices: &[Range<usize>],
    dst: &mut [u8],
    dst_slices: &[Range<usize>],
    region: &[Range<usize>],
    elem_size: usize,
) {
    let rank = region.len();
    if rank == 0 {
        dst[..elem_size].copy_from_slice(&src[..elem_size]);
        return;
    }

    let extent = slice_shape(region);
    if extent.iter().any(|&e| e == 0) {
        return;
    }

    let src_strides = strides(&slice_shape(src_slices));
    let dst_strides = strides(&slice_shape(dst_slices));
    let src_origin: Vec<usize> = region.iter().zip(src_slices).map(|(r, s)| r.start - s.start).collect();
    let dst_origin: Vec<usize> = region.iter().zip(dst_slices).map(|(r, s)| r.start - s.start).collect();
    let run = extent[rank - 1] * elem_size;

    let outer = rank - 1;
    let mut index = vec![0usize; outer];
    loop {
        let mut src_offset = src_origin[outer];
        let mut dst_offset = dst_origin[outer];
        for d in 0..outer {
            src_offset += (src_origin[d] + index[d]) * src_strides[d];
            dst_offset += (dst_origin[d] + index[d]) * dst_strides[d];
        }
        let s = src_offset * elem_size;
        let t = dst_offset * elem_size;
        dst[t..t + run].copy_from_slice(&src[s..s + run]);

        // odometer over the outer dimensions
        let mut d = outer;
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            index[d] += 1;
            if index[d] < extent[d] {
                break;
            }
            index[d] = 0;
        }
    }
}
