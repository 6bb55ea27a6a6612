//! Scatter-gather marshalling.
//!
//! Copies between caller byte buffers / iovec sequences and backend
//! scatter-gather arrays. The receive direction tracks a byte offset into
//! the array so a single popped [`Sga`] can serve several caller reads.

use std::io::IoSlice;

use crate::backend::Sga;

/// Copy all of `src` into `sga`'s segments in order, filling each segment
/// before moving to the next. Returns the number of bytes copied (always
/// `src.len()`).
///
/// # Panics
///
/// Panics if the array's capacity is smaller than `src` — the array is
/// allocated for exactly this payload, so a shortfall is a bug, not an I/O
/// condition.
pub fn copy_into_sga(src: &[u8], sga: &mut Sga) -> usize {
    let mut copied = 0;
    for seg in sga.segs_mut() {
        if copied == src.len() {
            break;
        }
        let dst = seg.as_mut_slice();
        let n = dst.len().min(src.len() - copied);
        dst[..n].copy_from_slice(&src[copied..copied + n]);
        copied += n;
    }
    assert_eq!(copied, src.len(), "scatter-gather array smaller than payload");
    copied
}

/// Copy a sequence of iovecs into `sga`, preserving byte order across iovec
/// boundaries. Returns total bytes copied.
///
/// # Panics
///
/// Panics under the same capacity condition as [`copy_into_sga`].
pub fn copy_iovecs_into_sga(iovs: &[IoSlice<'_>], sga: &mut Sga) -> usize {
    let total: usize = iovs.iter().map(|iov| iov.len()).sum();
    let mut copied = 0;
    let mut seg_idx = 0;
    let mut seg_off = 0;
    for iov in iovs {
        let mut src: &[u8] = iov;
        while !src.is_empty() {
            let segs = sga.segs_mut();
            assert!(seg_idx < segs.len(), "scatter-gather array smaller than payload");
            let dst = &mut segs[seg_idx].as_mut_slice()[seg_off..];
            let n = dst.len().min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
            src = &src[n..];
            seg_off += n;
            copied += n;
            if seg_off == segs[seg_idx].len() {
                seg_idx += 1;
                seg_off = 0;
            }
        }
    }
    debug_assert_eq!(copied, total);
    copied
}

/// Copy up to `dst.len()` bytes out of `sga`, starting at `*offset`, across
/// segment boundaries. Advances `*offset` by the bytes copied.
///
/// Returns `(copied, drained)` where `drained` is true once the offset has
/// reached the end of the array.
pub fn copy_from_sga(dst: &mut [u8], sga: &Sga, offset: &mut usize) -> (usize, bool) {
    let mut copied = 0;
    let mut skip = *offset;
    for seg in sga.segs() {
        let s = seg.as_slice();
        if skip >= s.len() {
            skip -= s.len();
            continue;
        }
        let avail = &s[skip..];
        skip = 0;
        let n = avail.len().min(dst.len() - copied);
        dst[copied..copied + n].copy_from_slice(&avail[..n]);
        copied += n;
        if copied == dst.len() {
            break;
        }
    }
    *offset += copied;
    (copied, *offset >= sga.len())
}
