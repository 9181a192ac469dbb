// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-thread scratch memory for partial reduction results.

use crate::macros::{log_debug, log_error};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Size of a cache line, in bytes. The total buffer size is always a multiple
/// of it.
pub const CACHE_LINE: usize = 64;

/// Rounds `bytes` up to a multiple of [`CACHE_LINE`], or returns [`None`] on
/// overflow.
fn round_up_to_cache_line(bytes: usize) -> Option<usize> {
    Some(bytes.checked_add(CACHE_LINE - 1)? & !(CACHE_LINE - 1))
}

/// A live heap allocation.
struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
}

/// A contiguous aligned buffer, split into one equally-sized slice per thread.
pub struct ReductionBuffer {
    /// Alignment of the buffer start. Each slice starts at a multiple of it.
    alignment: usize,
    /// Number of slices.
    num_slices: usize,
    /// Size of each slice in bytes, 0 when nothing is allocated.
    entry_size: usize,
    allocation: Option<Allocation>,
}

// SAFETY: The buffer owns its allocation, like a `Box<[u8]>` would.
unsafe impl Send for ReductionBuffer {}
// SAFETY: Shared references only give shared access to the bytes.
unsafe impl Sync for ReductionBuffer {}

impl ReductionBuffer {
    /// Creates an unallocated buffer for `num_slices` threads.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` isn't a power of two, or if `num_slices` is zero.
    pub fn new(alignment: usize, num_slices: usize) -> Self {
        assert!(num_slices > 0, "a buffer needs at least one slice");
        // The rounding arithmetic and `Layout` both rely on this.
        assert!(
            alignment.is_power_of_two(),
            "buffer alignment must be a power of two, got {alignment}"
        );
        Self {
            alignment,
            num_slices,
            entry_size: 0,
            allocation: None,
        }
    }

    /// Allocates `entry_size` bytes per slice, unless the buffer already has
    /// exactly this entry size.
    ///
    /// The new memory is zeroed. Returns false if the allocation failed, in
    /// which case the buffer is left unallocated. Allocating an entry size of
    /// zero releases the buffer.
    pub fn allocate(&mut self, entry_size: usize) -> bool {
        if entry_size == self.entry_size {
            return true;
        }
        debug_assert!(
            entry_size % self.alignment == 0,
            "entry size {entry_size} isn't a multiple of the alignment {}",
            self.alignment
        );

        self.release();
        if entry_size == 0 {
            return true;
        }

        let Some(layout) = entry_size
            .checked_mul(self.num_slices)
            .and_then(round_up_to_cache_line)
            .and_then(|size| Layout::from_size_align(size, self.alignment).ok())
        else {
            log_error!(
                "Buffer of {} slices of {entry_size} bytes is too large",
                self.num_slices
            );
            return false;
        };

        // SAFETY: The layout has a non-zero size, as `entry_size` and `num_slices` are
        // both non-zero.
        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => {
                log_debug!(
                    "Allocated {} bytes aligned to {} for {} slices",
                    layout.size(),
                    layout.align(),
                    self.num_slices
                );
                self.allocation = Some(Allocation { ptr, layout });
                self.entry_size = entry_size;
                true
            }
            None => {
                log_error!("Failed to allocate {} bytes", layout.size());
                false
            }
        }
    }

    /// Frees the allocation, if any.
    fn release(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            // SAFETY: The pointer was returned by `alloc_zeroed()` with this same layout,
            // and `take()` makes sure it's freed only once.
            unsafe { dealloc(allocation.ptr.as_ptr(), allocation.layout) };
        }
        self.entry_size = 0;
    }

    /// Fills the whole buffer with zeros.
    pub fn zero(&mut self) {
        self.as_bytes_mut().fill(0);
    }

    /// Alignment of the buffer start.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Number of per-thread slices.
    pub fn num_slices(&self) -> usize {
        self.num_slices
    }

    /// Size of each per-thread slice in bytes.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Whether memory is currently allocated.
    pub fn is_allocated(&self) -> bool {
        self.allocation.is_some()
    }

    /// Total allocated size in bytes, padding included.
    pub fn len(&self) -> usize {
        self.allocation.as_ref().map_or(0, |a| a.layout.size())
    }

    /// Whether the buffer has zero bytes, i.e. isn't allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pointer to the start of the buffer, dangling when nothing is allocated.
    pub fn as_ptr(&self) -> *const u8 {
        self.base().as_ptr()
    }

    fn base(&self) -> NonNull<u8> {
        match &self.allocation {
            Some(allocation) => allocation.ptr,
            None => NonNull::dangling(),
        }
    }

    /// The whole buffer, padding included.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: The allocation is `len()` bytes long and was zero-initialized; the
        // dangling pointer is only used with a zero length.
        unsafe { std::slice::from_raw_parts(self.base().as_ptr(), self.len()) }
    }

    /// The whole buffer, padding included.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: Same as `as_bytes()`, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.base().as_ptr(), self.len()) }
    }

    /// The slice of the given thread slot.
    ///
    /// # Panics
    ///
    /// Panics if `slot` isn't smaller than the number of slices.
    pub fn slice(&self, slot: usize) -> &[u8] {
        assert!(slot < self.num_slices, "thread slot {slot} out of range");
        let start = slot * self.entry_size;
        &self.as_bytes()[start..start + self.entry_size]
    }

    /// The slice of the given thread slot.
    ///
    /// # Panics
    ///
    /// Panics if `slot` isn't smaller than the number of slices.
    pub fn slice_mut(&mut self, slot: usize) -> &mut [u8] {
        assert!(slot < self.num_slices, "thread slot {slot} out of range");
        let start = slot * self.entry_size;
        let entry_size = self.entry_size;
        &mut self.as_bytes_mut()[start..start + entry_size]
    }

    /// Splits the buffer into slices that threads can claim concurrently.
    pub(crate) fn partition(&mut self) -> Partition<'_> {
        Partition {
            base: self.base(),
            entry_size: self.entry_size,
            num_slices: self.num_slices,
            _buffer: PhantomData,
        }
    }
}

impl Drop for ReductionBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive access to a [`ReductionBuffer`], handed out one slice at a time
/// to concurrent threads.
pub(crate) struct Partition<'a> {
    base: NonNull<u8>,
    entry_size: usize,
    num_slices: usize,
    _buffer: PhantomData<&'a mut [u8]>,
}

// SAFETY: A `Partition` acts as a `&mut [u8]`, whose slices are only given out
// through the `unsafe` function `claim()`, which requires disjoint claims.
unsafe impl Send for Partition<'_> {}
// SAFETY: See above.
unsafe impl Sync for Partition<'_> {}

impl<'a> Partition<'a> {
    /// Returns the slice of the given thread slot.
    ///
    /// # Panics
    ///
    /// Panics if `slot` isn't smaller than the number of slices.
    ///
    /// # Safety
    ///
    /// Each slot must be claimed at most once for the lifetime of this
    /// partition.
    pub(crate) unsafe fn claim(&self, slot: usize) -> &'a mut [u8] {
        assert!(slot < self.num_slices, "thread slot {slot} out of range");
        // SAFETY:
        // - `slot < num_slices`, so the slice lies within the allocation (or is empty
        //   when nothing is allocated).
        // - The caller guarantees that no other reference to this slice exists.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base.as_ptr().add(slot * self.entry_size),
                self.entry_size,
            )
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_up_to_cache_line() {
        assert_eq!(round_up_to_cache_line(0), Some(0));
        assert_eq!(round_up_to_cache_line(1), Some(64));
        assert_eq!(round_up_to_cache_line(32), Some(64));
        assert_eq!(round_up_to_cache_line(64), Some(64));
        assert_eq!(round_up_to_cache_line(65), Some(128));
        assert_eq!(round_up_to_cache_line(usize::MAX), None);
    }

    #[test]
    fn test_unallocated() {
        let buffer = ReductionBuffer::new(64, 4);
        assert!(!buffer.is_allocated());
        assert_eq!(buffer.entry_size(), 0);
        assert_eq!(buffer.len(), 0);
        assert!(buffer.as_bytes().is_empty());
        assert!(buffer.slice(3).is_empty());
    }

    #[test]
    fn test_allocate_rounds_up() {
        // Raw requirement of 8 * 4 = 32 bytes, rounded up to a cache line.
        let mut buffer = ReductionBuffer::new(8, 4);
        assert!(buffer.allocate(8));
        assert_eq!(buffer.entry_size(), 8);
        assert_eq!(buffer.len(), 64);
        assert_eq!(buffer.as_ptr() as usize % 8, 0);
    }

    #[test]
    fn test_allocate_is_aligned() {
        for alignment in [64, 128, 256, 4096] {
            let mut buffer = ReductionBuffer::new(alignment, 3);
            assert!(buffer.allocate(alignment * 2));
            assert_eq!(buffer.as_ptr() as usize % alignment, 0);
            assert_eq!(buffer.len(), alignment * 6);
            for slot in 0..3 {
                assert_eq!(buffer.slice(slot).as_ptr() as usize % alignment, 0);
            }
        }
    }

    #[test]
    fn test_allocate_same_size_is_idempotent() {
        let mut buffer = ReductionBuffer::new(64, 4);
        assert!(buffer.allocate(128));
        let ptr = buffer.as_ptr();
        buffer.slice_mut(1)[0] = 42;

        assert!(buffer.allocate(128));
        assert_eq!(buffer.as_ptr(), ptr);
        assert_eq!(buffer.slice(1)[0], 42);
    }

    #[test]
    fn test_allocate_other_size() {
        let mut buffer = ReductionBuffer::new(64, 4);
        assert!(buffer.allocate(128));
        buffer.as_bytes_mut().fill(0xFF);

        assert!(buffer.allocate(192));
        assert_eq!(buffer.entry_size(), 192);
        assert_eq!(buffer.len(), 192 * 4);
        assert!(buffer.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocate_zero_releases() {
        let mut buffer = ReductionBuffer::new(64, 2);
        assert!(buffer.allocate(64));
        assert!(buffer.is_allocated());
        assert!(buffer.allocate(0));
        assert!(!buffer.is_allocated());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_allocate_failure_leaves_unallocated() {
        let mut buffer = ReductionBuffer::new(64, 4);
        assert!(buffer.allocate(64));
        assert!(!buffer.allocate(usize::MAX & !63));
        assert!(!buffer.is_allocated());
        assert_eq!(buffer.entry_size(), 0);
        assert_eq!(buffer.len(), 0);

        // Still usable afterwards.
        assert!(buffer.allocate(64));
        assert_eq!(buffer.len(), 256);
    }

    #[test]
    fn test_zero() {
        let mut buffer = ReductionBuffer::new(64, 5);
        assert!(buffer.allocate(64));
        for (i, b) in buffer.as_bytes_mut().iter_mut().enumerate() {
            *b = i as u8 | 1;
        }
        buffer.zero();
        assert_eq!(buffer.as_bytes().len(), 320);
        assert!(buffer.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_unallocated() {
        let mut buffer = ReductionBuffer::new(64, 5);
        buffer.zero();
        assert!(!buffer.is_allocated());
    }

    #[test]
    fn test_slices_are_disjoint() {
        let mut buffer = ReductionBuffer::new(64, 4);
        assert!(buffer.allocate(64));
        for slot in 0..4 {
            buffer.slice_mut(slot).fill(slot as u8 + 1);
        }
        for slot in 0..4 {
            assert!(buffer.slice(slot).iter().all(|&b| b == slot as u8 + 1));
        }
    }

    #[test]
    fn test_partition_claims() {
        let mut buffer = ReductionBuffer::new(64, 3);
        assert!(buffer.allocate(64));
        {
            let partition = buffer.partition();
            std::thread::scope(|scope| {
                for slot in 0..3 {
                    let partition = &partition;
                    scope.spawn(move || {
                        // SAFETY: Each slot is claimed by exactly one thread.
                        let slice = unsafe { partition.claim(slot) };
                        assert_eq!(slice.len(), 64);
                        slice.fill(slot as u8 + 10);
                    });
                }
            });
        }
        for slot in 0..3 {
            assert!(buffer.slice(slot).iter().all(|&b| b == slot as u8 + 10));
        }
    }

    #[test]
    #[should_panic(expected = "thread slot 4 out of range")]
    fn test_slice_out_of_range() {
        let mut buffer = ReductionBuffer::new(64, 4);
        assert!(buffer.allocate(64));
        buffer.slice(4);
    }

    #[test]
    #[should_panic(expected = "buffer alignment must be a power of two, got 48")]
    fn test_invalid_alignment() {
        ReductionBuffer::new(48, 4);
    }

    #[test]
    #[should_panic(expected = "a buffer needs at least one slice")]
    fn test_no_slices() {
        ReductionBuffer::new(64, 0);
    }
}
