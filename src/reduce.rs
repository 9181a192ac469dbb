// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Typed view of a [`Dispatcher`], with per-thread buffers of floating-point
//! elements.

use crate::buffer::CACHE_LINE;
use crate::dispatcher::{Dispatcher, DispatcherBuilder};
use crate::error::Error;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::num::NonZeroUsize;

mod private {
    pub trait Sealed {}

    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Element type of the per-thread buffers of a [`ParallelReduce`].
///
/// This trait is sealed: it's only implemented for [`f32`] and [`f64`], for
/// which any bit pattern (in particular all zeros) is a valid value.
pub trait Element: private::Sealed + Copy + Send + Sync + 'static {
    /// Number of elements in a cache line.
    const PER_CACHE_LINE: usize = CACHE_LINE / size_of::<Self>();
}

impl Element for f32 {}
impl Element for f64 {}

/// Reinterprets a per-thread slice of bytes as elements.
fn cast_slice<T: Element>(bytes: &[u8]) -> &[T] {
    if bytes.is_empty() {
        return &[];
    }
    assert_eq!(bytes.as_ptr() as usize % align_of::<T>(), 0);
    // SAFETY:
    // - The pointer is non-null and aligned for `T` (checked above).
    // - `len / size_of::<T>()` elements fit in `bytes`.
    // - Any bit pattern is a valid `T`, as guaranteed by the sealed `Element` trait.
    unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<T>(), bytes.len() / size_of::<T>()) }
}

/// Reinterprets a per-thread slice of bytes as elements.
fn cast_slice_mut<T: Element>(bytes: &mut [u8]) -> &mut [T] {
    if bytes.is_empty() {
        return &mut [];
    }
    assert_eq!(bytes.as_ptr() as usize % align_of::<T>(), 0);
    // SAFETY: Same as in `cast_slice()`, and `bytes` is borrowed exclusively.
    unsafe {
        std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<T>(), bytes.len() / size_of::<T>())
    }
}

/// A parallel reduction over per-thread buffers of `T` elements, each aligned
/// to a cache line.
///
/// The merge of the per-thread buffers is left to the caller, once
/// [`dispatch()`](Self::dispatch) returns.
///
/// ```
/// # use parareduce::{DispatcherBuilder, ParallelReduce, ThreadCount};
/// let mut reduce = ParallelReduce::<f64>::with_builder(DispatcherBuilder {
///     num_threads: ThreadCount::try_from(4).unwrap(),
///     ..Default::default()
/// })
/// .unwrap();
///
/// let left = (0..1000).map(|i| i as f64).collect::<Vec<_>>();
/// let right = vec![2.0; 1000];
///
/// // One partial dot product per thread.
/// assert!(reduce.allocate_buffer(1));
/// assert_eq!(reduce.thread_buffer_len(), 8);
/// reduce.zero_buffer();
/// reduce.dispatch(10, |job, _slot, partial| {
///     let range = job * 100..(job + 1) * 100;
///     partial[0] += left[range.clone()]
///         .iter()
///         .zip(&right[range])
///         .map(|(a, b)| a * b)
///         .sum::<f64>();
/// });
///
/// let dot: f64 = reduce.thread_buffers().map(|partial| partial[0]).sum();
/// assert_eq!(dot, 999_000.0);
/// ```
pub struct ParallelReduce<T: Element = f64> {
    dispatcher: Dispatcher,
    _element: PhantomData<fn() -> T>,
}

impl<T: Element> ParallelReduce<T> {
    /// Creates a reduction over the default number of threads (one per
    /// physical core).
    pub fn new() -> Result<Self, Error> {
        Self::with_builder(DispatcherBuilder::default())
    }

    /// Creates a reduction with the given dispatcher parameters. The buffer
    /// alignment is always a cache line, whatever `builder.alignment` says.
    pub fn with_builder(builder: DispatcherBuilder) -> Result<Self, Error> {
        let dispatcher = DispatcherBuilder {
            alignment: CACHE_LINE,
            ..builder
        }
        .build()?;
        Ok(Self {
            dispatcher,
            _element: PhantomData,
        })
    }

    /// Returns the number of threads taking part in a dispatch, the calling
    /// thread included.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.dispatcher.num_threads()
    }

    /// Allocates at least `len` elements per thread, rounded up to a whole
    /// number of cache lines. Does nothing if the rounded size is already
    /// allocated.
    ///
    /// Returns false if the allocation failed, in which case no buffer is
    /// allocated anymore.
    pub fn allocate_buffer(&mut self, len: usize) -> bool {
        let entry_size = len
            .checked_add(T::PER_CACHE_LINE - 1)
            .map(|len| len & !(T::PER_CACHE_LINE - 1))
            .and_then(|len| len.checked_mul(size_of::<T>()));
        match entry_size {
            Some(entry_size) => self.dispatcher.allocate_buffer(entry_size),
            None => {
                self.dispatcher.allocate_buffer(0);
                false
            }
        }
    }

    /// Fills all the per-thread buffers with zeros.
    pub fn zero_buffer(&mut self) {
        self.dispatcher.zero_buffer();
    }

    /// Number of elements in each per-thread buffer, padding included.
    pub fn thread_buffer_len(&self) -> usize {
        self.dispatcher.entry_size() / size_of::<T>()
    }

    /// All the per-thread buffers, one after the other, followed by padding.
    pub fn buffer(&self) -> &[T] {
        cast_slice(self.dispatcher.buffer())
    }

    /// All the per-thread buffers, one after the other, followed by padding.
    pub fn buffer_mut(&mut self) -> &mut [T] {
        cast_slice_mut(self.dispatcher.buffer_mut())
    }

    /// The buffer of the given thread slot.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= num_threads()`.
    pub fn thread_buffer(&self, slot: usize) -> &[T] {
        cast_slice(self.dispatcher.thread_buffer(slot))
    }

    /// Iterates over the buffers of all the thread slots.
    ///
    /// Slots that didn't take part in the last dispatch keep their previous
    /// content (zeros after [`zero_buffer()`](Self::zero_buffer)).
    pub fn thread_buffers(&self) -> impl ExactSizeIterator<Item = &[T]> + '_ {
        (0..self.num_threads().get()).map(move |slot| self.thread_buffer(slot))
    }

    /// Calls `callback(job, slot, buffer)` exactly once for every `job` in
    /// `0..job_count`, in parallel, where `buffer` is the private buffer of the
    /// calling thread's `slot`. See [`Dispatcher::dispatch()`].
    ///
    /// # Panics
    ///
    /// Panics if `job_count` is zero, or if `callback` panicked on any thread.
    pub fn dispatch<F>(&mut self, job_count: usize, callback: F)
    where
        F: Fn(usize, usize, &mut [T]) + Sync,
    {
        self.dispatcher.dispatch(job_count, |job, slot, bytes| {
            callback(job, slot, cast_slice_mut(bytes))
        });
    }
}
