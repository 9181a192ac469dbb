// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::ptr::NonNull;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A [`Mutex`] paired with a [`Condvar`], to publish a value and wake up the
/// threads waiting on it.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status without waiting on the condition variable.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap()
    }

    /// Sets the status to the given value and wakes up one waiting thread.
    ///
    /// Fails if the [`Mutex`] is poisoned.
    pub fn try_notify_one(&self, t: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        *self.mutex.lock()? = t;
        self.condvar.notify_one();
        Ok(())
    }

    /// Modifies the status in place and wakes up all waiting threads.
    pub fn update_all(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.mutex.lock().unwrap());
        self.condvar.notify_all();
    }

    /// Blocks as long as the predicate holds on this status.
    ///
    /// The returned guard keeps the status locked, so that the caller can
    /// inspect or modify it before anyone else does.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

/// Proxy trait for types that have a lifetime parameter.
///
/// Rust doesn't directly support higher-kinded types, so a generic associated
/// type stands in for "`T` for any lifetime".
pub trait LifetimeParameterized {
    type T<'a>: ?Sized;
}

/// A shared reference whose lifetime has been erased, so that it can be handed
/// to `'static` worker threads. It behaves like a [`&'a T<'a>`](reference)
/// whose lifetime is chosen again by the `unsafe` function
/// [`get()`](Self::get).
pub struct ErasedRef<T: LifetimeParameterized> {
    ptr: Option<NonNull<T::T<'static>>>,
}

impl<T: LifetimeParameterized> Clone for ErasedRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: LifetimeParameterized> Copy for ErasedRef<T> {}

impl<T: LifetimeParameterized> ErasedRef<T> {
    /// Creates an empty reference.
    pub fn empty() -> Self {
        Self { ptr: None }
    }

    /// Returns true if no reference is currently stored.
    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    /// Stores the given reference. Callers of [`get()`](Self::get) must make
    /// sure that the obtained reference doesn't outlive the one stored here.
    // The cast is necessary because the lifetime is coerced to 'static.
    #[allow(clippy::unnecessary_cast)]
    pub fn set(&mut self, value: &T::T<'_>) {
        self.ptr = NonNull::new(NonNull::from(value).as_ptr() as *mut T::T<'static>);
    }

    /// Forgets the stored reference.
    pub fn clear(&mut self) {
        self.ptr = None;
    }

    /// Returns the reference previously stored with [`set()`](Self::set), or
    /// [`None`] if nothing was stored since creation or the last
    /// [`clear()`](Self::clear).
    ///
    /// # Safety
    ///
    /// The referenced object must remain valid and must not be mutated for
    /// the whole output lifetime.
    // The cast is necessary because the lifetime is coerced to 'a.
    #[allow(clippy::unnecessary_cast)]
    pub unsafe fn get<'a>(&self) -> Option<&'a T::T<'a>> {
        self.ptr.map(|static_ptr| {
            let ptr = static_ptr.as_ptr() as *mut T::T<'a>;
            // SAFETY:
            // - The pointer was obtained from a valid reference in `set()`.
            // - The caller guarantees that the referenced object outlives 'a and isn't
            //   mutated in the meantime.
            unsafe { &*ptr }
        })
    }
}

/// SAFETY:
///
/// An [`ErasedRef`] acts as a [`&'a T<'a>`](reference), which is [`Send`] if
/// and only if `T<'_>` is [`Sync`].
unsafe impl<T: LifetimeParameterized> Send for ErasedRef<T> where for<'a> T::T<'a>: Sync {}
/// SAFETY:
///
/// An [`ErasedRef`] acts as a [`&'a T<'a>`](reference), which is [`Sync`] if
/// and only if `T<'_>` is [`Sync`].
unsafe impl<T: LifetimeParameterized> Sync for ErasedRef<T> where for<'a> T::T<'a>: Sync {}
