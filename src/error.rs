// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use thiserror::Error;

/// Errors that make building a [`Dispatcher`](crate::Dispatcher) fail.
///
/// A dispatcher that fails to build is never partially usable: any pool
/// thread that was already spawned is joined before the error is returned.
#[derive(Debug, Error)]
pub enum Error {
    /// The number of threads couldn't be determined from the hardware, and no
    /// fallback was configured.
    #[error("cannot determine the number of threads and no fallback was configured")]
    UndeterminedThreadCount,
    /// The buffer alignment isn't a power of two.
    #[error("buffer alignment must be a power of two, got {0}")]
    InvalidAlignment(usize),
    /// Spawning a pool thread failed.
    #[error("failed to spawn pool thread #{id}")]
    SpawnThread {
        /// Index of the pool thread.
        id: usize,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Pinning a pool thread to a CPU failed while
    /// [`CpuPinningPolicy::Always`](crate::CpuPinningPolicy::Always) was
    /// requested.
    #[error("failed to pin pool thread to a CPU: {0}")]
    CpuPinning(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::InvalidAlignment(48).to_string(),
            "buffer alignment must be a power of two, got 48"
        );
        assert_eq!(
            Error::UndeterminedThreadCount.to_string(),
            "cannot determine the number of threads and no fallback was configured"
        );
    }

    #[test]
    fn test_source() {
        use std::error::Error as _;

        let error = Error::SpawnThread {
            id: 2,
            source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, "no memory"),
        };
        assert_eq!(error.to_string(), "failed to spawn pool thread #2");
        assert_eq!(error.source().unwrap().to_string(), "no memory");
    }
}
