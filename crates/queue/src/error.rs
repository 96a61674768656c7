// SPDX-License-Identifier: Apache-2.0

//! Errors for the queues.

/// Errors that can occur when pushing into a bounded ring.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RingError {
    /// The ring is at capacity and the element could not be pushed.
    #[error("Ring is full and the element could not be pushed")]
    Full,
}
