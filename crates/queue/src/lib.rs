// SPDX-License-Identifier: Apache-2.0

//! Queue implementations for the taskmill scheduling engine.
//!
//! Both flavors are tailored to the engine's ownership model: queues are
//! consumed by exactly one worker, while producers may be any thread.
//! Elements are intrusive — the link lives inside the queued object — so a
//! cross-worker free or spawn never allocates.

pub mod error;
pub mod mpsc;
pub mod ring;

pub use error::RingError;
pub use mpsc::{Link, MpscQueue};
pub use ring::Ring;
