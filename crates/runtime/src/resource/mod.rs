// SPDX-License-Identifier: Apache-2.0

//! Resources: tagged pointers, construction annotations, the in-band
//! header, and the builder that schedules and synchronizes them.

pub mod annotation;
pub mod builder;
pub mod header;
pub mod ptr;

pub use annotation::{AccessFrequency, ReadWriteRatio, ResourceAnnotation};
pub use builder::Builder;
pub use header::ResourceHeader;
pub use ptr::ResourcePtr;
