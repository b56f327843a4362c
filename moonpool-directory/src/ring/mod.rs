//! The directory ring: a circular 32-bit identity space.
//!
//! Grain identities and silo partitions are hashed onto the ring. Each
//! partition owns the half-open interval between its predecessor's point and
//! its own point.

mod collection;
mod range;

pub use collection::RingRangeCollection;
pub use range::{RingRange, RING_SIZE};
