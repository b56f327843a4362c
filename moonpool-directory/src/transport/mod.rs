//! Transports carrying directory RPCs between silos.
//!
//! The directory talks to remote partitions and clients through the
//! [`DirectoryTransport`](crate::DirectoryTransport) trait. This module ships
//! the in-process implementation used when every silo lives in one process.

mod local;

pub use local::LocalTransport;
