//! Protocol implementations.
//!
//! - `memcached`: memcached-style text protocol with range scans (`rget`)

pub mod memcached;
