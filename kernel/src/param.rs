//! Platform constants.
//!
//! These are the compile-time defaults. Every subsystem also takes a runtime
//! config so that tests can build caches and pools of any shape.

/// Size of one disk block in bytes.
pub const BSIZE: usize = 1024;

/// Size of one physical page in bytes.
pub const PGSIZE: usize = 4096;

/// Number of cached block slots.
pub const NBUF: usize = 30;

/// Number of buffer cache shards. Prime, so that strided block numbers
/// still spread over every shard.
pub const NBUCKETS: usize = 13;

/// Number of cores, and therefore of page pools.
pub const NCPU: usize = 3;
