//! Vesper Common Types
//!
//! This crate provides the pieces shared by every vesper component:
//!
//! - [`VesperError`]: the error taxonomy used across the runtime, server and CLI
//! - [`BoundedPool`]: a fixed-capacity, lock-free object pool with a factory
//!   for cache misses
//! - [`WaitGroup`]: an async counter that lets a task wait for outstanding
//!   work to drain
//!
//! # Example
//!
//! ```
//! use vesper_common::BoundedPool;
//!
//! let pool = BoundedPool::new(16, || Vec::<u8>::with_capacity(1024));
//! let mut buf = pool.get();
//! buf.extend_from_slice(b"hello");
//! buf.clear();
//! pool.put(buf);
//! ```

pub mod error;
pub mod pool;
pub mod sync;

pub use error::{Result, VesperError};
pub use pool::{BoundedPool, PoolStats, PoolStatsSnapshot, DEFAULT_POOL_CAPACITY};
pub use sync::WaitGroup;
