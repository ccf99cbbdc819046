//! Buffer lifecycle: pooled allocation, ring staging and mixing kernels

mod pool;
mod ring;
pub mod mix;

pub use pool::{BufferPool, PoolStats, DEFAULT_BUCKET_CAPACITY};
pub use ring::RingSampleBuffer;
