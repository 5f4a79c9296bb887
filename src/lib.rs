//! gcra-ratelimit - Distributed GCRA Rate Limiter
//!
//! This crate enforces rate limits on arbitrary string keys using the
//! Generic Cell Rate Algorithm. All state lives in a shared store (Redis in
//! production) and every decision runs as one atomic script there, so any
//! number of processes can enforce the same limits without coordinating
//! with each other.
//!
//! ```no_run
//! use std::sync::Arc;
//! use gcra_ratelimit::{Limit, Limiter, RedisStore};
//!
//! # async fn demo() -> gcra_ratelimit::Result<()> {
//! let store = Arc::new(RedisStore::connect("redis://127.0.0.1/").await?);
//! let limiter = Limiter::new(store);
//!
//! let result = limiter.allow("user:42", Limit::per_second(10, 20)).await?;
//! if !result.is_allowed() {
//!     println!("retry in {:?}", result.retry_after);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use config::{GcraConfig, StoreBackend, StoreConfig};
pub use error::{Error, Result, StoreError};
pub use ratelimit::{Limit, Limiter, RateLimitResult};
pub use store::{MemoryStore, RedisStore, StoreAdapter};
