//! Common utilities and shared types for blockfeed.
//!
//! This crate provides foundational components used across all blockfeed crates:
//!
//! - **Configuration**: Layered settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID message ids and UUID lock tokens via [`IdGenerator`]
//! - **Metrics**: Pipeline counters via [`Metrics`]
//!
//! # Example
//!
//! ```no_run
//! use blockfeed_common::{Config, IdGenerator, AppResult};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id_gen = IdGenerator::new();
//!     let id = id_gen.generate();
//!     println!("{} -> {}", config.redis.prefix, id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod metrics;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
pub use metrics::{Metrics, MetricsSnapshot, get_metrics};
