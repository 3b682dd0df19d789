//! Worker Configuration Module
//!
//! ## Loading Order
//!
//! 1. `BATCHLINE_CONFIG` environment variable (path to TOML file)
//! 2. `batchline.toml` in the current working directory
//! 3. Built-in defaults
//!
//! `BATCHLINE_BACKEND_URL`, `BATCHLINE_SHARED_SECRET` and
//! `BATCHLINE_DATA_DIR` override the file after loading. The resulting
//! [`WorkerConfig`] is passed explicitly to the components that need it.

pub mod defaults;
mod worker_config;

pub use defaults::MAX_PENDING_WRITES;
pub use worker_config::*;
