//! Worker Pipeline Module
//!
//! ```text
//! store ──poll──> EventSource ──> WorkerLoop ──> LifecycleManager ──> store
//!                                     │
//!                                     └──> companion notifications
//! ```

pub mod processing_loop;
pub mod source;

pub use processing_loop::{LoopStats, WorkerLoop};
pub use source::{EventSource, StoreSource};
