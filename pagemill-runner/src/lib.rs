//! Bounded execution of shell commands.
//!
//! [`ProcessPool`] keeps at most `max_concurrency` [`ProcessHandle`]s alive,
//! topping up finished slots from an ordered backlog. [`BatchRunner`] drives
//! a parsed Batchfile through one pool, stage by stage.

pub mod batch;
pub mod config;
pub mod cores;
pub mod pool;
pub mod process;

pub use batch::{BatchReport, BatchRunner};
pub use config::{PoolConfig, SpawnFailurePolicy};
pub use cores::{available_concurrency, DEFAULT_CONCURRENCY};
pub use pool::ProcessPool;
pub use process::{ProcessHandle, Shell};
