//! # Dirigent Runtime
//!
//! Background drivers over the core engine:
//! - Runner: the non-reentrant periodic tick that drains queued requests and
//!   converges running ones through adapter polling
//! - CallbackIngester: folds inbound backend callbacks into records
//!
//! Both serialize record writes through the engine's `RecordLocks` table.

pub mod callback;
pub mod runner;

pub use callback::{CallbackError, CallbackIngester, CallbackOutcome};
pub use dirigent_core::locks::RecordLocks;
pub use runner::{Runner, RunnerConfig};

#[cfg(test)]
pub(crate) mod testing;
