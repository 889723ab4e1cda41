//! Process level coordination: the experiment lock and the stop flag set by
//! termination signals.

pub mod locking;
pub mod signals;

pub use locking::{ExperimentLock, LockError};
