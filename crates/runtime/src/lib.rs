//! Execution engine: a barriered worker pool drives the ops of each
//! segment, and a pluggable synchronizer fires the segment's sync
//! directives. One executor instance serves one inference session.

pub mod device;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod kernels;

pub use dispatcher::Dispatcher;
pub use error::{Result, RuntimeError};
pub use executor::{Executor, FakeSynchronizer, NetExecution, StepKind};
