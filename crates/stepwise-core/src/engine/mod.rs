//! Execution engine: the scheduler, the machine-task hand-off, handlers, and
//! the worker that runs them.

pub mod dispatcher;
pub mod handler;
pub mod scheduler;
pub mod worker;

pub use dispatcher::{ChannelDispatcher, DispatchError, MachineJob, TaskDispatcher};
pub use handler::{HandlerError, HandlerRegistry, MachineHandler, NextNodes};
pub use scheduler::{MANUAL_OVERRIDE_NODE, Scheduler, SchedulerError};
pub use worker::{JobOutcome, Worker};
