//! Sandboxed execution of graft fragments.
//!
//! A [`Fragment`](graft_fragment::Fragment) is run by pasting its nodes into
//! a sandbox container, feeding its connected inputs from a value source and
//! collecting its connected outputs through a value sink.
//!
//! # Architecture
//!
//! - [`IsolatedExecutor`] runs every fragment in a fresh container. The
//!   container is either a standalone project (detached mode) or a container
//!   node next to the host node (debug and default mode).
//! - [`CombinedExecutor`] keeps pasting fragments into the same container.
//!   Each fragment is collapsed into a unit of its own, and the outputs of
//!   all units so far stay connected to one sink so later fragments can use
//!   them.
//! - A [`Scheduler`] decides where the run-and-wait part happens: on the
//!   caller's task ([`InlineScheduler`]) or on a bounded pool
//!   ([`PooledScheduler`]).
//!
//! Preparation is fail-fast: any error while building the container removes
//! what was created and is returned before anything runs. Node failures are
//! not errors; they show up as an [`ExecutionResult`] without outputs, whose
//! message tree can be turned into a single summary with
//! [`ExecutionResult::into_success`].

mod aggregate;
mod combined;
mod config;
mod error;
mod isolated;
mod result;
mod sandbox;
mod scheduler;

/// Horizontal and vertical distance between nodes laid out in a sandbox.
pub(crate) const LAYOUT_SPACING: i32 = 150;

pub use aggregate::{
  NodeMessage, collect_flow_variables, collect_upstream_flow_variables,
  compile_single_error_message, recursively_extract_messages,
};
pub use combined::CombinedExecutor;
pub use config::{
  DEFAULT_CANCEL_TIMEOUT, DEFAULT_POLL_INTERVAL, ExecutionMode, ExecutionRequest, ExecutorConfig,
  HostNode, WarningConsumer,
};
pub use error::ExecutionError;
pub use isolated::{ExecutorState, IsolatedExecutor};
pub use result::{CombinedResult, ExecutionResult};
pub use scheduler::{
  InlineScheduler, Job, PooledScheduler, RunTarget, Scheduler, cancel_and_wait, run_and_wait,
};
