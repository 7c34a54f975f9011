//! Distributed lazy graph reduction.
//!
//! A program is a set of supercombinators compiled to stack bytecode. A group
//! of tasks evaluates it together: each task owns a private heap, frames that
//! need a remote value fetch it, idle tasks steal unstarted frames, and a
//! coordinated mark/sweep reclaims addresses no task refers to any more.

pub mod addr;
pub mod config;
pub mod error;
pub mod group;
pub mod heap;
pub mod net;
pub mod program;
pub mod task;
pub mod value;
pub mod wire;

pub use config::RuntimeConfig;
pub use error::TaskError;
pub use group::{GroupOutput, Master, read_hosts, run_local, run_worker};
pub use program::{Program, ProgramBuilder};
pub use value::Value;
