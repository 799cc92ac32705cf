// src/exec/mod.rs

//! Job execution layer.
//!
//! - [`handler`] defines the `JobHandler` trait, the `HandlerRegistry` keyed
//!   by job type, and the `JobContext` each invocation receives.
//! - [`command`] provides the built-in `command` handler (runs a shell
//!   command, cancellable) and the `noop` handler.
//!
//! The queue workers (see [`crate::queue`]) are what actually invoke
//! handlers; the orchestrator never calls them directly.

pub mod command;
pub mod handler;

pub use command::{CommandHandler, NoopHandler};
pub use handler::{HandlerRegistry, JobContext, JobHandler};
