//! A cooperative, stateful-task scheduling core.
//!
//! This crate implements the pieces a host application wires together to run
//! many long-lived, cooperatively scheduled tasks on a small number of OS
//! threads:
//!
//! - [`Engine`] is a FIFO queue plus a bounded-time dispatch loop, bound to one
//!   host thread. Call [`Engine::mainloop`] from that thread in a loop.
//! - [`Task`] is a reference-counted control block wrapping a user-supplied
//!   [`Multiplex`] step function. Tasks migrate between engines following the
//!   target/current/default/auxiliary priority chain in [`Task::run`] and
//!   [`Task::yield_to`].
//! - [`TimerQueue`] is the auxiliary, per-interval queue used by timed yields;
//!   it is not wired to a clock on its own, a platform timer thread owns that.
//! - [`aux_engine`] is the process-wide fallback engine used by tasks that
//!   have no target and no default engine.
//!
//! None of the types here preempt user code, steal work across engines, or
//! schedule by priority: a task runs until its [`Multiplex::multiplex`]
//! implementation returns, and engines only ever drain their own queue.
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

mod aux_engine;
mod engine;
mod error;
mod task;
mod timer_queue;

pub use aux_engine::aux_engine;
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, ErrorKind};
pub use task::{Multiplex, RunType, Task, TaskId};
pub use timer_queue::{SequenceId, TaskTimer, Timer, TimerQueue};
