//! Activity, task, process, and user lifecycle supervision for a
//! multi-display application runtime.
//!
//! # Overview
//!
//! This crate coordinates the interleaved life cycles of three kinds of
//! entities: *activities* (user-visible screens), *tasks* (ordered stacks of
//! activities), and *processes* (OS processes hosting activity code), across
//! multiple displays and multiple logical users. A small number of displays
//! and a bounded number of processes are multiplexed among an unbounded
//! population of activities while preserving visibility, focus, and
//! resume/pause ordering.
//!
//! # Core Guarantees
//!
//! - **Single resumed activity**: per stack, at most one activity is RESUMED
//!   and at most one is PAUSING, and they are never the same record
//! - **Pause before resume**: a new activity never becomes RESUMED before the
//!   previous one has completed its pause
//! - **Crash containment**: quick-crashing processes are marked bad and their
//!   activities finished; a single launch failure is retried exactly once
//! - **Bounded users**: at most a configured number of users run concurrently;
//!   user shutdown is gated on an ordered two-phase broadcast
//! - **Bounded waits**: every asynchronous wait carries an explicit deadline;
//!   expiry advances the target state, never hangs it
//!
//! # Module Structure
//!
//! - [`types`]: identifiers, logical time, windowing enums, intents
//! - [`record`]: records for activities, tasks, processes, and users
//! - [`stack`]: the per-stack pause/resume choreography
//! - [`display`]: stack placement and windowing-mode policy per display
//! - [`supervisor`]: the multi-display coordinator and public entry points
//! - [`process`]: process table, LRU ordering, and low-memory-killer export
//! - [`apperrors`]: crash accounting and the bad-process policy
//! - [`user`]: user start/stop/switch and the shutdown protocol
//! - [`launch`]: chain-of-responsibility launch parameter computation
//! - [`external`]: traits for the window manager, package resolver, and
//!   other collaborators, plus in-memory doubles for tests
//! - [`util`]: generational arena
//! - [`error`]: error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod apperrors;
pub mod config;
pub mod display;
pub mod error;
pub mod external;
pub mod launch;
pub mod process;
pub mod record;
pub mod stack;
pub mod supervisor;
pub mod test_utils;
pub mod tracing_compat;
pub mod types;
pub mod user;
pub mod util;

pub use config::{ConfigError, DeviceCapabilities, MemoryProfile, SupervisorConfig};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use supervisor::{StartResult, Supervisor, WaitResult};
pub use types::{
    ActivityId, ActivityType, ClockSource, DisplayId, ManualClock, ProcessId, StackId,
    SystemClock, TaskId, Time, UserId, WindowingMode,
};
