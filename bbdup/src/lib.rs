//! Basic block multiversioning.
//!
//! bbdup turns each block a code-cache runtime builds into several copies ("variants"), each
//! instrumented for a distinct runtime condition ("case"), and threads a dispatcher through them
//! that picks the right variant every time the block executes. Blocks can acquire new cases at
//! runtime: executions that match no case fall back to a default variant and, once an unmatched
//! condition has recurred often enough, the block is rebuilt with a variant for it.
//!
//! The runtime plugs in through [Host]; the tool deciding what the cases are and how to
//! instrument them through [Client].

#![allow(clippy::upper_case_acronyms)]

pub mod client;
mod dispatch;
mod duplicate;
pub mod engine;
pub mod hitcount;
pub mod host;
pub mod ir;
mod log;
pub mod manager;
pub mod promote;
pub mod recover;
mod table;
#[cfg(any(test, feature = "bbdup_testing"))]
pub mod testing;

pub use self::client::{Analysis, BlockSetUp, Client, Encoder, InstrumentCx};
pub use self::engine::{BuildFlags, ConfigError, EncodingSource, Engine, Options, ThreadCtx};
pub use self::host::{Host, MachineContext};
pub use self::log::{stats::StatsSnapshot, LogError};
pub use self::manager::{BlockManager, Case, RegisterError};
pub use self::promote::{Promotion, Redirect};
pub use self::recover::RecoverError;
pub use self::table::ManagerHandle;

/// The name the engine registers its passes under in the host's instrumentation pipeline.
pub const PIPELINE_NAME: &str = "bbdup";
/// The priority of the engine's passes: they must run before any other instrumentation of the
/// same block.
pub const PIPELINE_PRIORITY: i32 = -1500;
