//! Bauleiter - dependency-aware build coordination from the command line
//!
//! Loads a catalog of build configurations, configuration sets and earlier
//! builds into an in-memory datastore, then plans or runs builds through
//! `convenient-coordinator`. With the local engine the builds themselves are
//! simulated in process, so the whole lifecycle (rebuild decisions, graph
//! validation, dependency ordering, failure propagation, batch status) can be
//! followed from a terminal.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod commands;
pub mod error;
pub mod session;

pub use commands::{Cli, Commands};
pub use error::{CommandError, CommandResult};
pub use session::Session;
