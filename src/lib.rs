//! Client-side driver for droid coding-agent daemons.
//!
//! Each daemon speaks newline-delimited JSON-RPC over a pair of named pipes.
//! [`Session`] drives one daemon; [`Swarm`] runs many of them side by side
//! and routes messages between them.

#![forbid(unsafe_code)]

#[cfg(not(unix))]
compile_error!("droid-swarm talks to daemons over named pipes and requires a unix platform");

pub mod config;
pub mod daemon;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod swarm;
pub mod transport;

pub use config::SwarmConfig;
pub use errors::{AppError, Result};
pub use session::{Session, SessionOptions};
pub use swarm::message::AgentMessage;
pub use swarm::{Swarm, SwarmContext};
