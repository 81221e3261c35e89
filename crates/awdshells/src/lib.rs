//! # awdshells
//!
//! A multi-session reverse shell aggregator. The server listens on a TCP
//! port, accepts inbound connections from remote shells, and lets a local
//! operator enumerate, interact with, and drive commands across many shells
//! concurrently.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        CLI driver                        │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────┐   │
//! │  │   Server    │   │    Batch     │   │    Logger    │   │
//! │  │  (registry, │   │  (fan-out    │   │ (stderr +    │   │
//! │  │   sweeper)  │   │   + upload)  │   │  log file)   │   │
//! │  └──────┬──────┘   └──────┬───────┘   └──────────────┘   │
//! │         │                 │                              │
//! │  ┌──────┴─────────────────┴───────┐                      │
//! │  │      Session (per shell)       │                      │
//! │  │  echo-sentinel framed I/O      │                      │
//! │  └────────────────────────────────┘                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: startup parameters with validation and env overrides
//! - [`logger`]: operator-facing severity-gated log sink
//! - [`session`]: one accepted TCP connection plus its protocol state
//! - [`server`]: acceptor, session registry, liveness sweeper, fan-out
//! - [`batch`]: operator-defined session subsets driven as a unit
//! - [`cli`]: the interactive command driver

pub mod batch;
pub mod cli;
pub mod config;
pub mod logger;
pub mod server;
pub mod session;

pub use batch::{Batch, BatchId};
pub use config::{Config, ConfigError};
pub use logger::{Level, Logger};
pub use server::Server;
pub use session::{Lease, Session, SessionId};
