//! Session management module.
//!
//! A session is one accepted TCP connection plus its protocol state:
//! carry-over read buffer, liveness and echo flags, and the echo-sentinel
//! command framing built on top of the raw byte stream.

pub mod shell;

pub use shell::{Lease, Session, SessionId};
