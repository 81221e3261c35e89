//! # awdshells protocol
//!
//! Pure helpers for the echo-sentinel shell protocol: random sentinel
//! tokens, the framed command lines sent to remote shells, and the `\xHH`
//! escape encoding used for file uploads.
//!
//! The protocol has no wire format of its own. A command is delimited by
//! wrapping it between two `echo` statements with random tokens; the tokens
//! bracket the command's output inside the otherwise unstructured byte
//! stream coming back from the shell. See [`command`] for the exact lines.
//!
//! Everything in this crate is synchronous and side-effect free (apart from
//! the thread RNG); all I/O lives in the `awdshells` crate.

pub mod command;
pub mod escape;
pub mod token;

pub use command::{extract_output, frame, probe, upload_append, upload_truncate};
pub use escape::{blocks, encode, ECHO_BLOCK_SIZE};
pub use token::{generate, PROBE_LEN, SENTINEL_LEN};
