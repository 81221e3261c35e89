//! `\xHH` escape encoding for file uploads.
//!
//! Uploaded file content travels inside `echo -ne "..."` command lines, so
//! every byte is rendered as a four-character lowercase hex escape. The
//! encoded stream is sliced into fixed-size blocks, one `echo -ne ... >>`
//! append per block.

use std::fmt::Write as _;

/// Block size, in encoded characters, for a single append command.
///
/// Must stay a multiple of 4 so a block boundary never splits a `\xHH`
/// escape.
pub const ECHO_BLOCK_SIZE: usize = 512;

/// Encodes bytes as a `\xHH` escape stream, two lowercase hex digits per
/// byte.
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4);
    for byte in data {
        // infallible: writing to a String cannot fail
        let _ = write!(out, "\\x{byte:02x}");
    }
    out
}

/// Slices an encoded escape stream into [`ECHO_BLOCK_SIZE`]-character
/// blocks. The final block may be shorter. The input must be the pure-ASCII
/// output of [`encode`].
pub fn blocks(encoded: &str) -> impl Iterator<Item = &str> {
    (0..encoded.len())
        .step_by(ECHO_BLOCK_SIZE)
        .map(move |start| &encoded[start..encoded.len().min(start + ECHO_BLOCK_SIZE)])
}
