//! Random sentinel token generation.
//!
//! Tokens are embedded verbatim inside shell command lines and matched
//! verbatim against shell output, so the alphabet is restricted to ASCII
//! letters: nothing the shell could interpret, nothing that needs quoting.

use rand::Rng;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Length of the sentinels bracketing a single command's output.
pub const SENTINEL_LEN: usize = 8;

/// Length of the tokens used by the handshake and liveness probes.
pub const PROBE_LEN: usize = 16;

/// Generates a random ASCII-letter token of `len` characters.
pub fn generate(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
