//! Command lines sent to remote shells.
//!
//! # Framing
//!
//! A command `C` is wrapped between two random sentinel tokens `P` and `S`:
//!
//! ```text
//! echo <P> && <C>; echo <S>\n
//! ```
//!
//! The shell prints `P` before running `C` and `S` after it, whatever `C`
//! itself produces. The prefix anchors the start of the output past any
//! stale bytes already in flight (earlier shell noise, late probe echoes);
//! the suffix marks a known end, so no timing heuristics are needed. A
//! shell that echoes its stdin produces one extra occurrence of `P` (inside
//! the echoed command line itself), which readers must skip.

/// Builds the framed command line for `command` with the given sentinels.
pub fn frame(prefix: &str, command: &str, suffix: &str) -> String {
    format!("echo {prefix} && {command}; echo {suffix}\n")
}

/// Builds the probe line used by the handshake and liveness checks.
pub fn probe(token: &str) -> String {
    format!("echo {token}\n")
}

/// Builds the command that truncates an upload target on the remote side.
pub fn upload_truncate(target: &str) -> String {
    format!("echo -ne \"\" > {target}")
}

/// Builds the command that appends one encoded block to an upload target.
pub fn upload_append(block: &str, target: &str) -> String {
    format!("echo -ne \"{block}\" >> {target}")
}

/// Extracts the command output from the text captured up to and including
/// the suffix sentinel: strips the sentinel, then any leading CR/LF left
/// over from the prefix echo.
pub fn extract_output(captured: &str, suffix: &str) -> String {
    let body = captured.strip_suffix(suffix).unwrap_or(captured);
    body.trim_start_matches(['\r', '\n']).to_string()
}
