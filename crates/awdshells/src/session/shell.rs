//! One connected remote shell.
//!
//! The session turns a raw byte-stream shell into a request/response
//! channel. Reads and writes each have their own exclusion domain (one read
//! in flight, one write in flight; a read may overlap a write). Transport
//! errors never escape as `Err`: they flip the `alive` flag and the call
//! returns empty, so callers inspect flags instead of matching errors.

use std::fmt;
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use protocol::{command, token};

use crate::logger::Logger;

/// Unique session identifier. Monotonically increasing, assigned at accept
/// time, never reused within a process lifetime. Zero is valid.
pub type SessionId = u64;

const READ_CHUNK_SIZE: usize = 4096;

/// Read half plus the carry-over bytes read past a delimiter. Both live
/// under one lock: the buffer is only ever touched by whoever holds the
/// read exclusion domain.
struct ReadState {
    half: OwnedReadHalf,
    buffer: Vec<u8>,
}

/// One accepted TCP connection plus its protocol state.
pub struct Session {
    id: SessionId,
    remote: SocketAddr,
    reader: Mutex<ReadState>,
    writer: Mutex<OwnedWriteHalf>,
    alive: AtomicBool,
    echo: AtomicBool,
    timed_out: AtomicBool,
    leased: AtomicBool,
    log: Arc<Logger>,
}

impl Session {
    pub fn new(stream: TcpStream, id: SessionId, remote: SocketAddr, log: Arc<Logger>) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            id,
            remote,
            reader: Mutex::new(ReadState {
                half: read_half,
                buffer: Vec::new(),
            }),
            writer: Mutex::new(write_half),
            alive: AtomicBool::new(true),
            echo: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            leased: AtomicBool::new(false),
            log,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// True after any successful I/O, false after any I/O error. Not
    /// sticky: a later successful write flips it back.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Whether the remote shell echoes its stdin back. Set once by
    /// [`Session::handshake`].
    pub fn is_echo(&self) -> bool {
        self.echo.load(Ordering::Acquire)
    }

    /// Whether the most recent timed read expired.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Whether an operator currently holds the interactive lease.
    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    /// Claims the exclusive interactive lease. Fan-out skips leased
    /// sessions; the sweeper probes them write-only.
    pub fn try_lease(self: &Arc<Self>) -> Option<Lease> {
        self.leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then(|| Lease {
                session: Arc::clone(self),
            })
    }

    /// Writes all bytes. On error the session is marked dead.
    pub async fn write(&self, data: &[u8]) {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => self.alive.store(true, Ordering::Release),
            Err(err) => {
                self.log.error(format!("Error writing data: {err}"));
                self.alive.store(false, Ordering::Release);
            }
        }
    }

    /// Reads whatever arrives until the timer fires.
    ///
    /// Carry-over bytes are drained into the result first. On timer expiry
    /// `timed_out` is set and the collected bytes are returned, `alive`
    /// untouched. On transport error the session is marked dead, the
    /// collected bytes are retained for the next read, and the result is
    /// empty.
    pub async fn read_all(&self, timeout: Duration) -> Vec<u8> {
        self.timed_out.store(false, Ordering::Release);
        let mut state = self.reader.lock().await;
        let mut collected = std::mem::take(&mut state.buffer);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match tokio::time::timeout_at(deadline, state.half.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    self.log.error("Error reading data: connection closed");
                    self.alive.store(false, Ordering::Release);
                    state.buffer = collected;
                    return Vec::new();
                }
                Ok(Ok(n)) => {
                    collected.extend_from_slice(&chunk[..n]);
                    self.alive.store(true, Ordering::Release);
                }
                Ok(Err(err)) => {
                    self.log.error(format!("Error reading data: {err}"));
                    self.alive.store(false, Ordering::Release);
                    state.buffer = collected;
                    return Vec::new();
                }
                Err(_) => {
                    self.timed_out.store(true, Ordering::Release);
                    return collected;
                }
            }
        }
    }

    /// Reads until `delim` appears, returning the prefix including the
    /// delimiter. Bytes read past the delimiter are retained for the next
    /// call; the carry-over buffer is consulted before the socket. On
    /// transport error the session is marked dead and the result is empty
    /// (bytes read so far stay buffered).
    pub async fn read_until(&self, delim: &[u8]) -> Vec<u8> {
        let mut state = self.reader.lock().await;

        if let Some(result) = split_at_delim(&mut state.buffer, delim) {
            return result;
        }

        loop {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match state.half.read(&mut chunk).await {
                Ok(0) => {
                    self.log
                        .error("Error reading until delimiter: connection closed");
                    self.alive.store(false, Ordering::Release);
                    return Vec::new();
                }
                Ok(n) => {
                    state.buffer.extend_from_slice(&chunk[..n]);
                    if let Some(result) = split_at_delim(&mut state.buffer, delim) {
                        self.alive.store(true, Ordering::Release);
                        return result;
                    }
                }
                Err(err) => {
                    self.log
                        .error(format!("Error reading until delimiter: {err}"));
                    self.alive.store(false, Ordering::Release);
                    return Vec::new();
                }
            }
        }
    }

    /// Timed [`Session::read_until`]. On timer expiry `timed_out` is set,
    /// partial reads stay in the carry-over buffer, and the result is
    /// empty.
    pub async fn read_until_timeout(&self, delim: &[u8], timeout: Duration) -> Vec<u8> {
        self.timed_out.store(false, Ordering::Release);
        let mut state = self.reader.lock().await;

        if let Some(result) = split_at_delim(&mut state.buffer, delim) {
            return result;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match tokio::time::timeout_at(deadline, state.half.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    self.log
                        .error("Error reading until delimiter: connection closed");
                    self.alive.store(false, Ordering::Release);
                    return Vec::new();
                }
                Ok(Ok(n)) => {
                    state.buffer.extend_from_slice(&chunk[..n]);
                    if let Some(result) = split_at_delim(&mut state.buffer, delim) {
                        self.alive.store(true, Ordering::Release);
                        return result;
                    }
                }
                Ok(Err(err)) => {
                    self.log
                        .error(format!("Error reading until delimiter: {err}"));
                    self.alive.store(false, Ordering::Release);
                    return Vec::new();
                }
                Err(_) => {
                    self.timed_out.store(true, Ordering::Release);
                    return Vec::new();
                }
            }
        }
    }

    /// Runs one command through the echo-sentinel framing and returns its
    /// output.
    ///
    /// The command is wrapped as `echo <P> && <C>; echo <S>`: the prefix
    /// sentinel anchors the start past any stale bytes in flight, the
    /// suffix marks the end of the output. An echoing shell repeats the
    /// command line itself (which contains `P`), so one extra prefix
    /// occurrence is skipped. Aborts to an empty string as soon as any step
    /// marks the session dead.
    pub async fn execute(&self, command_line: &str) -> String {
        let prefix = token::generate(token::SENTINEL_LEN);
        let suffix = token::generate(token::SENTINEL_LEN);

        tracing::trace!(id = self.id, command = command_line, "executing");

        self.write(command::frame(&prefix, command_line, &suffix).as_bytes())
            .await;
        if !self.is_alive() {
            return String::new();
        }

        self.read_until(prefix.as_bytes()).await;
        if !self.is_alive() {
            return String::new();
        }

        if self.is_echo() {
            self.read_until(prefix.as_bytes()).await;
            if !self.is_alive() {
                return String::new();
            }
        }

        let captured = self.read_until(suffix.as_bytes()).await;
        if !self.is_alive() {
            return String::new();
        }

        command::extract_output(&String::from_utf8_lossy(&captured), &suffix)
    }

    /// Echo probe, run once right after accept.
    ///
    /// Sends `echo <T>` and reads the first occurrence of `T`. If a second
    /// occurrence arrives within `probe_timeout` the shell echoes its
    /// stdin (the first hit was the echoed command line) and `echo` is set.
    pub async fn handshake(&self, probe_timeout: Duration) {
        let probe = token::generate(token::PROBE_LEN);

        self.write(command::probe(&probe).as_bytes()).await;
        if !self.is_alive() {
            return;
        }

        self.read_until(probe.as_bytes()).await;
        if !self.is_alive() {
            return;
        }

        self.read_until_timeout(probe.as_bytes(), probe_timeout)
            .await;
        if self.is_alive() && !self.is_timed_out() {
            self.echo.store(true, Ordering::Release);
            tracing::debug!(id = self.id, "remote shell echoes its input");
        }
    }

    /// Line-oriented REPL against this session.
    ///
    /// Each iteration runs `pwd`, prints it as the prompt, reads one line
    /// of operator input and executes it. Ends on `exit`, operator EOF, or
    /// when the session dies. Blocks the current thread on operator input;
    /// call it from a blocking context.
    pub async fn interact<R, W>(&self, input: &mut R, output: &mut W) -> std::io::Result<()>
    where
        R: BufRead,
        W: Write,
    {
        loop {
            let pwd = self.execute("pwd").await;
            if !self.is_alive() {
                break;
            }

            write!(output, "{}> ", pwd.trim_end_matches(['\r', '\n']))?;
            output.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "exit" {
                break;
            }

            let result = self.execute(line).await;
            if !self.is_alive() {
                break;
            }
            writeln!(output, "{result}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session: id={}\thost: {}:{}\techo: {}",
            self.id,
            self.remote.ip(),
            self.remote.port(),
            self.is_echo()
        )
    }
}

/// Exclusive interactive lease on a session. Released on drop.
pub struct Lease {
    session: Arc<Session>,
}

impl Deref for Lease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.session.leased.store(false, Ordering::Release);
    }
}

/// If `delim` occurs in `buffer`, drains and returns the prefix up to and
/// including it.
fn split_at_delim(buffer: &mut Vec<u8>, delim: &[u8]) -> Option<Vec<u8>> {
    if delim.is_empty() || buffer.len() < delim.len() {
        return None;
    }
    let pos = buffer
        .windows(delim.len())
        .position(|window| window == delim)?;
    let end = pos + delim.len();
    let result = buffer[..end].to_vec();
    buffer.drain(..end);
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{Level, Logger};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (stream, remote) = listener.accept().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Logger::new(dir.path().join("test.log"), Level::None));
        (Session::new(stream, 0, remote, log), peer)
    }

    #[test]
    fn test_split_at_delim_absent() {
        let mut buffer = b"abc".to_vec();
        assert_eq!(split_at_delim(&mut buffer, b"XY"), None);
        assert_eq!(buffer, b"abc");
    }

    #[test]
    fn test_split_at_delim_present() {
        let mut buffer = b"abcXYdef".to_vec();
        assert_eq!(split_at_delim(&mut buffer, b"XY"), Some(b"abcXY".to_vec()));
        assert_eq!(buffer, b"def");
    }

    #[test]
    fn test_split_at_delim_at_end() {
        let mut buffer = b"abcXY".to_vec();
        assert_eq!(split_at_delim(&mut buffer, b"XY"), Some(b"abcXY".to_vec()));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_read_until_includes_delimiter() {
        let (session, mut peer) = connected_pair().await;
        peer.write_all(b"preambleTOKENtail").await.unwrap();

        let result = session.read_until(b"TOKEN").await;
        assert_eq!(result, b"preambleTOKEN");
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_read_until_retains_overrun_for_next_call() {
        let (session, mut peer) = connected_pair().await;
        peer.write_all(b"aTOKbTOK").await.unwrap();

        assert_eq!(session.read_until(b"TOK").await, b"aTOK");
        // second delimiter is already buffered; no socket read needed
        peer.shutdown().await.unwrap();
        assert_eq!(session.read_until(b"TOK").await, b"bTOK");
    }

    #[tokio::test]
    async fn test_read_until_delimiter_split_across_reads() {
        let (session, mut peer) = connected_pair().await;

        let writer = tokio::spawn(async move {
            peer.write_all(b"dataTO").await.unwrap();
            peer.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            peer.write_all(b"KENrest").await.unwrap();
            peer
        });

        let result = session.read_until(b"TOKEN").await;
        assert_eq!(result, b"dataTOKEN");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_until_timeout_preserves_partial() {
        let (session, mut peer) = connected_pair().await;
        peer.write_all(b"partial").await.unwrap();

        let result = session
            .read_until_timeout(b"TOKEN", Duration::from_millis(100))
            .await;
        assert!(result.is_empty());
        assert!(session.is_timed_out());
        assert!(session.is_alive());

        // the partial bytes must still be there once the delimiter lands
        peer.write_all(b"TOKEN").await.unwrap();
        let result = session.read_until(b"TOKEN").await;
        assert_eq!(result, b"partialTOKEN");
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_read_until_timeout_satisfied_from_buffer() {
        let (session, mut peer) = connected_pair().await;
        peer.write_all(b"oneTWOthreeTWO").await.unwrap();

        assert_eq!(session.read_until(b"TWO").await, b"oneTWO");
        // buffered hit returns immediately, well inside the timeout
        let result = session
            .read_until_timeout(b"TWO", Duration::from_millis(10))
            .await;
        assert_eq!(result, b"threeTWO");
        assert!(!session.is_timed_out());
    }

    #[tokio::test]
    async fn test_read_until_peer_close_marks_dead() {
        let (session, peer) = connected_pair().await;
        drop(peer);

        let result = session.read_until(b"TOKEN").await;
        assert!(result.is_empty());
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_read_all_returns_buffered_on_timeout() {
        let (session, mut peer) = connected_pair().await;
        peer.write_all(b"hello").await.unwrap();

        let result = session.read_all(Duration::from_millis(100)).await;
        assert_eq!(result, b"hello");
        assert!(session.is_timed_out());
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_read_all_honors_caller_timeout() {
        let (session, _peer) = connected_pair().await;

        let start = tokio::time::Instant::now();
        let result = session.read_all(Duration::from_millis(150)).await;
        let elapsed = start.elapsed();

        assert!(result.is_empty());
        assert!(session.is_timed_out());
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_read_all_drains_carryover_first() {
        let (session, mut peer) = connected_pair().await;
        peer.write_all(b"xDELIMleftover").await.unwrap();

        assert_eq!(session.read_until(b"DELIM").await, b"xDELIM");
        let result = session.read_all(Duration::from_millis(50)).await;
        assert_eq!(result, b"leftover");
    }

    #[tokio::test]
    async fn test_write_to_closed_peer_eventually_marks_dead() {
        let (session, peer) = connected_pair().await;
        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the first write may land in the kernel buffer before the RST is
        // observed; retry until the error surfaces
        for _ in 0..50 {
            session.write(b"echo probe\n").await;
            if !session.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_alive_recovers_after_successful_write() {
        let (session, mut peer) = connected_pair().await;

        // half-close the peer's write direction: the next read sees EOF
        // and flags the session dead, but writes still have a live path
        peer.shutdown().await.unwrap();
        session.read_until(b"NOPE").await;
        assert!(!session.is_alive());

        // peer->session direction is closed but session->peer still works
        session.write(b"ping\n").await;
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_execute_non_echo_shell() {
        let (session, peer) = connected_pair().await;

        let shell = tokio::spawn(fake_execute_responder(peer, false, "hello\n"));
        let output = session.execute("echo hello").await;
        assert_eq!(output, "hello\n");
        shell.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_echo_shell_skips_echoed_line() {
        let (session, peer) = connected_pair().await;
        session.echo.store(true, Ordering::Release);

        let shell = tokio::spawn(fake_execute_responder(peer, true, "hello\n"));
        let output = session.execute("echo hello").await;
        assert_eq!(output, "hello\n");
        shell.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_output_never_contains_sentinels() {
        let (session, peer) = connected_pair().await;

        let shell = tokio::spawn(fake_execute_responder(peer, false, "line1\nline2\n"));
        let output = session.execute("cat notes").await;
        // exact match: neither sentinel, nor the frame line, leaked through
        assert_eq!(output, "line1\nline2\n");
        shell.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_empty_output_stays_alive() {
        let (session, peer) = connected_pair().await;

        let shell = tokio::spawn(fake_execute_responder(peer, false, ""));
        let output = session.execute("true").await;
        assert_eq!(output, "");
        assert!(session.is_alive());
        shell.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_on_dead_session_returns_empty() {
        let (session, peer) = connected_pair().await;
        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let output = session.execute("uname").await;
        assert_eq!(output, "");
    }

    #[tokio::test]
    async fn test_handshake_detects_non_echo_shell() {
        let (session, peer) = connected_pair().await;

        let shell = tokio::spawn(fake_probe_responder(peer, false));
        session.handshake(Duration::from_millis(200)).await;
        assert!(session.is_alive());
        assert!(!session.is_echo());
        shell.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_detects_echo_shell() {
        let (session, peer) = connected_pair().await;

        let shell = tokio::spawn(fake_probe_responder(peer, true));
        session.handshake(Duration::from_millis(500)).await;
        assert!(session.is_alive());
        assert!(session.is_echo());
        shell.await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let (session, _peer) = connected_pair().await;
        let session = Arc::new(session);

        let lease = session.try_lease().expect("first lease");
        assert!(session.is_leased());
        assert!(session.try_lease().is_none());

        drop(lease);
        assert!(!session.is_leased());
        assert!(session.try_lease().is_some());
    }

    #[tokio::test]
    async fn test_interact_runs_commands_until_exit() {
        let (session, peer) = connected_pair().await;

        let shell = tokio::spawn(async move {
            let mut peer = peer;
            // first frame: pwd
            respond_to_frame(&mut peer, false, "/root\n").await;
            // operator command
            respond_to_frame(&mut peer, false, "Linux\n").await;
            // prompt refresh before exit
            respond_to_frame(&mut peer, false, "/root\n").await;
            peer
        });

        let mut input = std::io::Cursor::new(b"uname\nexit\n".to_vec());
        let mut output = Vec::new();
        session.interact(&mut input, &mut output).await.unwrap();

        let transcript = String::from_utf8(output).unwrap();
        assert!(transcript.contains("/root> "));
        assert!(transcript.contains("Linux\n"));
        drop(shell.await.unwrap());
    }

    #[tokio::test]
    async fn test_display_format() {
        let (session, _peer) = connected_pair().await;
        let rendered = session.to_string();
        assert!(rendered.starts_with("session: id=0\thost: 127.0.0.1:"));
        assert!(rendered.ends_with("\techo: false"));
    }

    /// Reads one framed command line and plays the shell's side: prefix
    /// echo, canned output, suffix echo. `echo` replays the input line
    /// first, like a PTY-backed shell.
    async fn respond_to_frame(peer: &mut TcpStream, echo: bool, output: &str) {
        use tokio::io::AsyncBufReadExt;

        let mut line = Vec::new();
        let (read_half, mut write_half) = peer.split();
        let mut reader = tokio::io::BufReader::new(read_half);
        reader.read_until(b'\n', &mut line).await.unwrap();
        let line = String::from_utf8(line).unwrap();

        // line is `echo <P> && <cmd>; echo <S>\n`
        let prefix = line
            .strip_prefix("echo ")
            .and_then(|rest| rest.split(" && ").next())
            .unwrap()
            .to_string();
        let suffix = line
            .rsplit("; echo ")
            .next()
            .unwrap()
            .trim_end()
            .to_string();

        let mut response = String::new();
        if echo {
            response.push_str(&line);
        }
        response.push_str(&prefix);
        response.push('\n');
        response.push_str(output);
        response.push_str(&suffix);
        response.push('\n');
        write_half.write_all(response.as_bytes()).await.unwrap();
    }

    async fn fake_execute_responder(mut peer: TcpStream, echo: bool, output: &str) {
        respond_to_frame(&mut peer, echo, output).await;
    }

    /// Plays the shell's side of the handshake probe.
    async fn fake_probe_responder(mut peer: TcpStream, echo: bool) {
        use tokio::io::AsyncBufReadExt;

        let mut line = String::new();
        let (read_half, mut write_half) = peer.split();
        let mut reader = tokio::io::BufReader::new(read_half);
        reader.read_line(&mut line).await.unwrap();
        let token = line.strip_prefix("echo ").unwrap().trim_end();

        let mut response = String::new();
        if echo {
            // PTY-style shells replay the whole input line first
            response.push_str(&line);
        }
        response.push_str(token);
        response.push('\n');
        write_half.write_all(response.as_bytes()).await.unwrap();

        // hold the socket open so the probe timeout, not EOF, decides
        tokio::time::sleep(Duration::from_millis(600)).await;
    }
}
