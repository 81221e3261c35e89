//! Operator-defined session subsets driven as a unit.
//!
//! A batch owns session *ids*, never sessions. Every operation resolves the
//! ids against the server at use time and silently skips the ones that no
//! longer exist, so the sweeper can evict without notifying batches.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use protocol::{command, escape};

use crate::logger::Logger;
use crate::server::Server;
use crate::session::{Session, SessionId};

/// Unique batch identifier. Same shape as a session id, disjoint
/// namespace.
pub type BatchId = u64;

/// A named subset of session ids.
pub struct Batch {
    id: BatchId,
    members: Mutex<BTreeSet<SessionId>>,
    log: Arc<Logger>,
}

impl Batch {
    pub fn new(id: BatchId, log: Arc<Logger>) -> Self {
        Self {
            id,
            members: Mutex::new(BTreeSet::new()),
            log,
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Pure set insertion; no validation against the server.
    pub fn add(&self, id: SessionId) {
        if let Ok(mut members) = self.members.lock() {
            members.insert(id);
        }
    }

    /// Pure set removal.
    pub fn remove(&self, id: SessionId) {
        if let Ok(mut members) = self.members.lock() {
            members.remove(&id);
        }
    }

    pub fn members(&self) -> Vec<SessionId> {
        self.members
            .lock()
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Resolves the member ids against the server, dropping misses, dead
    /// sessions, and sessions under an interactive lease.
    fn resolve(&self, server: &Server) -> Vec<Arc<Session>> {
        self.members()
            .into_iter()
            .filter_map(|id| server.get(id))
            .filter(|session| session.is_alive() && !session.is_leased())
            .collect()
    }

    /// Summaries of every member that still resolves to a live session.
    pub fn list(&self, server: &Server) -> Vec<String> {
        self.resolve(server)
            .iter()
            .map(|session| session.to_string())
            .collect()
    }

    /// Runs `command` on every resolvable member and collects the outputs.
    /// Completion of every scheduled task is joined before returning;
    /// ordering across sessions is not.
    pub async fn execute(&self, server: &Server, command_line: &str) -> Vec<(SessionId, String)> {
        let sessions = self.resolve(server);

        let mut handles = Vec::with_capacity(sessions.len());
        for session in sessions {
            let command_line = command_line.to_string();
            handles.push(tokio::spawn(async move {
                let output = session.execute(&command_line).await;
                (session.id(), output)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(err) => tracing::error!(error = %err, "batch task failed"),
            }
        }
        results
    }

    /// Uploads a local file to `target` on every resolvable member.
    ///
    /// Best-effort: the file is hex-escaped and replayed through
    /// `echo -ne` appends, one block per command; nothing is verified on
    /// the far side.
    pub async fn upload(&self, server: &Server, local: &Path, target: &str) {
        let data = match tokio::fs::read(local).await {
            Ok(data) => data,
            Err(err) => {
                self.log
                    .error(format!("Failed to open file {}: {err}", local.display()));
                return;
            }
        };
        self.upload_bytes(server, &data, target).await;
    }

    /// Fans the already-read file content out to every resolvable member.
    pub async fn upload_bytes(&self, server: &Server, data: &[u8], target: &str) {
        let encoded = Arc::new(escape::encode(data));
        let sessions = self.resolve(server);

        let mut handles = Vec::with_capacity(sessions.len());
        for session in sessions {
            let encoded = Arc::clone(&encoded);
            let target = target.to_string();
            handles.push(tokio::spawn(async move {
                session.execute(&command::upload_truncate(&target)).await;
                if !session.is_alive() {
                    return;
                }
                // sequential appends: ordering within a session matters,
                // across sessions it does not
                for block in escape::blocks(&encoded) {
                    session.execute(&command::upload_append(block, &target)).await;
                    if !session.is_alive() {
                        return;
                    }
                }
            }));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "upload task failed");
            }
        }
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch: id={}\tsession = ", self.id)?;
        let members = self.members();
        if members.is_empty() {
            return write!(f, "[EMPTY]");
        }
        let rendered: Vec<String> = members.iter().map(|id| id.to_string()).collect();
        write!(f, "{}", rendered.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::logger::Level;
    use std::time::Duration;

    fn test_log() -> Arc<Logger> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(Logger::new(dir.path().join("test.log"), Level::None))
    }

    fn empty_server() -> Arc<Server> {
        let config = Config {
            port: 0,
            ..Config::default()
        };
        Arc::new(Server::new(&config, test_log()))
    }

    #[test]
    fn test_add_deduplicates() {
        let batch = Batch::new(0, test_log());
        batch.add(7);
        batch.add(7);
        batch.add(7);
        assert_eq!(batch.members(), vec![7]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let batch = Batch::new(0, test_log());
        batch.add(1);
        batch.remove(2);
        assert_eq!(batch.members(), vec![1]);
    }

    #[test]
    fn test_members_sorted() {
        let batch = Batch::new(0, test_log());
        batch.add(5);
        batch.add(1);
        batch.add(3);
        assert_eq!(batch.members(), vec![1, 3, 5]);
    }

    #[test]
    fn test_display_empty() {
        let batch = Batch::new(3, test_log());
        assert_eq!(batch.to_string(), "batch: id=3\tsession = [EMPTY]");
    }

    #[test]
    fn test_display_members() {
        let batch = Batch::new(1, test_log());
        batch.add(2);
        batch.add(0);
        assert_eq!(batch.to_string(), "batch: id=1\tsession = 0 2");
    }

    #[tokio::test]
    async fn test_unresolvable_members_are_skipped() {
        let server = empty_server();
        let batch = Batch::new(0, test_log());
        batch.add(0);
        batch.add(42);

        // no sessions exist: listing is empty and execute does nothing,
        // but the membership itself is untouched
        assert!(batch.list(&server).is_empty());
        let results = batch.execute(&server, "uname").await;
        assert!(results.is_empty());
        assert_eq!(batch.members(), vec![0, 42]);
    }

    #[tokio::test]
    async fn test_upload_missing_file_is_logged_not_fatal() {
        let server = empty_server();
        let batch = Batch::new(0, test_log());
        batch
            .upload(&server, Path::new("/definitely/not/here"), "/tmp/out")
            .await;
        // nothing to assert beyond "did not panic": no sessions, no file
    }

    #[tokio::test]
    async fn test_execute_collects_one_result_per_live_member() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpStream;

        let config = Config {
            port: 0,
            sweep_interval: Duration::from_secs(3600),
            ..Config::default()
        };
        let server = Arc::new(Server::new(&config, test_log()));
        let port = server.start().await.unwrap();

        // scripted shell: handshake once, then answer every framed command
        // with a fixed output
        let shell = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let (read_half, mut write_half) = stream.split();
            let mut reader = BufReader::new(read_half);

            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let token = line.strip_prefix("echo ").unwrap().trim_end().to_string();
            write_half
                .write_all(format!("{token}\n").as_bytes())
                .await
                .unwrap();

            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let prefix = line
                .strip_prefix("echo ")
                .and_then(|rest| rest.split(" && ").next())
                .unwrap()
                .to_string();
            let suffix = line.rsplit("; echo ").next().unwrap().trim_end().to_string();
            write_half
                .write_all(format!("{prefix}\nLinux\n{suffix}\n").as_bytes())
                .await
                .unwrap();
        });

        for _ in 0..100 {
            if server.count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.count(), 1);

        let batch = Batch::new(0, test_log());
        batch.add(0);
        batch.add(99); // never resolves

        let results = batch.execute(&server, "uname").await;
        assert_eq!(results, vec![(0, "Linux\n".to_string())]);

        shell.await.unwrap();
        server.stop();
    }
}
