//! Listener, session registry, and liveness sweeper.
//!
//! The registry map is the sole strong ownership root for sessions;
//! everything else holds `Arc` clones that are re-resolved per operation.
//! The registry mutex is held only across map-structural operations and
//! never across an await: fan-out snapshots the eligible sessions under the
//! lock, releases it, then schedules.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use protocol::{command, token};

use crate::config::{Config, LISTEN_ADDR};
use crate::logger::Logger;
use crate::session::{Session, SessionId};

/// How long the handshake waits for a second echo of the probe token.
const HANDSHAKE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Accepts remote shells and multiplexes their sessions.
pub struct Server {
    sessions: Mutex<BTreeMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    running: AtomicBool,
    port: u16,
    max_sessions: usize,
    sweep_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    log: Arc<Logger>,
}

impl Server {
    pub fn new(config: &Config, log: Arc<Logger>) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            running: AtomicBool::new(false),
            port: config.port,
            max_sessions: config.max_sessions,
            sweep_interval: config.sweep_interval,
            tasks: Mutex::new(Vec::new()),
            log,
        }
    }

    /// Binds the acceptor and schedules the acceptor loop and the liveness
    /// sweeper. Returns the bound port (useful when the configured port is
    /// ephemeral).
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<u16> {
        let listener = TcpListener::bind((LISTEN_ADDR, self.port))
            .await
            .with_context(|| format!("failed to bind {LISTEN_ADDR}:{}", self.port))?;
        let port = listener
            .local_addr()
            .context("failed to read bound address")?
            .port();

        self.running.store(true, Ordering::Release);

        let acceptor = {
            let server = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, remote)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                server.handle_accept(stream, remote).await;
                            });
                        }
                        Err(err) => {
                            server.log.error(format!("Error accepting connection: {err}"));
                            break;
                        }
                    }
                }
            })
        };

        let sweeper = {
            let server = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(server.sweep_interval).await;
                    if !server.running.load(Ordering::Acquire) {
                        break;
                    }
                    server.sweep().await;
                }
            })
        };

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(acceptor);
            tasks.push(sweeper);
        }

        Ok(port)
    }

    /// Stops the acceptor and sweeper, closes every session socket, and
    /// drains the registry.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        for session in sessions.values() {
            self.log.message(format!("Removing {session}"));
        }
        sessions.clear();
    }

    async fn handle_accept(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(stream, id, remote, Arc::clone(&self.log)));

        session.handshake(HANDSHAKE_PROBE_TIMEOUT).await;
        if !session.is_alive() {
            tracing::debug!(id, %remote, "connection died during handshake");
            return;
        }

        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        if sessions.len() < self.max_sessions {
            self.log.success(format!("Adding {session}"));
            sessions.insert(id, session);
        } else {
            self.log
                .warning(format!("Session limit reached, not adding {session}"));
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(&id).cloned())
    }

    /// Closes the socket and drops the registry entry. A missing id logs an
    /// error and no-ops, so eviction stays idempotent against concurrent
    /// operator-driven removal.
    pub fn remove(&self, id: SessionId) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        match sessions.remove(&id) {
            Some(session) => self.log.success(format!("Removing {session}")),
            None => self.log.error(format!("Session {id} not found")),
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Registry snapshot in id (= insertion) order.
    pub fn snapshot(&self, only_alive: bool) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .map(|sessions| {
                sessions
                    .values()
                    .filter(|s| !only_alive || s.is_alive())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Schedules `func` for every matching non-leased session and joins on
    /// every task actually scheduled before returning.
    pub async fn for_each<F, Fut>(&self, func: F, only_alive: bool)
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let targets: Vec<_> = self
            .snapshot(only_alive)
            .into_iter()
            .filter(|s| !s.is_leased())
            .collect();

        let mut handles = Vec::with_capacity(targets.len());
        for session in targets {
            handles.push(tokio::spawn(func(session)));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "fan-out task failed");
            }
        }
    }

    /// Probes every session and evicts the ones that no longer respond.
    ///
    /// Leased (interactive) sessions get a write-only probe so their output
    /// stream is never consumed behind the operator's back; everyone else
    /// gets a full framed probe.
    pub async fn sweep(&self) {
        self.log.message("Liveness sweep running...");

        for session in self.snapshot(true) {
            if session.is_leased() {
                let probe = token::generate(token::PROBE_LEN);
                session.write(command::probe(&probe).as_bytes()).await;
            }
        }

        let dead: Arc<Mutex<Vec<SessionId>>> = Arc::new(Mutex::new(Vec::new()));
        self.for_each(
            {
                let dead = Arc::clone(&dead);
                move |session| {
                    let dead = Arc::clone(&dead);
                    async move {
                        let probe = token::generate(token::PROBE_LEN);
                        session.execute(&format!("echo {probe}")).await;
                        if !session.is_alive() {
                            if let Ok(mut dead) = dead.lock() {
                                dead.push(session.id());
                            }
                        }
                    }
                }
            },
            true,
        )
        .await;

        let dead = dead.lock().map(|d| d.clone()).unwrap_or_default();
        for id in dead {
            self.remove(id);
        }

        self.log.message("Liveness sweep done.");
    }
}
