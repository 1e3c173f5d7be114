//! Game server process handle.
//!
//! A [`GameProcess`] owns a spawned server process together with its I/O
//! pumps: stdout/stderr readers feeding a bounded ring buffer (and a
//! broadcast channel for live followers), a stdin writer for console command
//! injection, and a waiter that publishes the exit code on a watch channel.
//! The handle is owned by exactly one instance slot at a time.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

use super::error::LaunchError;
use crate::utils;

/// Default maximum number of console lines kept per instance.
/// Overridable via `log_buffer_size` in config/global.toml.
pub const DEFAULT_LOG_BUFFER: usize = 10_000;

/// Log-level extraction pattern for vanilla Minecraft server output,
/// e.g. `[12:00:00] [Server thread/INFO]: Done (5.123s)!`.
pub const MINECRAFT_LOG_PATTERN: &str = r"/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]";

// ─── Console line types ──────────────────────────────────────

/// A single line of console output, with a sequential id for polling
/// (`GET /console?since=<id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: ConsoleSource,
    pub content: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleSource {
    Stdout,
    Stderr,
    /// Messages from warden-core itself (spawn/exit markers, sent commands)
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

// ─── Console ring buffer ─────────────────────────────────────

struct ConsoleBuffer {
    lines: VecDeque<ConsoleLine>,
    next_id: u64,
    max_size: usize,
}

impl ConsoleBuffer {
    fn with_capacity(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size.min(1024)),
            next_id: 0,
            max_size: max_size.max(1),
        }
    }

    fn push(&mut self, source: ConsoleSource, content: String, level: LogLevel) -> ConsoleLine {
        let line = ConsoleLine {
            id: self.next_id,
            timestamp: utils::current_timestamp(),
            source,
            content,
            level,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    fn get_since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.lines
            .iter()
            .filter(|l| l.id > since_id)
            .cloned()
            .collect()
    }

    fn get_recent(&self, count: usize) -> Vec<ConsoleLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }
}

// ─── Game process ────────────────────────────────────────────

/// A running (or exited) server process.
pub struct GameProcess {
    pub pid: u32,
    stdin_tx: mpsc::Sender<String>,
    console: Arc<Mutex<ConsoleBuffer>>,
    console_broadcast: broadcast::Sender<ConsoleLine>,
    exit_rx: watch::Receiver<Option<i32>>,
    stop_requested: AtomicBool,
    stop_command: String,
}

impl GameProcess {
    /// Spawn the server process with piped stdio and start its I/O pumps.
    ///
    /// `program` must already be resolved to an existing executable; guards
    /// (PATH lookup, port probe, EULA) live in [`super::ProcessSupervisor`].
    pub async fn spawn(
        program: &Path,
        args: &[String],
        working_dir: &Path,
        env: &[(String, String)],
        stop_command: &str,
        log_buffer_size: usize,
    ) -> Result<Self, LaunchError> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        for (key, value) in env {
            cmd.env(key, value);
        }

        utils::apply_creation_flags(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::Spawn(format!("'{}': {}", program.display(), e)))?;

        let pid = child
            .id()
            .ok_or_else(|| LaunchError::Spawn("spawned process has no PID".to_string()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(256);
        let (console_tx, _) = broadcast::channel::<ConsoleLine>(2048);
        let (exit_tx, exit_rx) = watch::channel::<Option<i32>>(None);

        let console = Arc::new(Mutex::new(ConsoleBuffer::with_capacity(log_buffer_size)));
        let level_regex = Arc::new(
            Regex::new(MINECRAFT_LOG_PATTERN).expect("builtin log pattern must compile"),
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = stdout {
            let buf = console.clone();
            let bc = console_tx.clone();
            let re = level_regex.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let level = parse_log_level(&line, &re);
                    let entry = buf.lock().await.push(ConsoleSource::Stdout, line, level);
                    let _ = bc.send(entry);
                }
            });
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = stderr {
            let buf = console.clone();
            let bc = console_tx.clone();
            let re = level_regex.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let level = match parse_log_level(&line, &re) {
                        // stderr lines are at least Warn
                        LogLevel::Info => LogLevel::Warn,
                        other => other,
                    };
                    let entry = buf.lock().await.push(ConsoleSource::Stderr, line, level);
                    let _ = bc.send(entry);
                }
            });
        }

        // ── stdin writer ─────────────────────────────────────
        if let Some(mut stdin_handle) = stdin {
            tokio::spawn(async move {
                while let Some(cmd) = stdin_rx.recv().await {
                    let data = if cmd.ends_with('\n') {
                        cmd
                    } else {
                        format!("{}\n", cmd)
                    };
                    if stdin_handle.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin_handle.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // ── waiter: publish exit code ────────────────────────
        {
            let buf = console.clone();
            let bc = console_tx.clone();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    // killed by signal -> no code; report -1
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(e) => {
                        tracing::error!("Failed to wait for PID {}: {}", pid, e);
                        -1
                    }
                };
                let msg = format!("Process exited with code {}", code);
                tracing::info!("PID {}: {}", pid, msg);
                let entry = buf
                    .lock()
                    .await
                    .push(ConsoleSource::System, msg, LogLevel::Info);
                let _ = bc.send(entry);
                let _ = exit_tx.send(Some(code));
            });
        }

        {
            let msg = format!("Process started with PID {}", pid);
            let entry = console
                .lock()
                .await
                .push(ConsoleSource::System, msg, LogLevel::Info);
            let _ = console_tx.send(entry);
        }

        Ok(Self {
            pid,
            stdin_tx,
            console,
            console_broadcast: console_tx,
            exit_rx,
            stop_requested: AtomicBool::new(false),
            stop_command: stop_command.to_string(),
        })
    }

    /// Send a console command to the process's stdin.
    pub async fn send_command(&self, command: &str) -> anyhow::Result<()> {
        self.stdin_tx
            .send(command.to_string())
            .await
            .map_err(|e| anyhow::anyhow!("stdin channel closed: {}", e))?;
        let entry = self.console.lock().await.push(
            ConsoleSource::System,
            format!("> {}", command),
            LogLevel::Info,
        );
        let _ = self.console_broadcast.send(entry);
        Ok(())
    }

    /// Ask the server to shut down via its console stop command.
    /// Marks the stop as requested so the exit is not classified as a crash.
    pub async fn request_stop(&self) {
        self.mark_stop_requested();
        if self.send_command(&self.stop_command.clone()).await.is_err() {
            tracing::debug!("PID {}: stdin already closed, skipping stop command", self.pid);
        }
    }

    pub fn mark_stop_requested(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_was_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub async fn console_since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.console.lock().await.get_since(since_id)
    }

    pub async fn recent_console(&self, count: usize) -> Vec<ConsoleLine> {
        self.console.lock().await.get_recent(count)
    }

    /// Subscribe to live console output.
    #[allow(dead_code)] // 공개 API — 실시간 콘솔 팔로잉용
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleLine> {
        self.console_broadcast.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit code, once the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Wait until the process exits.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.exit_rx.clone();
        while rx.borrow().is_none() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Deliver SIGTERM (TerminateProcess on Windows).
    pub fn terminate(&self) -> Result<(), String> {
        signal_pid(self.pid, false)
    }

    /// Deliver SIGKILL.
    pub fn force_kill(&self) -> Result<(), String> {
        signal_pid(self.pid, true)
    }
}

// ─── Platform signal delivery ────────────────────────────────

#[cfg(not(target_os = "windows"))]
fn signal_pid(pid: u32, force: bool) -> Result<(), String> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    signal::kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| format!("failed to send {:?} to {}: {}", signal, pid, e))
}

#[cfg(target_os = "windows")]
fn signal_pid(pid: u32, force: bool) -> Result<(), String> {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(format!("failed to open process {}", pid));
        }
        let exit_code = if force { 1 } else { 0 };
        let result = TerminateProcess(handle, exit_code);
        CloseHandle(handle);
        if result == 0 {
            return Err("TerminateProcess failed".to_string());
        }
    }
    Ok(())
}

// ─── Helpers ─────────────────────────────────────────────────

fn parse_log_level(line: &str, pattern: &Regex) -> LogLevel {
    if let Some(caps) = pattern.captures(line) {
        if let Some(level) = caps.name("level") {
            return match level.as_str() {
                "ERROR" | "FATAL" => LogLevel::Error,
                "WARN" => LogLevel::Warn,
                "DEBUG" => LogLevel::Debug,
                _ => LogLevel::Info,
            };
        }
    }
    LogLevel::Info
}
