//! Per-server configuration handling.
//!
//! Each instance carries a `server.properties` file (`key=value`, UTF-8,
//! `#`/`!` comment lines) plus an `eula.txt`. A loaded [`ServerConfig`] is a
//! snapshot: the manager reads a fresh one right before every launch, and
//! writes go through [`save`] which replaces the file atomically.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const KEY_SERVER_PORT: &str = "server-port";
pub const KEY_MEMORY: &str = "memory";
pub const KEY_JAVA_EXECUTABLE: &str = "java-executable";
pub const KEY_SERVER_JAR: &str = "server-jar";
pub const KEY_STOP_COMMAND: &str = "stop-command";
pub const KEY_JVM_ARGS: &str = "jvm-args";

const FILE_HEADER: &str = "# server.properties managed by warden-core";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("malformed config line {line} in {}: {content:?}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        content: String,
    },
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Snapshot of one server's settings.
///
/// Keys are stored sorted so serialization is byte-stable; keys this daemon
/// does not know about are preserved across a load/save cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfig {
    entries: BTreeMap<String, String>,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Baseline settings seeded into a freshly registered instance.
    pub fn baseline(port: u16) -> Self {
        let mut cfg = Self::new();
        cfg.set(KEY_SERVER_PORT, port.to_string());
        cfg.set(KEY_MEMORY, "2G");
        cfg.set("motd", "A Minecraft Server");
        cfg.set("max-players", "20");
        cfg.set("online-mode", "true");
        cfg.set("white-list", "false");
        cfg.set("gamemode", "survival");
        cfg.set("difficulty", "normal");
        cfg
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn server_port(&self) -> Option<u16> {
        self.get(KEY_SERVER_PORT).and_then(|v| v.parse().ok())
    }

    pub fn memory(&self) -> Option<&str> {
        self.get(KEY_MEMORY).filter(|v| !v.is_empty())
    }

    pub fn java_executable(&self) -> &str {
        self.get(KEY_JAVA_EXECUTABLE).unwrap_or("java")
    }

    pub fn server_jar(&self) -> &str {
        self.get(KEY_SERVER_JAR).unwrap_or("server.jar")
    }

    /// Console command that asks the server to shut down on its own.
    pub fn stop_command(&self) -> &str {
        self.get(KEY_STOP_COMMAND).unwrap_or("stop")
    }

    /// Derive the launch command line: `java [-Xmx..] [jvm-args..] -jar <jar> nogui`.
    pub fn launch_command(&self) -> (String, Vec<String>) {
        let mut args = Vec::new();
        if let Some(mem) = self.memory() {
            args.push(format!("-Xmx{}", mem));
        }
        if let Some(extra) = self.get(KEY_JVM_ARGS) {
            args.extend(extra.split_whitespace().map(String::from));
        }
        args.push("-jar".to_string());
        args.push(self.server_jar().to_string());
        args.push("nogui".to_string());
        (self.java_executable().to_string(), args)
    }

    /// Render to the on-disk format. Sorted keys, fixed header.
    pub fn to_string_pretty(&self) -> String {
        let mut out = String::with_capacity(64 + self.entries.len() * 24);
        out.push_str(FILE_HEADER);
        out.push('\n');
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

/// Load a `server.properties`-style file.
///
/// Unknown keys are kept verbatim. A line that is neither blank, a comment,
/// nor `key=value` is a [`ConfigError::Parse`] with its 1-based line number.
pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut cfg = ServerConfig::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => cfg.set(key.trim(), value.trim()),
            None => {
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    content: raw.to_string(),
                })
            }
        }
    }
    Ok(cfg)
}

/// Atomic save: write to a temp file in the target directory, then rename.
pub fn save(config: &ServerConfig, path: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match parent {
        Some(dir) => tempfile::NamedTempFile::new_in(dir),
        None => tempfile::NamedTempFile::new(),
    }
    .map_err(io_err)?;

    tmp.write_all(config.to_string_pretty().as_bytes())
        .map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.persist(path)
        .map_err(|e| io_err(e.error))?;
    Ok(())
}

// ─── EULA ────────────────────────────────────────────────────

/// Whether `<dir>/eula.txt` exists and accepts the EULA.
pub fn read_eula(dir: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(dir.join("eula.txt")) else {
        return false;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if let Some(value) = line.strip_prefix("eula=") {
            return value.trim().eq_ignore_ascii_case("true");
        }
    }
    false
}

pub fn write_eula(dir: &Path, accepted: bool) -> Result<(), ConfigError> {
    let path = dir.join("eula.txt");
    let content = format!("# EULA acknowledged via warden-core\neula={}\n", accepted);
    std::fs::write(&path, content).map_err(|source| ConfigError::Io { path, source })
}

// ─── Daemon config ───────────────────────────────────────────

/// Daemon-wide settings from `config/global.toml`. Every field is optional;
/// a missing or unreadable file yields defaults, matching how the rest of the
/// daemon treats its own config as best-effort.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct GlobalConfig {
    pub listen_addr: Option<String>,
    pub data_dir: Option<String>,
    pub log_buffer_size: Option<usize>,
    pub graceful_timeout_secs: Option<u64>,
    pub install_timeout_secs: Option<u64>,
}

impl GlobalConfig {
    pub fn load() -> Self {
        let s = std::fs::read_to_string("config/global.toml").unwrap_or_default();
        toml::from_str(&s).unwrap_or_default()
    }

    pub fn listen_addr(&self) -> String {
        std::env::var("WARDEN_LISTEN_ADDR")
            .ok()
            .or_else(|| self.listen_addr.clone())
            .unwrap_or_else(|| "127.0.0.1:57575".to_string())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(self.data_dir.clone().unwrap_or_else(|| ".".to_string()))
    }

    pub fn log_buffer_size(&self) -> usize {
        self.log_buffer_size
            .unwrap_or(crate::supervisor::process::DEFAULT_LOG_BUFFER)
    }

    pub fn graceful_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.graceful_timeout_secs.unwrap_or(10))
    }

    pub fn install_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.install_timeout_secs.unwrap_or(300))
    }
}
