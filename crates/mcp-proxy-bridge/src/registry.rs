//! Named server registry.
//!
//! Built once at startup from CLI flags or the configuration file, then
//! read-only while the front-end accepts sessions. Each entry describes how
//! to spawn one stdio MCP server, including which incoming HTTP headers map
//! to child environment variables.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;
use serde::Serialize;

use crate::error::{BridgeError, BridgeResult};

/// Environment variables a child inherits even without `--pass-environment`,
/// so executables and home-relative paths still resolve.
#[cfg(unix)]
const DEFAULT_INHERITED_ENV: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];
#[cfg(windows)]
const DEFAULT_INHERITED_ENV: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];

/// How to spawn one named stdio server.
#[derive(Debug, Clone)]
pub struct NamedServerEntry {
    /// URL path segment under `/servers/`.
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Static environment, applied on top of the inherited base.
    pub env: HashMap<String, String>,
    /// HTTP header name to environment variable name.
    pub header_to_env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Inherit the full parent environment instead of the minimal default.
    pub pass_environment: bool,
    pub enabled: bool,
}

impl NamedServerEntry {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            header_to_env: HashMap::new(),
            cwd: None,
            pass_environment: false,
            enabled: true,
        }
    }

    /// Names are URL path segments: letters, digits, `.`, `_`, `-`.
    pub fn validate(&self) -> BridgeResult<()> {
        let valid = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(BridgeError::ConfigInvalid(format!(
                "invalid server name {:?}: must match [A-Za-z0-9._-]+",
                self.name
            )));
        }
        if self.command.is_empty() {
            return Err(BridgeError::ConfigInvalid(format!(
                "server {:?} has no command",
                self.name
            )));
        }
        Ok(())
    }

    /// Extract header-derived environment from an incoming request.
    /// Header-name matching is case-insensitive; absent headers contribute
    /// nothing.
    pub fn header_env(&self, headers: &HeaderMap) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for (header, var) in &self.header_to_env {
            if let Some(value) = headers.get(header.as_str()).and_then(|v| v.to_str().ok()) {
                env.insert(var.clone(), value.to_string());
            }
        }
        env
    }

    /// Materialize the concrete child environment for one session.
    ///
    /// Base environment first (full parent with `pass_environment`, a
    /// minimal inherited set otherwise), overlaid by the entry's static
    /// `env`, overlaid by header-derived variables. Header injection wins
    /// on key conflicts.
    pub fn spawn_descriptor(&self, header_env: HashMap<String, String>) -> SpawnDescriptor {
        let mut env: HashMap<String, String> = if self.pass_environment {
            std::env::vars().collect()
        } else {
            DEFAULT_INHERITED_ENV
                .iter()
                .filter_map(|key| std::env::var(key).ok().map(|v| ((*key).to_string(), v)))
                .collect()
        };
        env.extend(self.env.clone());
        env.extend(header_env);

        SpawnDescriptor {
            command: self.command.clone(),
            args: self.args.clone(),
            env,
            cwd: self.cwd.clone(),
        }
    }
}

/// Fully materialized spawn parameters for one session's child.
#[derive(Debug, Clone)]
pub struct SpawnDescriptor {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// A registry entry plus its live-session counter.
pub struct RegisteredServer {
    pub entry: NamedServerEntry,
    live_sessions: AtomicUsize,
}

impl RegisteredServer {
    fn new(entry: NamedServerEntry) -> Self {
        Self {
            entry,
            live_sessions: AtomicUsize::new(0),
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::SeqCst)
    }

    /// Count one bridge for as long as the guard lives.
    pub fn session_guard(self: &Arc<Self>) -> SessionGuard {
        self.live_sessions.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            server: self.clone(),
        }
    }
}

/// Decrements the owning entry's live-session count on drop.
pub struct SessionGuard {
    server: Arc<RegisteredServer>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.server.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Immutable name → entry map, shared by the whole front-end.
pub struct ServerRegistry {
    default: Option<Arc<RegisteredServer>>,
    named: HashMap<String, Arc<RegisteredServer>>,
    started_at: Instant,
}

/// Name used for the default (unnamed) entry in status reports.
pub const DEFAULT_SERVER_NAME: &str = "default";

impl ServerRegistry {
    pub fn new(
        default: Option<NamedServerEntry>,
        named: Vec<NamedServerEntry>,
    ) -> BridgeResult<Self> {
        if let Some(entry) = &default {
            entry.validate()?;
        }
        let mut map = HashMap::new();
        for entry in named {
            entry.validate()?;
            if map
                .insert(entry.name.clone(), Arc::new(RegisteredServer::new(entry)))
                .is_some()
            {
                return Err(BridgeError::ConfigInvalid(
                    "duplicate named server".to_string(),
                ));
            }
        }
        Ok(Self {
            default: default.map(|e| Arc::new(RegisteredServer::new(e))),
            named: map,
            started_at: Instant::now(),
        })
    }

    /// Look up a spawnable entry. `None` is the default server; disabled
    /// entries resolve to nothing.
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<RegisteredServer>> {
        let server = match name {
            None => self.default.as_ref()?,
            Some(name) => self.named.get(name)?,
        };
        server.entry.enabled.then(|| server.clone())
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.named.is_empty()
    }

    /// Names of all named entries, for startup URL listing.
    pub fn named_server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.named.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn status(&self) -> StatusReport {
        let mut servers = BTreeMap::new();
        if let Some(server) = &self.default {
            servers.insert(
                DEFAULT_SERVER_NAME.to_string(),
                ServerStatus {
                    running: server.entry.enabled,
                    live_sessions: server.live_sessions(),
                },
            );
        }
        for (name, server) in &self.named {
            servers.insert(
                name.clone(),
                ServerStatus {
                    running: server.entry.enabled,
                    live_sessions: server.live_sessions(),
                },
            );
        }
        StatusReport {
            servers,
            uptime_s: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Payload of `GET /status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub servers: BTreeMap<String, ServerStatus>,
    pub uptime_s: u64,
}

#[derive(Debug, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub live_sessions: usize,
}
