//! Named-server configuration file.
//!
//! JSON with a top-level `mcpServers` map:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "fetch": { "command": "uvx", "args": ["mcp-server-fetch"] },
//!     "search": {
//!       "command": "npx",
//!       "args": ["-y", "search-server"],
//!       "env": { "REGION": "eu" },
//!       "headerToEnv": { "X-Search-Api-Key": "SEARCH_API_KEY" }
//!     }
//!   }
//! }
//! ```
//!
//! Unknown per-server fields (`timeout`, `transportType`, ...) are accepted
//! and ignored. A missing `command` is a configuration error.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use mcp_proxy_bridge::{BridgeError, BridgeResult, NamedServerEntry};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: BTreeMap<String, ConfigEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigEntry {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    header_to_env: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

/// Load all named servers from `path`.
pub fn load_named_servers(
    path: &Path,
    pass_environment: bool,
) -> BridgeResult<Vec<NamedServerEntry>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BridgeError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
    })?;
    let file: ConfigFile = serde_json::from_str(&raw).map_err(|e| {
        BridgeError::ConfigInvalid(format!("invalid config {}: {e}", path.display()))
    })?;

    let mut entries = Vec::with_capacity(file.mcp_servers.len());
    for (name, config) in file.mcp_servers {
        let command = config.command.ok_or_else(|| {
            BridgeError::ConfigInvalid(format!("server {name:?}: missing command"))
        })?;
        let mut entry = NamedServerEntry::new(name, command);
        entry.args = config.args;
        entry.env = config.env;
        entry.enabled = config.enabled;
        entry.header_to_env = config.header_to_env;
        entry.pass_environment = pass_environment;
        entries.push(entry);
    }
    Ok(entries)
}
