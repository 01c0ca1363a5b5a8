//! mcp-proxy - bidirectional transport bridge for the Model Context Protocol.
//!
//! Two modes, selected by the positional argument:
//!
//! - `mcp-proxy https://host/sse` - speak stdio to the parent MCP client
//!   and forward to the remote server over SSE or Streamable HTTP.
//! - `mcp-proxy --port 9000 some-command ...` - expose SSE and Streamable
//!   HTTP endpoints and spawn one stdio child per ingress session.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use mcp_proxy_bridge::registry::DEFAULT_SERVER_NAME;
use mcp_proxy_bridge::{
    create_router, AppState, Bridge, BridgeError, BridgeResult, NamedServerEntry,
    OAuthClientCredentials, ServerRegistry, SseClientConfig, SseClientTransport,
    StdioServerTransport, StreamableClientConfig, StreamableHttpTransport, Transport, VerifySsl,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// How long live bridges get to drain after a shutdown signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// SSE stream plus companion POST endpoint.
    Sse,
    /// Single Streamable HTTP endpoint.
    Streamablehttp,
}

#[derive(Debug, Parser)]
#[command(name = "mcp-proxy", version, about = "Bidirectional MCP transport bridge")]
struct Cli {
    /// URL of a remote MCP server (stdio -> remote mode), or the command to
    /// spawn as the default stdio server (HTTP server mode).
    command_or_url: Option<String>,

    /// Arguments passed to the spawned command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Header sent to the remote server (repeatable).
    #[arg(short = 'H', long = "headers", num_args = 2, value_names = ["KEY", "VALUE"], action = clap::ArgAction::Append)]
    headers: Vec<String>,

    /// Transport used toward the remote server.
    #[arg(long, value_enum, default_value = "sse")]
    transport: TransportKind,

    /// TLS verification: true, false, or a CA bundle path.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL|PATH")]
    verify_ssl: Option<String>,

    /// Disable TLS verification.
    #[arg(long)]
    no_verify_ssl: bool,

    /// OAuth2 client-credentials client id.
    #[arg(long)]
    client_id: Option<String>,

    /// OAuth2 client-credentials client secret.
    #[arg(long)]
    client_secret: Option<String>,

    /// OAuth2 token endpoint.
    #[arg(long)]
    token_url: Option<String>,

    /// Environment variable for the spawned command (repeatable).
    #[arg(short = 'e', long = "env", num_args = 2, value_names = ["KEY", "VALUE"], action = clap::ArgAction::Append)]
    env: Vec<String>,

    /// Working directory for the spawned command.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Pass the full parent environment to spawned commands.
    #[arg(long, overrides_with = "no_pass_environment")]
    pass_environment: bool,

    #[arg(long, overrides_with = "pass_environment", hide = true)]
    no_pass_environment: bool,

    /// Port to listen on (HTTP server mode); 0 picks a free port.
    #[arg(long, alias = "sse-port", default_value_t = 0)]
    port: u16,

    /// Host to bind (HTTP server mode).
    #[arg(long, alias = "sse-host", default_value = "127.0.0.1")]
    host: String,

    /// Run Streamable HTTP statelessly: one bridge and one child per POST.
    #[arg(long, overrides_with = "no_stateless")]
    stateless: bool,

    #[arg(long, overrides_with = "stateless", hide = true)]
    no_stateless: bool,

    /// Allowed CORS origin (repeatable). Empty denies all cross-origin.
    #[arg(long = "allow-origin", action = clap::ArgAction::Append)]
    allow_origin: Vec<String>,

    /// Named server: NAME plus the command line to spawn (repeatable).
    #[arg(long = "named-server", num_args = 2, value_names = ["NAME", "COMMAND"], action = clap::ArgAction::Append)]
    named_server: Vec<String>,

    /// Named-server JSON configuration file; overrides --named-server.
    #[arg(long)]
    named_server_config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "INFO")]
    log_level: String,

    /// Shorthand for --log-level DEBUG; wins over --log-level.
    #[arg(long, overrides_with = "no_debug")]
    debug: bool,

    #[arg(long, overrides_with = "debug", hide = true)]
    no_debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        let code = match e {
            BridgeError::ConfigInvalid(_) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}

/// Logs go to stderr: in stdio mode, stdout is the MCP channel.
fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        "debug".to_string()
    } else {
        cli.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> BridgeResult<()> {
    match cli.command_or_url.as_deref().and_then(parse_remote_url) {
        Some(url) => run_client(cli, url).await,
        None => run_server(cli).await,
    }
}

/// An absolute http(s) URL selects stdio -> remote mode.
fn parse_remote_url(value: &str) -> Option<Url> {
    let url = Url::parse(value).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// stdio -> remote: we are the stdio server for the parent client and the
/// MCP client toward the remote server.
async fn run_client(cli: Cli, url: Url) -> BridgeResult<()> {
    let headers = pairs(&cli.headers);
    let oauth = resolve_oauth(&cli)?;
    let verify_ssl = resolve_verify_ssl(&cli);
    let api_access_token = std::env::var("API_ACCESS_TOKEN").ok();

    info!(url = %url, transport = ?cli.transport, "Connecting to remote MCP server");

    let upstream: Arc<dyn Transport> = match cli.transport {
        TransportKind::Sse => Arc::new(
            SseClientTransport::connect(SseClientConfig {
                url: url.to_string(),
                headers,
                verify_ssl,
                oauth,
                api_access_token,
            })
            .await?,
        ),
        TransportKind::Streamablehttp => Arc::new(StreamableHttpTransport::new(
            StreamableClientConfig {
                url: url.to_string(),
                headers,
                verify_ssl,
                oauth,
                api_access_token,
                stateless: false,
            },
        )?),
    };
    let downstream: Arc<dyn Transport> = Arc::new(StdioServerTransport::new());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    let bridge = Bridge::connect(upstream, downstream, cancel).await?;
    bridge.run().await
}

/// HTTP server mode: SSE and Streamable HTTP in, stdio children out.
async fn run_server(cli: Cli) -> BridgeResult<()> {
    let default_entry = match &cli.command_or_url {
        Some(command) => {
            let mut entry = NamedServerEntry::new(DEFAULT_SERVER_NAME, command);
            entry.args = cli.args.clone();
            entry.env = pairs(&cli.env).into_iter().collect();
            entry.cwd = cli.cwd.clone();
            entry.pass_environment = cli.pass_environment;
            Some(entry)
        }
        None => None,
    };

    let named = match &cli.named_server_config {
        Some(path) => {
            if !cli.named_server.is_empty() {
                warn!("--named-server is ignored because --named-server-config is set");
            }
            config::load_named_servers(path, cli.pass_environment)?
        }
        None => named_servers_from_cli(&cli)?,
    };

    let registry = Arc::new(ServerRegistry::new(default_entry, named)?);
    if registry.is_empty() {
        return Err(BridgeError::ConfigInvalid(
            "no servers configured: provide a command, --named-server or --named-server-config"
                .to_string(),
        ));
    }

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        registry.clone(),
        cli.stateless,
        cli.allow_origin.clone(),
        shutdown.clone(),
    );
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .map_err(|e| {
            BridgeError::ConfigInvalid(format!("cannot bind {}:{}: {e}", cli.host, cli.port))
        })?;
    let addr = listener.local_addr()?;

    info!("Serving MCP Servers via SSE:");
    if registry.has_default() {
        info!("  - http://{addr}/sse");
    }
    for name in registry.named_server_names() {
        info!("  - http://{addr}/servers/{name}/sse");
    }

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_shutdown.cancel();
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    // The signal already flipped every bridge's token; give them a bounded
    // window to drain and reap their children.
    shutdown.cancel();
    let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
    loop {
        let live: usize = registry
            .status()
            .servers
            .values()
            .map(|s| s.live_sessions)
            .sum();
        if live == 0 || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

fn named_servers_from_cli(cli: &Cli) -> BridgeResult<Vec<NamedServerEntry>> {
    let mut entries = Vec::new();
    for (name, command_line) in pairs(&cli.named_server) {
        let mut parts = command_line.split_whitespace();
        let command = parts.next().ok_or_else(|| {
            BridgeError::ConfigInvalid(format!("named server {name:?}: empty command"))
        })?;
        let mut entry = NamedServerEntry::new(name, command);
        entry.args = parts.map(str::to_string).collect();
        entry.pass_environment = cli.pass_environment;
        entries.push(entry);
    }
    Ok(entries)
}

/// Flatten clap's repeated KEY VALUE occurrences into pairs.
fn pairs(values: &[String]) -> Vec<(String, String)> {
    values
        .chunks(2)
        .filter(|chunk| chunk.len() == 2)
        .map(|chunk| (chunk[0].clone(), chunk[1].clone()))
        .collect()
}

fn resolve_verify_ssl(cli: &Cli) -> VerifySsl {
    if cli.no_verify_ssl {
        return VerifySsl::Disabled;
    }
    match cli.verify_ssl.as_deref() {
        None => VerifySsl::Enabled,
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => VerifySsl::Enabled,
            "false" | "0" | "no" => VerifySsl::Disabled,
            _ => VerifySsl::CaBundle(PathBuf::from(value)),
        },
    }
}

fn resolve_oauth(cli: &Cli) -> BridgeResult<Option<OAuthClientCredentials>> {
    match (&cli.client_id, &cli.client_secret, &cli.token_url) {
        (Some(client_id), Some(client_secret), Some(token_url)) => {
            Ok(Some(OAuthClientCredentials {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                token_url: token_url.clone(),
            }))
        }
        (None, None, None) => Ok(None),
        _ => Err(BridgeError::ConfigInvalid(
            "--client-id, --client-secret and --token-url must be set together".to_string(),
        )),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_detection() {
        assert!(parse_remote_url("http://localhost:8080/sse").is_some());
        assert!(parse_remote_url("https://mcp.example.com/mcp").is_some());
        assert!(parse_remote_url("uvx").is_none());
        assert!(parse_remote_url("/usr/local/bin/server").is_none());
        assert!(parse_remote_url("ftp://example.com").is_none());
    }

    #[test]
    fn test_headers_collect_as_pairs() {
        let cli = Cli::parse_from([
            "mcp-proxy",
            "-H",
            "Authorization",
            "Bearer t",
            "--headers",
            "X-Custom",
            "v",
            "http://example.com/sse",
        ]);
        assert_eq!(
            pairs(&cli.headers),
            vec![
                ("Authorization".to_string(), "Bearer t".to_string()),
                ("X-Custom".to_string(), "v".to_string()),
            ]
        );
    }

    #[test]
    fn test_named_server_pairs() {
        let cli = Cli::parse_from([
            "mcp-proxy",
            "--port",
            "9000",
            "--named-server",
            "fetch",
            "uvx mcp-server-fetch",
        ]);
        let entries = named_servers_from_cli(&cli).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "fetch");
        assert_eq!(entries[0].command, "uvx");
        assert_eq!(entries[0].args, vec!["mcp-server-fetch"]);
    }

    #[test]
    fn test_deprecated_aliases() {
        let cli = Cli::parse_from(["mcp-proxy", "--sse-port", "9000", "--sse-host", "0.0.0.0"]);
        assert_eq!(cli.port, 9000);
        assert_eq!(cli.host, "0.0.0.0");
    }

    #[test]
    fn test_transport_values() {
        let cli = Cli::parse_from(["mcp-proxy", "--transport", "streamablehttp"]);
        assert_eq!(cli.transport, TransportKind::Streamablehttp);

        let cli = Cli::parse_from(["mcp-proxy"]);
        assert_eq!(cli.transport, TransportKind::Sse);
    }

    #[test]
    fn test_verify_ssl_resolution() {
        let cli = Cli::parse_from(["mcp-proxy", "--no-verify-ssl"]);
        assert!(matches!(resolve_verify_ssl(&cli), VerifySsl::Disabled));

        let cli = Cli::parse_from(["mcp-proxy", "--verify-ssl", "false"]);
        assert!(matches!(resolve_verify_ssl(&cli), VerifySsl::Disabled));

        let cli = Cli::parse_from(["mcp-proxy", "--verify-ssl"]);
        assert!(matches!(resolve_verify_ssl(&cli), VerifySsl::Enabled));

        let cli = Cli::parse_from(["mcp-proxy", "--verify-ssl", "/etc/ssl/ca.pem"]);
        match resolve_verify_ssl(&cli) {
            VerifySsl::CaBundle(path) => assert_eq!(path, PathBuf::from("/etc/ssl/ca.pem")),
            other => panic!("expected CA bundle, got {other:?}"),
        }

        let cli = Cli::parse_from(["mcp-proxy"]);
        assert!(matches!(resolve_verify_ssl(&cli), VerifySsl::Enabled));
    }

    #[test]
    fn test_oauth_requires_all_three() {
        let cli = Cli::parse_from([
            "mcp-proxy",
            "--client-id",
            "id",
            "--client-secret",
            "secret",
            "--token-url",
            "https://auth.example.com/token",
        ]);
        assert!(resolve_oauth(&cli).unwrap().is_some());

        let cli = Cli::parse_from(["mcp-proxy", "--client-id", "id"]);
        assert!(matches!(
            resolve_oauth(&cli),
            Err(BridgeError::ConfigInvalid(_))
        ));

        let cli = Cli::parse_from(["mcp-proxy"]);
        assert!(resolve_oauth(&cli).unwrap().is_none());
    }

    #[test]
    fn test_pass_environment_flag_pair() {
        let cli = Cli::parse_from(["mcp-proxy", "--pass-environment"]);
        assert!(cli.pass_environment);

        let cli = Cli::parse_from([
            "mcp-proxy",
            "--pass-environment",
            "--no-pass-environment",
        ]);
        assert!(!cli.pass_environment);

        let cli = Cli::parse_from(["mcp-proxy"]);
        assert!(!cli.pass_environment);
    }

    #[test]
    fn test_debug_wins_over_log_level() {
        let cli = Cli::parse_from(["mcp-proxy", "--log-level", "ERROR", "--debug"]);
        assert!(cli.debug);
        assert_eq!(cli.log_level, "ERROR");
    }

    #[test]
    fn test_trailing_args_reach_default_server() {
        let cli = Cli::parse_from(["mcp-proxy", "uvx", "mcp-server-fetch", "--some-flag"]);
        assert_eq!(cli.command_or_url.as_deref(), Some("uvx"));
        assert_eq!(cli.args, vec!["mcp-server-fetch", "--some-flag"]);
    }

    #[test]
    fn test_allow_origin_repeatable() {
        let cli = Cli::parse_from([
            "mcp-proxy",
            "--allow-origin",
            "https://a.example",
            "--allow-origin",
            "https://b.example",
        ]);
        assert_eq!(cli.allow_origin.len(), 2);
    }
}
