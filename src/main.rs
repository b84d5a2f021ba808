#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, info};

use relay_client::auth::AuthChain;
use relay_client::config::Settings;
use relay_client::error::Error;
use relay_client::forward::serve_forwarding;
use relay_client::hostkey::HostKeyPolicy;
use relay_client::node::NodeClient;
use relay_client::proxy::{ProxyClient, ProxyConfig};
use relay_client::session::SessionOptions;
use relay_client::terminal::{LocalTerminal, RawModeGuard, Tty};

#[derive(Debug, Parser)]
#[command(name = "relay-client", version, about = "Reach SSH nodes through a relay proxy")]
struct Cli {
    /// Relay address (host[:port])
    #[arg(long, env = "RELAY_PROXY")]
    proxy: String,

    /// Login on the relay
    #[arg(short, long, env = "RELAY_LOGIN")]
    login: String,

    /// Cluster to work in (defaults to the first one the relay reports)
    #[arg(long, env = "RELAY_SITE")]
    site: Option<String>,

    /// Private key file to authenticate with
    #[arg(short = 'i', long)]
    identity: Option<PathBuf>,

    /// Password to authenticate with
    #[arg(long, env = "RELAY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Authenticate with the SSH agent
    #[arg(long)]
    agent: bool,

    /// known_hosts file used to verify relay and node keys
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// Accept any host key
    #[arg(long, conflicts_with_all = ["known_hosts", "cluster_known_hosts", "cluster_host_key"])]
    insecure: bool,

    /// known_hosts file listing cluster control keys under the cluster name
    #[arg(long, conflicts_with = "cluster_host_key")]
    cluster_known_hosts: Option<PathBuf>,

    /// Base64 public key the cluster control endpoint must present
    #[arg(long, env = "RELAY_CLUSTER_HOST_KEY")]
    cluster_host_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the clusters known to the relay
    Sites,

    /// List nodes of the cluster, optionally filtered by labels
    Ls {
        /// Labels as key=value
        #[arg(value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },

    /// Open a shell or run a command on a node
    Ssh {
        /// Join an existing session by id
        #[arg(long)]
        join: Option<String>,

        /// Node as [login@]host[:port][@cluster]
        target: String,

        /// Command to run instead of a shell
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Forward a local port to an address reachable from a node
    Forward {
        /// Local address to listen on
        local: String,

        /// Address to connect to from the node
        remote: String,

        /// Node as [login@]host[:port][@cluster]
        node: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let proxy = ProxyClient::connect(proxy_config(&cli)).await?;
    info!("Connected to relay {}", cli.proxy);

    let outcome = run_command(&proxy, cli.site, cli.command).await;

    if let Err(e) = proxy.close().await {
        debug!("Closing relay connection: {}", e);
    }

    match outcome {
        Err(Error::ExitStatus(code)) => std::process::exit(code as i32),
        outcome => outcome.map_err(Into::into),
    }
}

fn proxy_config(cli: &Cli) -> ProxyConfig {
    let mut auth = AuthChain::new();
    if cli.agent {
        auth = auth.with_agent();
    }
    if let Some(path) = &cli.identity {
        auth = auth.with_key(path.clone());
    }
    if let Some(password) = &cli.password {
        auth = auth.with_password(password.clone());
    }
    if auth.is_empty() {
        auth = auth.with_agent();
    }

    let host_key_policy = match (&cli.known_hosts, cli.insecure) {
        (_, true) => HostKeyPolicy::AcceptAny,
        (Some(path), false) => HostKeyPolicy::KnownHosts(path.clone()),
        (None, false) => HostKeyPolicy::DefaultKnownHosts,
    };
    let cluster_host_key_policy = cluster_policy(cli);

    ProxyConfig {
        address: cli.proxy.clone(),
        login: cli.login.clone(),
        auth,
        host_key_policy,
        cluster_host_key_policy,
        site: cli.site.clone(),
        settings: Settings::from_env(),
    }
}

/// Host-key policy for `@cluster` control endpoints.
///
/// Without an explicit key or file the endpoint is accepted as is. It is
/// only reachable through the relay connection, whose key was verified.
fn cluster_policy(cli: &Cli) -> HostKeyPolicy {
    match (&cli.cluster_host_key, &cli.cluster_known_hosts) {
        (Some(key), _) => HostKeyPolicy::Pinned(key.clone()),
        (None, Some(path)) => HostKeyPolicy::KnownHosts(path.clone()),
        (None, None) => HostKeyPolicy::AcceptAny,
    }
}

async fn run_command(
    proxy: &Arc<ProxyClient>,
    site: Option<String>,
    command: Command,
) -> relay_client::Result<()> {
    match command {
        Command::Sites => {
            for site in proxy.sites().await? {
                let seen = site
                    .last_connected
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}\t{}\t{}", site.name, site.status, seen);
            }
            Ok(())
        }
        Command::Ls { labels } => {
            let labels: HashMap<String, String> = labels.into_iter().collect();
            for node in proxy.find_nodes_by_labels(&labels).await? {
                let mut pairs: Vec<String> = node
                    .labels
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect();
                pairs.sort();
                println!("{}\t{}\t{}\t{}", node.id, node.hostname, node.addr, pairs.join(","));
            }
            Ok(())
        }
        Command::Ssh {
            join,
            target,
            command,
        } => {
            let (login, address) = resolve_target(&target, proxy.host_login(), site.as_deref());
            let node = proxy.connect_to_node(&address, &login).await?;
            let result = if command.is_empty() {
                interactive_shell(proxy, &node, join).await
            } else {
                let mut stdout = tokio::io::stdout();
                let mut stderr = tokio::io::stderr();
                node.run(
                    &command,
                    tokio::io::stdin(),
                    &mut stdout,
                    &mut stderr,
                    &HashMap::new(),
                )
                .await
            };
            let _ = node.close().await;
            result
        }
        Command::Forward {
            local,
            remote,
            node,
        } => {
            let (login, address) = resolve_target(&node, proxy.host_login(), site.as_deref());
            let node = proxy.connect_to_node(&address, &login).await?;
            let listener = TcpListener::bind(&local).await?;
            info!("Forwarding {} to {}", local, remote);
            tokio::select! {
                _ = serve_forwarding(listener, node.clone(), remote) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down forward");
                    let _ = node.close().await;
                }
            }
            Ok(())
        }
    }
}

async fn interactive_shell(
    proxy: &Arc<ProxyClient>,
    node: &Arc<NodeClient>,
    join: Option<String>,
) -> relay_client::Result<()> {
    let join = match join {
        Some(id) => {
            let control = proxy.connect_to_site().await?;
            let record = control
                .session(&id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("session {} not found", id)))?;
            Some(record)
        }
        None => None,
    };

    let terminal: Option<Arc<dyn LocalTerminal>> = if Tty::is_attached() {
        Some(Arc::new(Tty::new()))
    } else {
        None
    };
    let session = node
        .new_session(SessionOptions {
            join,
            env: HashMap::new(),
            terminal: terminal.clone(),
        })
        .await?;
    info!("Session {}", session.id());

    let conn = node.shell(&session).await?;
    let _raw = match terminal {
        Some(_) => Some(RawModeGuard::enter()?),
        None => None,
    };

    let (mut reader, mut writer, closer) = conn.into_parts();
    let input = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let _ = tokio::io::copy(&mut stdin, &mut writer).await;
        let _ = writer.shutdown().await;
    });

    let mut stdout = tokio::io::stdout();
    let copied = tokio::io::copy(&mut reader, &mut stdout).await;
    let _ = stdout.flush().await;
    input.abort();
    if let Err(e) = closer.close() {
        debug!("Closing shell: {}", e);
    }
    copied.map(|_| ()).map_err(Into::into)
}

/// Resolve `[login@]host[:port][@cluster]` into the login (falling back to
/// `default_login`) and the address the relay routes on.
///
/// A target without a cluster is routed to `site` when one is configured.
fn resolve_target(target: &str, default_login: &str, site: Option<&str>) -> (String, String) {
    let (login, rest) = match target.split_once('@') {
        Some((login, rest)) if !login.is_empty() => (login, rest),
        Some((_, rest)) => (default_login, rest),
        None => (default_login, target),
    };
    let address = match rest.split_once('@') {
        Some((host, cluster)) if !cluster.is_empty() => format!("{}@{}", host, cluster),
        Some((host, _)) => host.to_string(),
        None => match site {
            Some(site) => format!("{}@{}", rest, site),
            None => rest.to_string(),
        },
    };
    (login.to_string(), address)
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("label {} is not key=value", raw))
}
