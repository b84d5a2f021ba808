//! Client side of the relay.
//!
//! [`ProxyClient`] owns the one secured connection to the relay. Everything
//! else rides logical sessions on it:
//!
//! - the cluster listing (`proxysites`, see [`crate::sites`]);
//! - node connections, established by the credential trial loop in
//!   [`ProxyClient::connect_to_node`];
//! - the cluster control API, reached as the node `@<cluster>`.
//!
//! # Credential trial loop
//!
//! The node handshake offers one authentication method per attempt, so every
//! configured method gets its own logical session and its own handshake, in
//! order. A rejected method closes its session and the next one is tried.
//! Anything else (the relay refusing to route, a protocol or transport
//! failure) ends the loop immediately.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::auth::AuthChain;
use crate::config::Settings;
use crate::conn::VirtualConnection;
use crate::control::{ControlClient, ControlConnector, HttpControlConnector, NodeRecord};
use crate::error::{Error, Result};
use crate::hostkey::HostKeyPolicy;
use crate::node::{NodeClient, take_pipes};
use crate::sites::{Site, fetch_sites, select_site};
use crate::transport::ssh::{RelayConnectOptions, SshConnector, connect_relay};
use crate::transport::{
    Connector, Dialer, HandshakeTarget, SessionCloser, Transport, cluster_name,
    is_cluster_endpoint, strip_cluster,
};

/// Prefix of the sub-service that routes a session to a destination.
const PROXY_SUBSYSTEM_PREFIX: &str = "proxy:";

/// Everything needed to reach the relay and the nodes behind it.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Relay address, `host[:port]`.
    pub address: String,
    /// Login used on the relay and for cluster control connections.
    pub login: String,
    pub auth: AuthChain,
    /// Applied to the relay and to nodes.
    pub host_key_policy: HostKeyPolicy,
    /// Applied to `@cluster` control endpoints, checked under the cluster
    /// name on port 22.
    pub cluster_host_key_policy: HostKeyPolicy,
    /// Cluster to use; the first one listed when unset.
    pub site: Option<String>,
    pub settings: Settings,
}

pub struct ProxyClient {
    transport: Arc<dyn Transport>,
    connector: Arc<dyn Connector>,
    control: Arc<dyn ControlConnector>,
    host_login: String,
    proxy_address: String,
    host_key_policy: HostKeyPolicy,
    cluster_host_key_policy: HostKeyPolicy,
    auth: AuthChain,
    site_name: Option<String>,
    settings: Settings,
}

impl ProxyClient {
    /// Connect and authenticate to the relay.
    pub async fn connect(config: ProxyConfig) -> Result<Arc<Self>> {
        let settings = config.settings;
        let (transport, retries) = connect_relay(&RelayConnectOptions {
            address: &config.address,
            login: &config.login,
            auth: &config.auth,
            host_key_policy: &config.host_key_policy,
            timeout: settings.connect_timeout,
            max_retries: settings.max_retries,
            min_delay: settings.retry_delay,
            compress: settings.compress,
        })
        .await?;
        debug!("Relay connection needed {} retries", retries);

        let connector = SshConnector::new(settings.compress, settings.connect_timeout);
        Ok(Arc::new(Self::new(
            Arc::new(transport),
            Arc::new(connector),
            Arc::new(HttpControlConnector),
            config,
        )))
    }

    /// Assemble a client from an established relay transport.
    pub fn new(
        transport: Arc<dyn Transport>,
        connector: Arc<dyn Connector>,
        control: Arc<dyn ControlConnector>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            transport,
            connector,
            control,
            host_login: config.login,
            proxy_address: config.address,
            host_key_policy: config.host_key_policy,
            cluster_host_key_policy: config.cluster_host_key_policy,
            auth: config.auth,
            site_name: config.site,
            settings: config.settings,
        }
    }

    pub fn host_login(&self) -> &str {
        &self.host_login
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Every cluster the relay can route to.
    pub async fn sites(&self) -> Result<Vec<Site>> {
        fetch_sites(self.transport.as_ref(), self.settings.sites_timeout).await
    }

    /// The configured cluster, or the first one listed.
    pub async fn site(&self) -> Result<Site> {
        let sites = self.sites().await?;
        select_site(&sites, self.site_name.as_deref()).cloned()
    }

    /// Connect to the control API of the selected cluster.
    pub async fn connect_to_site(self: &Arc<Self>) -> Result<Arc<dyn ControlClient>> {
        let site = self.site().await?;
        let node = self
            .connect_to_node(&format!("@{}", site.name), &self.host_login)
            .await
            .inspect_err(|e| error!("Failed to connect to cluster {}: {}", site.name, e))?;
        Ok(self.control.connect(Dialer::new(node.transport().clone())))
    }

    /// Nodes of the selected cluster carrying every label in `labels`.
    pub async fn find_nodes_by_labels(
        self: &Arc<Self>,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<NodeRecord>> {
        let control = self.connect_to_site().await?;
        let nodes = control.nodes().await?;
        Ok(nodes.into_iter().filter(|node| node.matches(labels)).collect())
    }

    /// Connect to a node (`host[:port]`, or `@cluster` for a control
    /// endpoint) through the relay, trying each authentication method in turn.
    pub async fn connect_to_node(
        self: &Arc<Self>,
        address: &str,
        login: &str,
    ) -> Result<Arc<NodeClient>> {
        info!("Connecting to node {}", address);
        let host_key_policy = if is_cluster_endpoint(address) {
            &self.cluster_host_key_policy
        } else {
            &self.host_key_policy
        };
        let target = HandshakeTarget {
            address,
            login,
            host_key_policy,
        };

        for method in self.auth.iter() {
            let session = self.transport.open_session().await?;
            let (stdin, stdout, mut stderr) = take_pipes(session.as_ref())?;

            let subsystem = format!("{}{}", PROXY_SUBSYSTEM_PREFIX, address);
            if let Err(e) = session.request_subsystem(&subsystem).await {
                let relay_session = session.clone();
                tokio::spawn(async move {
                    let mut local = tokio::io::stderr();
                    let _ = tokio::io::copy(&mut stderr, &mut local).await;
                    let _ = relay_session.close();
                });
                return Err(Error::Routing {
                    cluster: cluster_name(address).to_string(),
                    reason: e.to_string(),
                });
            }

            let conn = VirtualConnection::new(
                stdout,
                stdin,
                SessionCloser(session.clone()),
                self.proxy_address.clone(),
                address,
            );

            match self.connector.connect(conn, &target, method.as_ref()).await {
                Ok(transport) => {
                    info!("Connected to {} as {} using {}", address, login, method.label());
                    return Ok(Arc::new(NodeClient::new(transport, Arc::downgrade(self))));
                }
                Err(e) if e.is_rejection() => {
                    debug!("{} rejected by {}: {}", method.label(), address, e);
                    let _ = session.close();
                }
                Err(e) => {
                    let _ = session.close();
                    return Err(e);
                }
            }
        }

        Err(Error::AccessDenied {
            login: login.to_string(),
            target: strip_cluster(address).to_string(),
        })
    }

    /// Close the relay connection and everything carried on it.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}
