//! Cluster control API.
//!
//! Every cluster exposes a control endpoint reachable through the relay at the
//! synthetic address `@<cluster>`. The relay client only needs two calls from
//! it: the node inventory and the current parameters of a shared session.
//! [`HttpControlClient`] speaks JSON over HTTP/1.1 on channels dialed through
//! the node connection; tests substitute their own [`ControlClient`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{Dialer, TerminalSize};

/// Placeholder address of the control endpoint. The node connection routes
/// every dial to the cluster's control service regardless of the address.
pub const CONTROL_ENDPOINT: &str = "stub:0";

/// A node registered with a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub addr: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl NodeRecord {
    /// A node matches when it carries every requested label with the same
    /// value. An empty label set matches every node.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        labels
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

/// Terminal geometry as reported by the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TerminalParams {
    pub w: u16,
    pub h: u16,
}

impl TerminalParams {
    pub fn size(&self) -> TerminalSize {
        TerminalSize::new(self.w, self.h)
    }
}

/// One participant of a shared session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub id: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub server_id: String,
}

/// A shared session as the control API reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub terminal_params: TerminalParams,
    #[serde(default)]
    pub parties: Vec<Party>,
}

#[async_trait]
pub trait ControlClient: Send + Sync {
    /// Every node registered with the cluster.
    async fn nodes(&self) -> Result<Vec<NodeRecord>>;

    /// The session with this id, or `None` if the cluster does not know it.
    async fn session(&self, id: &str) -> Result<Option<SessionRecord>>;
}

/// Builds a control client on top of a node connection's dialer.
pub trait ControlConnector: Send + Sync {
    fn connect(&self, dialer: Dialer) -> Arc<dyn ControlClient>;
}

/// JSON over HTTP/1.1, one request per dialed channel.
pub struct HttpControlClient {
    dialer: Dialer,
}

impl HttpControlClient {
    pub fn new(dialer: Dialer) -> Self {
        Self { dialer }
    }

    async fn get(&self, path: &str) -> Result<(StatusCode, Bytes)> {
        let conn = self.dialer.dial(CONTROL_ENDPOINT).await?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(conn))
            .await
            .map_err(|e| Error::Control(format!("handshake: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Control connection ended: {}", e);
            }
        });

        let request = Request::get(path)
            .header(hyper::header::HOST, CONTROL_ENDPOINT)
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::Control(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Control(format!("GET {}: {}", path, e)))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Control(format!("GET {}: {}", path, e)))?
            .to_bytes();

        debug!("GET {} -> {}", path, status);
        Ok((status, body))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let (status, body) = self.get(path).await?;
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(serde_json::from_slice(&body)?)),
            status => Err(Error::Control(format!(
                "GET {}: {}: {}",
                path,
                status,
                String::from_utf8_lossy(&body).trim()
            ))),
        }
    }
}

#[async_trait]
impl ControlClient for HttpControlClient {
    async fn nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.get_json("/v1/nodes").await?.unwrap_or_default())
    }

    async fn session(&self, id: &str) -> Result<Option<SessionRecord>> {
        self.get_json(&format!("/v1/sessions/{}", id)).await
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HttpControlConnector;

impl ControlConnector for HttpControlConnector {
    fn connect(&self, dialer: Dialer) -> Arc<dyn ControlClient> {
        Arc::new(HttpControlClient::new(dialer))
    }
}
