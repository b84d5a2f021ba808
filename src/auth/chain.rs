//! Ordered list of authentication methods.

use std::path::PathBuf;
use std::sync::Arc;

use russh::client;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::ssh::ClientHandler;

use super::traits::AuthStrategy;
use super::{AgentAuth, KeyAuth, PasswordAuth};

/// Authentication methods in the order they are tried.
///
/// Against the relay the chain is walked on one connection until a method
/// succeeds. Against nodes every method gets its own fresh connection (see
/// [`crate::proxy::ProxyClient::connect_to_node`]). Either way, the order
/// methods were added in is the order they are tried.
///
/// # Example
///
/// ```ignore
/// let chain = AuthChain::new()
///     .with_key("/home/me/.ssh/id_ed25519")
///     .with_agent();
/// ```
#[derive(Clone, Default)]
pub struct AuthChain {
    strategies: Vec<Arc<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(self, password: impl Into<String>) -> Self {
        self.with(PasswordAuth::new(password))
    }

    pub fn with_key(self, key_path: impl Into<PathBuf>) -> Self {
        self.with(KeyAuth::new(key_path))
    }

    pub fn with_agent(self) -> Self {
        self.with(AgentAuth::new())
    }

    /// Append any strategy.
    pub fn with(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Arc::new(strategy));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn AuthStrategy>> {
        self.strategies.iter()
    }

    /// Walk the chain on a single connection until one method succeeds.
    pub async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<()> {
        if self.strategies.is_empty() {
            return Err(Error::Credential {
                method: "chain".to_string(),
                reason: "no authentication methods configured".to_string(),
            });
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.label());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authentication succeeded with strategy: {}", strategy.label());
                    return Ok(());
                }
                Ok(false) => {
                    debug!("Authentication rejected for strategy: {}", strategy.label());
                    last_error = Some(Error::AuthRejected {
                        method: strategy.label(),
                    });
                }
                Err(e) if e.is_rejection() => {
                    debug!("Strategy {} unusable: {}", strategy.label(), e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::AuthRejected {
            method: "chain".to_string(),
        }))
    }
}
