//! SSH agent authentication.

use async_trait::async_trait;
use russh::{client, keys};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::ssh::ClientHandler;

use super::traits::AuthStrategy;

/// SSH agent authentication strategy.
///
/// Connects to the SSH agent (via SSH_AUTH_SOCK) and tries each available
/// identity until one succeeds.
#[derive(Default)]
pub struct AgentAuth;

impl AgentAuth {
    pub fn new() -> Self {
        Self
    }

    fn unusable(&self, reason: impl Into<String>) -> Error {
        Error::Credential {
            method: self.label(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| self.unusable(format!("failed to connect to SSH agent: {}", e)))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| self.unusable(format!("failed to list agent identities: {}", e)))?;

        if identities.is_empty() {
            return Err(self.unusable("no identities found in SSH agent"));
        }

        for identity in identities {
            debug!("Trying SSH agent identity: {:?}", identity.comment());

            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => {
                    info!("Successfully authenticated with SSH agent");
                    return Ok(true);
                }
                Ok(_) => {
                    debug!("Agent identity not accepted, trying next...");
                }
                Err(e) => {
                    debug!("Agent authentication error: {}, trying next...", e);
                }
            }
        }

        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}
