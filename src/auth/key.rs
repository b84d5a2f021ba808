//! Private key file SSH authentication.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::ssh::ClientHandler;

use super::traits::AuthStrategy;

/// Private key file authentication strategy.
///
/// The key is loaded on every attempt, so a key file replaced between two
/// connections is picked up. Passphrase-protected keys need the passphrase
/// up front.
pub struct KeyAuth {
    key_path: PathBuf,
    passphrase: Option<String>,
}

impl KeyAuth {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let key_pair = keys::load_secret_key(&self.key_path, self.passphrase.as_deref())
            .map_err(|e| Error::Credential {
                method: self.label(),
                reason: e.to_string(),
            })?;

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }

    fn label(&self) -> String {
        format!("key {}", self.key_path.display())
    }
}
