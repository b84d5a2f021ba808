//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::client;

use crate::error::Result;
use crate::transport::ssh::ClientHandler;

/// A single way of proving identity to an SSH server.
///
/// Implementations must be thread-safe (`Send + Sync`): one list of methods is
/// shared by every node connection a relay client makes.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate on an already negotiated connection.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - The server rejected the credential
    /// * `Err(Error::Credential)` - The credential could not be offered
    /// * `Err(_)` - Transport failure during the attempt
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool>;

    /// Short method name (`password`, `key`, `agent`).
    fn name(&self) -> &'static str;

    /// Name used in logs to tell methods of the same kind apart.
    fn label(&self) -> String {
        self.name().to_string()
    }
}
