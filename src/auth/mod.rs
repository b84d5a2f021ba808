//! Authentication methods for relay and node connections.
//!
//! Each method implements [`AuthStrategy`]; an [`AuthChain`] keeps them in
//! the order they should be tried.
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`KeyAuth`]: Private key file authentication
//! - [`AgentAuth`]: SSH agent authentication

mod agent;
mod chain;
mod key;
mod password;
mod traits;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
