//! Client engine for reaching SSH nodes through a relay proxy.
//!
//! A [`proxy::ProxyClient`] holds the authenticated connection to the relay.
//! Through it the client lists clusters, queries the selected cluster's
//! control API, and opens node connections ([`node::NodeClient`]) tunnelled
//! over the relay. A node connection runs commands, interactive shells with
//! terminal size synchronisation ([`session`]), file transfers ([`scp`]) and
//! local port forwards ([`forward`]).

pub mod auth;
pub mod config;
pub mod conn;
pub mod control;
pub mod error;
pub mod forward;
pub mod hostkey;
pub mod node;
pub mod proxy;
pub mod scp;
pub mod session;
pub mod sites;
pub mod terminal;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
