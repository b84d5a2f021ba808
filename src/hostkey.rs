//! Host-key verification policy.
//!
//! One policy covers the relay itself and every node reached through it.
//! Cluster control endpoints (`@cluster`) have no host of their own, so they
//! get a separate policy and are checked under the cluster name.

use std::path::PathBuf;

use russh::keys::PublicKey;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any key (similar to `StrictHostKeyChecking=no`).
    #[default]
    AcceptAny,
    /// Accept exactly this base64-encoded public key.
    Pinned(String),
    /// Accept keys listed for the host in this known_hosts file.
    KnownHosts(PathBuf),
    /// Accept keys listed in the user's default known_hosts file.
    DefaultKnownHosts,
}

impl HostKeyPolicy {
    /// Decide whether `key` is acceptable for `host:port`.
    ///
    /// Returns `Ok(false)` for an unknown key and an error for a key that
    /// contradicts a known_hosts entry.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool> {
        let accepted = match self {
            HostKeyPolicy::AcceptAny => true,
            HostKeyPolicy::Pinned(encoded) => {
                let pinned = russh::keys::parse_public_key_base64(encoded).map_err(|e| {
                    Error::HostKey {
                        host: host.to_string(),
                        reason: format!("invalid pinned key: {}", e),
                    }
                })?;
                pinned == *key
            }
            HostKeyPolicy::KnownHosts(path) => {
                russh::keys::check_known_hosts_path(host, port, key, path).map_err(|e| {
                    Error::HostKey {
                        host: host.to_string(),
                        reason: e.to_string(),
                    }
                })?
            }
            HostKeyPolicy::DefaultKnownHosts => russh::keys::check_known_hosts(host, port, key)
                .map_err(|e| Error::HostKey {
                    host: host.to_string(),
                    reason: e.to_string(),
                })?,
        };

        if accepted {
            debug!("Host key accepted for {}:{}", host, port);
        } else {
            warn!("Unknown host key for {}:{}, rejecting", host, port);
        }
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER_KEY: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAIOwZQcYa0nui0cy93GR2emmREDGb9r9sXFiKgidekG0P";
    const OTHER_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIF8rvjnEw+lpyuiwDGIhL9ZYsKSPW0wZxiR19umMw/W3";

    fn key(encoded: &str) -> PublicKey {
        russh::keys::parse_public_key_base64(encoded).unwrap()
    }

    #[test]
    fn test_default_accepts_any() {
        assert!(matches!(HostKeyPolicy::default(), HostKeyPolicy::AcceptAny));
    }

    #[test]
    fn test_policy_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HostKeyPolicy>();
    }

    mod pinned {
        use super::*;

        #[test]
        fn test_accepts_matching_key() {
            let policy = HostKeyPolicy::Pinned(CLUSTER_KEY.to_string());
            assert!(policy.verify("east", 22, &key(CLUSTER_KEY)).unwrap());
        }

        #[test]
        fn test_rejects_other_key() {
            let policy = HostKeyPolicy::Pinned(CLUSTER_KEY.to_string());
            assert!(!policy.verify("east", 22, &key(OTHER_KEY)).unwrap());
        }

        #[test]
        fn test_malformed_pin_is_error() {
            let policy = HostKeyPolicy::Pinned("not-a-key".to_string());
            let err = policy.verify("east", 22, &key(CLUSTER_KEY)).unwrap_err();
            assert!(matches!(err, Error::HostKey { .. }));
        }
    }

    mod known_hosts {
        use super::*;

        fn known_hosts_file(contents: &str) -> PathBuf {
            let path = std::env::temp_dir()
                .join(format!("relay-client-known-hosts-{}", uuid::Uuid::new_v4()));
            std::fs::write(&path, contents).unwrap();
            path
        }

        #[test]
        fn test_cluster_entry_is_found_by_name() {
            let path = known_hosts_file(&format!("east ssh-ed25519 {}\n", CLUSTER_KEY));
            let policy = HostKeyPolicy::KnownHosts(path.clone());

            let accepted = policy.verify("east", 22, &key(CLUSTER_KEY));
            let unknown = policy.verify("west", 22, &key(CLUSTER_KEY));
            std::fs::remove_file(&path).unwrap();

            assert!(accepted.unwrap());
            assert!(!unknown.unwrap());
        }

        #[test]
        fn test_changed_key_is_error() {
            let path = known_hosts_file(&format!("east ssh-ed25519 {}\n", CLUSTER_KEY));
            let policy = HostKeyPolicy::KnownHosts(path.clone());

            let result = policy.verify("east", 22, &key(OTHER_KEY));
            std::fs::remove_file(&path).unwrap();

            assert!(matches!(result, Err(Error::HostKey { .. })));
        }
    }
}
