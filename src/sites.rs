//! Cluster ("site") listing and selection.
//!
//! The relay answers the reserved `proxysites` sub-service with a JSON array
//! describing every cluster it can route to. The listing is read to
//! end-of-stream under a fixed deadline.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Reserved sub-service that lists clusters.
pub const SITES_SUBSYSTEM: &str = "proxysites";

/// One cluster the relay can route to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    #[serde(default, rename = "lastconnected", skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: String,
}

/// Parse the relay's cluster listing.
pub fn parse_sites(raw: &[u8]) -> Result<Vec<Site>> {
    Ok(serde_json::from_slice(raw)?)
}

/// Pick a cluster: the named one, or the first listed when no name is given.
pub fn select_site<'a>(sites: &'a [Site], name: Option<&str>) -> Result<&'a Site> {
    let first = sites
        .first()
        .ok_or_else(|| Error::NotFound("no sites registered".to_string()))?;

    match name {
        None | Some("") => Ok(first),
        Some(name) => sites
            .iter()
            .find(|site| site.name == name)
            .ok_or_else(|| Error::NotFound(format!("site {} not found", name))),
    }
}

/// Ask the relay for its cluster listing.
///
/// Fails with [`Error::Timeout`] when the listing has not completed within
/// `deadline`.
pub async fn fetch_sites(relay: &dyn Transport, deadline: Duration) -> Result<Vec<Site>> {
    let session = relay.open_session().await?;
    let Some(mut stdout) = session.take_stdout() else {
        let _ = session.close();
        return Err(Error::Transport("session output unavailable".to_string()));
    };

    let read_listing = async {
        session.request_subsystem(SITES_SUBSYSTEM).await?;
        let mut raw = Vec::new();
        stdout.read_to_end(&mut raw).await?;
        Ok::<_, Error>(raw)
    };

    let outcome = tokio::time::timeout(deadline, read_listing).await;
    let _ = session.close();

    let raw = outcome.map_err(|_| {
        Error::Timeout(format!("relay did not list sites within {:?}", deadline))
    })??;

    info!("Found sites: {}", String::from_utf8_lossy(&raw));
    parse_sites(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{FakeSession, FakeTransport};

    fn site(name: &str) -> Site {
        Site {
            name: name.to_string(),
            last_connected: None,
            status: "online".to_string(),
        }
    }

    mod selection {
        use super::*;

        #[test]
        fn test_empty_list_is_not_found_without_name() {
            let err = select_site(&[], None).unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
        }

        #[test]
        fn test_empty_list_is_not_found_with_name() {
            let err = select_site(&[], Some("east")).unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
        }

        #[test]
        fn test_no_name_returns_first() {
            let sites = vec![site("east"), site("west")];
            assert_eq!(select_site(&sites, None).unwrap().name, "east");
        }

        #[test]
        fn test_named_site_is_returned() {
            let sites = vec![site("east"), site("west")];
            assert_eq!(select_site(&sites, Some("west")).unwrap().name, "west");
        }

        #[test]
        fn test_missing_name_is_reported() {
            let sites = vec![site("east"), site("west")];
            let err = select_site(&sites, Some("north")).unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
            assert!(err.to_string().contains("north"));
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn test_parses_listing() {
            let raw = br#"[{"name":"east","lastconnected":"2024-05-01T10:00:00Z","status":"online"},{"name":"west"}]"#;
            let sites = parse_sites(raw).unwrap();
            assert_eq!(sites.len(), 2);
            assert_eq!(sites[0].name, "east");
            assert!(sites[0].last_connected.is_some());
            assert_eq!(sites[1].status, "");
        }

        #[test]
        fn test_malformed_listing_is_an_error() {
            assert!(matches!(parse_sites(b"not json"), Err(Error::Json(_))));
        }
    }

    mod fetching {
        use super::*;

        #[tokio::test]
        async fn test_reads_listing_from_subsystem() {
            let session = FakeSession::new().with_stdout(br#"[{"name":"east"}]"#.to_vec());
            let relay = FakeTransport::new().with_session(session.clone());

            let sites = fetch_sites(&relay, Duration::from_secs(1)).await.unwrap();

            assert_eq!(sites, vec![Site {
                name: "east".into(),
                last_connected: None,
                status: String::new(),
            }]);
            assert_eq!(session.subsystems(), vec![SITES_SUBSYSTEM.to_string()]);
        }

        #[tokio::test]
        async fn test_silent_relay_times_out() {
            let session = FakeSession::new().with_open_stdout();
            let relay = FakeTransport::new().with_session(session);

            let err = fetch_sites(&relay, Duration::from_millis(50))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Timeout(_)));
        }

        #[tokio::test]
        async fn test_missing_output_closes_session() {
            let session = FakeSession::new().without_stdout();
            let relay = FakeTransport::new().with_session(session.clone());

            let err = fetch_sites(&relay, Duration::from_secs(1)).await.unwrap_err();

            assert!(matches!(err, Error::Transport(_)));
            assert!(session.is_closed());
        }
    }
}
