//! Discovery of the ntopng interfaces to monitor.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::backoff::{Clock, RetryError};
use crate::client::{FetchError, ResilientFetcher, Transport};

/// Name of ntopng's aggregate pseudo-interface.
///
/// Exporting it would double every `sum()` over interfaces.
pub const VIEW_ALL_INTERFACE: &str = "view:all";

/// Identifier of an ntopng interface (`ifid`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct InterfaceId(pub u32);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Enumeration errors.
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("Failed to fetch interface list: {0}")]
    Fetch(#[from] RetryError<FetchError>),
    #[error("Invalid interface list payload: {0}")]
    Parse(#[from] serde_json::Error),
}

impl EnumerationError {
    /// Whether the failure came from reading a response body.
    pub fn is_body_error(&self) -> bool {
        matches!(
            self,
            EnumerationError::Fetch(RetryError::Aborted(FetchError::Body { .. }))
        )
    }
}

/// What to do when the interface list cannot be obtained at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationPolicy {
    /// Log the failure and run with no interfaces.
    #[default]
    Degrade,
    /// Abort startup.
    FailFast,
}

#[derive(Debug, Deserialize)]
struct InterfacesResponse {
    #[serde(default)]
    rsp: Vec<InterfaceEntry>,
}

#[derive(Debug, Deserialize)]
struct InterfaceEntry {
    ifname: String,
    ifid: InterfaceId,
}

/// Parse an interface list body into ids, in response order, skipping the
/// aggregate interface.
pub fn parse_interfaces(body: &str) -> Result<Vec<InterfaceId>, serde_json::Error> {
    let response: InterfacesResponse = serde_json::from_str(body)?;

    Ok(response
        .rsp
        .into_iter()
        .filter(|entry| {
            let keep = entry.ifname != VIEW_ALL_INTERFACE;
            if !keep {
                debug!(ifid = %entry.ifid, "Skipping aggregate interface");
            }
            keep
        })
        .map(|entry| entry.ifid)
        .collect())
}

/// Query ntopng for the interfaces to monitor.
pub async fn enumerate_interfaces<T: Transport, C: Clock>(
    fetcher: &ResilientFetcher<T, C>,
) -> Result<Vec<InterfaceId>, EnumerationError> {
    let body = fetcher.fetch_interfaces().await?;
    let interfaces = parse_interfaces(&body)?;

    info!(
        count = interfaces.len(),
        interfaces = ?interfaces,
        "Enumerated ntopng interfaces"
    );

    Ok(interfaces)
}
