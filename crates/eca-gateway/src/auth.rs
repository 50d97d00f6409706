//! Authentication of newly connected ECAs.
//!
//! An ECA proves nothing beyond the identifier it claims in a handshake
//! header:
//! 1. Read the claimed-identifier header
//! 2. Parse it as a [`NodeId`]; a missing or malformed value ends here
//! 3. Look the node up in the [`IdentityStore`] under a deadline
//! 4. Classify the result, then apply the [`AdmissionPolicy`]

use crate::store::{IdentityStore, NodeRecord};
use eca_core::{EcaError, EcaResult, NodeId};
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tracing::{debug, info, warn};

/// What the handshake told us about the peer.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Header missing or not a valid identifier. No lookup was made.
    Malformed(String),
    Resolved(NodeRecord),
    /// Well-formed identifier with no matching record.
    Unresolved(NodeId),
    /// The lookup itself failed or timed out.
    StoreFailure(EcaError),
}

/// Which outcomes are allowed into the `Open` state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionPolicy {
    /// Identity is looked up and logged, but unknown nodes are still admitted.
    #[default]
    Advisory,
    /// Only nodes present in the registry are admitted.
    RequireResolved,
    /// Only registered nodes with `authorized: true` are admitted.
    RequireAuthorized,
}

impl std::str::FromStr for AdmissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "advisory" => Ok(Self::Advisory),
            "require-resolved" => Ok(Self::RequireResolved),
            "require-authorized" => Ok(Self::RequireAuthorized),
            other => Err(format!(
                "unknown admission policy {other:?} (expected advisory, require-resolved or require-authorized)"
            )),
        }
    }
}

/// Resolve the identity claimed in `header` of the upgrade request.
pub async fn authenticate(
    headers: &HeaderMap,
    header: &str,
    store: &dyn IdentityStore,
    lookup_timeout: Duration,
) -> AuthOutcome {
    let claimed = match headers.get(header).map(|v| v.to_str()) {
        Some(Ok(value)) => value,
        Some(Err(_)) => {
            warn!(header, "invalid ECA ObjectId (non-ASCII header), breaking connection");
            return AuthOutcome::Malformed(format!("{header} is not valid ASCII"));
        }
        None => {
            warn!(header, "missing ECA auth header, breaking connection");
            return AuthOutcome::Malformed(format!("missing {header} header"));
        }
    };

    let id = match NodeId::parse_hex(claimed.trim()) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "invalid ECA ObjectId, breaking connection");
            return AuthOutcome::Malformed(e.to_string());
        }
    };

    info!(node = %id, "finding ECA");

    match tokio::time::timeout(lookup_timeout, store.lookup(&id)).await {
        Ok(Ok(Some(record))) => {
            debug!(node = %id, document = %record.document, "found ECA");
            AuthOutcome::Resolved(record)
        }
        Ok(Ok(None)) => {
            warn!(node = %id, "unable to find ECA");
            AuthOutcome::Unresolved(id)
        }
        Ok(Err(e)) => {
            warn!(node = %id, error = %e, "ECA lookup failed");
            AuthOutcome::StoreFailure(e)
        }
        Err(_) => {
            warn!(node = %id, timeout_ms = lookup_timeout.as_millis() as u64, "ECA lookup timed out");
            AuthOutcome::StoreFailure(EcaError::Timeout)
        }
    }
}

/// Decide whether an outcome may enter the `Open` state.
///
/// Returns the resolved record (if any) on admission, or the reason for
/// rejecting this one connection.
pub fn admit(outcome: AuthOutcome, policy: AdmissionPolicy) -> EcaResult<Option<NodeRecord>> {
    match outcome {
        AuthOutcome::Malformed(reason) => Err(EcaError::MalformedCredential(reason)),
        AuthOutcome::StoreFailure(e) => Err(e),
        AuthOutcome::Unresolved(id) => match policy {
            AdmissionPolicy::Advisory => Ok(None),
            _ => Err(EcaError::IdentityNotFound(id.to_string())),
        },
        AuthOutcome::Resolved(record) => {
            if policy == AdmissionPolicy::RequireAuthorized && !record.authorized {
                return Err(EcaError::NotAuthorized(record.id.to_string()));
            }
            Ok(Some(record))
        }
    }
}
