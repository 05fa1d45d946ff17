//! Error types surfaced on the query path.

use thiserror::Error;
use tonic::{Code, Status};

use crate::buffer::BufferError;
use crate::topo::TopoError;
use crate::types::{TabletAlias, TabletRole, Target};

/// The outcome of a gateway action, carrying the caller's retryability
/// verdict.
///
/// The retry loop never interprets the status itself: whether an error is
/// worth another tablet is decided by the closure that observed it (which
/// knows, for example, that in-transaction errors must never be retried).
#[derive(Debug, Error)]
#[error("{status}")]
pub struct ActionError {
    /// `true` if the loop may retry the request on another tablet.
    pub retryable: bool,
    /// The underlying RPC status.
    pub status: Status,
}

impl ActionError {
    /// An error the loop may retry on a different tablet.
    pub fn retryable(status: Status) -> Self {
        Self {
            retryable: true,
            status,
        }
    }

    /// A terminal error, returned to the caller as-is (wrapped with target
    /// metadata).
    pub fn terminal(status: Status) -> Self {
        Self {
            retryable: false,
            status,
        }
    }
}

/// Errors returned by [`TabletGateway`](crate::gateway::TabletGateway)
/// operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The requested role is excluded by the `allowed_tablet_types`
    /// configuration. No tablet was contacted.
    #[error("tablet type {requested} is not in the allowed tablet types {allowed:?}")]
    TabletTypeNotAllowed {
        /// The role the caller asked for.
        requested: TabletRole,
        /// The configured allow-list.
        allowed: Vec<TabletRole>,
    },

    /// The healthy-tablet index holds no tablet for the target. Never retried
    /// internally.
    #[error("no healthy tablet available for '{target}'")]
    NoHealthyTablet {
        /// The target that could not be served.
        target: Target,
    },

    /// Every healthy tablet was already tried (and failed) for this request.
    #[error("no available connection")]
    NoConnection,

    /// A tablet was selected but no live subscription (and therefore no RPC
    /// client) exists for it.
    #[error("no connection for tablet {alias}")]
    TabletUnreachable {
        /// The tablet that could not be reached.
        alias: TabletAlias,
    },

    /// The caller's action failed.
    #[error(transparent)]
    Action(#[from] ActionError),

    /// Buffering a failed primary request was refused; the request must not
    /// be retried.
    #[error("failed to buffer and retry failed request during failover: {source} (original error: {original:?})")]
    Buffer {
        /// Why admission was refused.
        source: BufferError,
        /// The error that sent the request to the buffer, if any.
        original: Option<Box<GatewayError>>,
    },

    /// The topology server could not be queried.
    #[error(transparent)]
    Topo(#[from] TopoError),

    /// A query-path error, wrapped with the target it occurred under so
    /// upstream layers may decide whether to re-resolve.
    #[error("target: {keyspace}/{shard}/{tablet_type}: {source}")]
    Shard {
        /// The keyspace of the failed target.
        keyspace: String,
        /// The shard of the failed target.
        shard: String,
        /// The role of the failed target.
        tablet_type: TabletRole,
        /// The underlying failure.
        #[source]
        source: Box<GatewayError>,
    },
}

impl GatewayError {
    /// Wrap `self` with the target it occurred under.
    pub(crate) fn wrap_with_target(self, target: &Target) -> Self {
        Self::Shard {
            keyspace: target.keyspace.clone(),
            shard: target.shard.clone(),
            tablet_type: target.tablet_type,
            source: Box::new(self),
        }
    }

    /// The canonical RPC code of this error.
    pub fn code(&self) -> Code {
        match self {
            Self::TabletTypeNotAllowed { .. } => Code::FailedPrecondition,
            Self::NoHealthyTablet { .. }
            | Self::NoConnection
            | Self::TabletUnreachable { .. } => Code::Unavailable,
            Self::Action(e) => e.status.code(),
            Self::Buffer { source, .. } => match source {
                BufferError::Full { .. } => Code::ResourceExhausted,
                BufferError::Shutdown => Code::Unavailable,
            },
            Self::Topo(_) => Code::Unavailable,
            Self::Shard { source, .. } => source.code(),
        }
    }

    /// `true` if this error is the kind produced by a shard losing its
    /// primary, and a failed primary request should therefore consult the
    /// failover buffer before its next retry.
    pub(crate) fn is_failover_signal(&self) -> bool {
        match self {
            Self::Action(e) => {
                let message = e.status.message();
                matches!(
                    e.status.code(),
                    Code::FailedPrecondition | Code::Unavailable
                ) && (message.contains("not serving")
                    || message.contains("no primary")
                    || message.contains("primary is not serving"))
            }
            Self::Shard { source, .. } => source.is_failover_signal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        let target = Target::new("ks", "0", TabletRole::Replica);

        let err = GatewayError::NoHealthyTablet {
            target: target.clone(),
        };
        assert_eq!(err.code(), Code::Unavailable);

        let wrapped = err.wrap_with_target(&target);
        assert_eq!(wrapped.code(), Code::Unavailable);
        assert!(wrapped.to_string().starts_with("target: ks/0/replica"));

        let err = GatewayError::TabletTypeNotAllowed {
            requested: TabletRole::Primary,
            allowed: vec![TabletRole::Replica],
        };
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[test]
    fn test_failover_signal_detection() {
        let target = Target::new("ks", "0", TabletRole::Primary);

        let failover: GatewayError =
            ActionError::retryable(Status::unavailable("operation not allowed: primary is not serving")).into();
        assert!(failover.is_failover_signal());
        // Wrapping preserves the classification.
        assert!(failover.wrap_with_target(&target).is_failover_signal());

        let plain: GatewayError =
            ActionError::retryable(Status::unavailable("connection refused")).into();
        assert!(!plain.is_failover_signal());

        let precondition: GatewayError =
            ActionError::terminal(Status::failed_precondition("no primary available for ks/0")).into();
        assert!(precondition.is_failover_signal());

        assert!(!GatewayError::NoConnection.is_failover_signal());
    }
}
