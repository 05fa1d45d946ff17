//! Identifiers and records shared across the gateway: tablet aliases, routing
//! targets and health samples.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use thiserror::Error;

/// The role a tablet serves within its shard.
///
/// Writes go to [`TabletRole::Primary`]; replicas serve reads with lag;
/// read-only tablets serve offline/analytical reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TabletRole {
    /// The single writable tablet of a shard.
    Primary,
    /// A read replica applying the primary's changes with some lag.
    Replica,
    /// A replica dedicated to offline / analytical reads.
    ReadOnly,
}

impl TabletRole {
    /// All roles, in routing-priority order.
    pub fn all() -> [Self; 3] {
        [Self::Primary, Self::Replica, Self::ReadOnly]
    }

    /// The canonical lower-case name of this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
            Self::ReadOnly => "rdonly",
        }
    }
}

impl fmt::Display for TabletRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error returned when parsing an unknown [`TabletRole`] name.
#[derive(Debug, Error)]
#[error("invalid tablet role {0:?}")]
pub struct TabletRoleError(String);

impl FromStr for TabletRole {
    type Err = TabletRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "replica" => Ok(Self::Replica),
            "rdonly" | "readonly" => Ok(Self::ReadOnly),
            _ => Err(TabletRoleError(s.to_string())),
        }
    }
}

/// The globally unique identity of a tablet: the cell it lives in plus a
/// cell-scoped numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabletAlias {
    /// The failure domain (typically a datacenter) containing the tablet.
    pub cell: String,
    /// The unique id of the tablet within its cell.
    pub uid: u32,
}

impl TabletAlias {
    /// Construct an alias from its parts.
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.cell, self.uid)
    }
}

/// The routing key of a query: which keyspace/shard must serve it, and in
/// which role.
///
/// Immutable for the lifetime of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    /// The logical database.
    pub keyspace: String,
    /// The key-range of the keyspace.
    pub shard: String,
    /// The tablet role required to serve the query.
    pub tablet_type: TabletRole,
}

impl Target {
    /// Construct a target from its parts.
    pub fn new(
        keyspace: impl Into<String>,
        shard: impl Into<String>,
        tablet_type: TabletRole,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
            tablet_type,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.keyspace, self.shard, self.tablet_type)
    }
}

/// A half-open range of sharding keys, `[start, end)`.
///
/// An empty boundary means unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyRange {
    /// Inclusive lower boundary.
    pub start: Vec<u8>,
    /// Exclusive upper boundary.
    pub end: Vec<u8>,
}

/// A tablet as described by the topology server.
///
/// Mutated only by the topology watcher; everything downstream receives
/// owned copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletRecord {
    /// The tablet identity.
    pub alias: TabletAlias,
    /// The host the tablet's query service listens on.
    pub hostname: String,
    /// The port the tablet's query service listens on.
    pub port: u16,
    /// The keyspace the tablet is assigned to.
    pub keyspace: String,
    /// The shard the tablet is assigned to.
    pub shard: String,
    /// The role declared in the topology record. May lag behind the role the
    /// tablet itself reports during a failover.
    pub tablet_type: TabletRole,
    /// The key-range served, if the shard is range-based.
    pub key_range: Option<KeyRange>,
}

impl TabletRecord {
    /// The target this record is assigned to, per the topology server.
    pub fn target(&self) -> Target {
        Target::new(&*self.keyspace, &*self.shard, self.tablet_type)
    }

    /// The `host:port` address of the tablet's query service.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// The most recent health sample for one tablet.
///
/// `target` is the target the tablet itself declares over its health stream,
/// which wins over the topology record during reparents.
#[derive(Debug, Clone, PartialEq)]
pub struct TabletHealth {
    /// The keyspace/shard/role the tablet declares itself to be serving.
    pub target: Target,
    /// Whether the tablet reports itself willing to accept queries.
    pub serving: bool,
    /// Whether a health subscription is open to the tablet. `false` once the
    /// stream has terminated and a reconnect has not yet produced a message.
    pub up: bool,
    /// Self-reported replication lag. Zero for primaries.
    pub replication_lag: Duration,
    /// The most recent error reported by the tablet or observed on its
    /// stream.
    pub last_error: Option<String>,
    /// When this sample was taken.
    pub last_update: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in TabletRole::all() {
            assert_eq!(role.as_str().parse::<TabletRole>().unwrap(), role);
        }
        assert_eq!("READONLY".parse::<TabletRole>().unwrap(), TabletRole::ReadOnly);
        assert!("leader".parse::<TabletRole>().is_err());
    }

    #[test]
    fn test_display() {
        let alias = TabletAlias::new("zone1", 101);
        assert_eq!(alias.to_string(), "zone1-101");

        let target = Target::new("commerce", "-80", TabletRole::Replica);
        assert_eq!(target.to_string(), "commerce/-80/replica");
    }

    #[test]
    fn test_record_target_and_addr() {
        let rec = TabletRecord {
            alias: TabletAlias::new("zone1", 101),
            hostname: "db-101.zone1".to_string(),
            port: 15991,
            keyspace: "commerce".to_string(),
            shard: "0".to_string(),
            tablet_type: TabletRole::Primary,
            key_range: None,
        };

        assert_eq!(rec.target(), Target::new("commerce", "0", TabletRole::Primary));
        assert_eq!(rec.addr(), "db-101.zone1:15991");
    }
}
