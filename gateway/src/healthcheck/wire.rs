//! Wire messages of the per-tablet query service.
//!
//! These mirror the tablet service protobuf definitions; the structs are
//! hand-maintained `prost` derives so the crate builds without a protobuf
//! toolchain.

use crate::types;

/// The tablet role on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TabletType {
    /// Unset.
    Unknown = 0,
    /// The writable primary of a shard.
    Primary = 1,
    /// A read replica.
    Replica = 2,
    /// An offline/analytics replica.
    Rdonly = 3,
}

impl From<types::TabletRole> for TabletType {
    fn from(role: types::TabletRole) -> Self {
        match role {
            types::TabletRole::Primary => Self::Primary,
            types::TabletRole::Replica => Self::Replica,
            types::TabletRole::ReadOnly => Self::Rdonly,
        }
    }
}

impl TabletType {
    /// Map the wire role onto the in-process role, if set.
    pub fn role(&self) -> Option<types::TabletRole> {
        match self {
            Self::Unknown => None,
            Self::Primary => Some(types::TabletRole::Primary),
            Self::Replica => Some(types::TabletRole::Replica),
            Self::Rdonly => Some(types::TabletRole::ReadOnly),
        }
    }
}

/// A tablet identity on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TabletAlias {
    /// The cell the tablet lives in.
    #[prost(string, tag = "1")]
    pub cell: ::prost::alloc::string::String,
    /// The cell-scoped tablet id.
    #[prost(uint32, tag = "2")]
    pub uid: u32,
}

impl From<types::TabletAlias> for TabletAlias {
    fn from(alias: types::TabletAlias) -> Self {
        Self {
            cell: alias.cell,
            uid: alias.uid,
        }
    }
}

impl From<TabletAlias> for types::TabletAlias {
    fn from(alias: TabletAlias) -> Self {
        Self {
            cell: alias.cell,
            uid: alias.uid,
        }
    }
}

/// A routing target on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Target {
    /// The keyspace.
    #[prost(string, tag = "1")]
    pub keyspace: ::prost::alloc::string::String,
    /// The shard.
    #[prost(string, tag = "2")]
    pub shard: ::prost::alloc::string::String,
    /// The declared tablet role.
    #[prost(enumeration = "TabletType", tag = "3")]
    pub tablet_type: i32,
}

impl Target {
    /// Map the wire target onto the in-process target, if the role is set.
    pub fn to_target(&self) -> Option<types::Target> {
        let role = TabletType::try_from(self.tablet_type).ok()?.role()?;
        Some(types::Target::new(&*self.keyspace, &*self.shard, role))
    }
}

impl From<types::Target> for Target {
    fn from(target: types::Target) -> Self {
        Self {
            keyspace: target.keyspace,
            shard: target.shard,
            tablet_type: TabletType::from(target.tablet_type) as i32,
        }
    }
}

/// Self-reported load statistics carried by every health stream message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RealtimeStats {
    /// A tablet-side health error, empty when healthy.
    #[prost(string, tag = "1")]
    pub health_error: ::prost::alloc::string::String,
    /// Replication lag behind the primary.
    #[prost(uint32, tag = "2")]
    pub replication_lag_seconds: u32,
    /// CPU utilisation of the tablet host, 0.0 to 1.0.
    #[prost(double, tag = "3")]
    pub cpu_usage: f64,
}

/// The (empty) subscription request opening a health stream.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StreamHealthRequest {}

/// One message of the streaming health RPC.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamHealthResponse {
    /// The keyspace/shard/role the tablet declares itself serving. During a
    /// reparent this leads the topology record.
    #[prost(message, optional, tag = "1")]
    pub target: ::core::option::Option<Target>,
    /// Whether the tablet accepts queries.
    #[prost(bool, tag = "2")]
    pub serving: bool,
    /// Load statistics.
    #[prost(message, optional, tag = "3")]
    pub realtime_stats: ::core::option::Option<RealtimeStats>,
    /// The identity of the reporting tablet.
    #[prost(message, optional, tag = "4")]
    pub tablet_alias: ::core::option::Option<TabletAlias>,
    /// Seconds-since-epoch at which the tablet started its current primary
    /// term; zero for non-primaries.
    #[prost(int64, tag = "5")]
    pub primary_term_start_timestamp: i64,
}

/// A query execution request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteRequest {
    /// The target the planner resolved.
    #[prost(message, optional, tag = "1")]
    pub target: ::core::option::Option<Target>,
    /// The SQL to execute.
    #[prost(string, tag = "2")]
    pub sql: ::prost::alloc::string::String,
    /// The transaction this statement belongs to, zero outside transactions.
    #[prost(int64, tag = "3")]
    pub transaction_id: i64,
    /// The reserved connection to execute on, zero when unreserved.
    #[prost(int64, tag = "4")]
    pub reserved_id: i64,
}

/// A single result column.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Field {
    /// The column name.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// The MySQL type name of the column.
    #[prost(string, tag = "2")]
    pub mysql_type: ::prost::alloc::string::String,
}

/// A single result row, one value per field.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Row {
    /// The raw column values.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub values: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

/// The result of a query execution.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryResult {
    /// The result schema.
    #[prost(message, repeated, tag = "1")]
    pub fields: ::prost::alloc::vec::Vec<Field>,
    /// Rows changed by a DML statement.
    #[prost(uint64, tag = "2")]
    pub rows_affected: u64,
    /// The auto-increment id generated by an insert, if any.
    #[prost(uint64, tag = "3")]
    pub insert_id: u64,
    /// The result rows.
    #[prost(message, repeated, tag = "4")]
    pub rows: ::prost::alloc::vec::Vec<Row>,
}

/// A transaction-open request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BeginRequest {
    /// The target to open the transaction against.
    #[prost(message, optional, tag = "1")]
    pub target: ::core::option::Option<Target>,
}

/// The transaction-open response.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct BeginResponse {
    /// The id of the opened transaction.
    #[prost(int64, tag = "1")]
    pub transaction_id: i64,
}

/// A transaction-commit request.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CommitRequest {
    /// The transaction to commit.
    #[prost(int64, tag = "1")]
    pub transaction_id: i64,
}

/// The (empty) transaction-commit response.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CommitResponse {}

/// A combined reserve-connection + execute request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReserveExecuteRequest {
    /// The execution to perform on the freshly reserved connection.
    #[prost(message, optional, tag = "1")]
    pub request: ::core::option::Option<ExecuteRequest>,
}

/// The reserve-connection + execute response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReserveExecuteResponse {
    /// The id of the reserved connection, for follow-up statements.
    #[prost(int64, tag = "1")]
    pub reserved_id: i64,
    /// The execution result.
    #[prost(message, optional, tag = "2")]
    pub result: ::core::option::Option<QueryResult>,
}
