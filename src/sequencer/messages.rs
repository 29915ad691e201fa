//! Message types served by the version-coordination core.

use std::collections::BTreeMap;

use crate::utils::Promise;

use serde::{Deserialize, Serialize};

/// Commit version type. Use `INVALID_VERSION` as the null value.
pub type Version = i64;

/// Null version value, before a generation has recovered.
pub const INVALID_VERSION: Version = -1;

/// Commit proxy identity type.
pub type ProxyId = u64;

/// Resolver identity type.
pub type ResolverId = u64;

/// Storage-server tag type, for the minimal version-vector bookkeeping.
pub type StorageTag = u16;

/// Per-proxy commit-version request sequence number type.
pub type RequestNum = u64;

/// Transaction tag type: a short opaque byte string attached to a
/// transaction for rate-limiting purposes.
pub type TransactionTag = Vec<u8>;

/// Identity of one recruitment generation of the coordinator. Version
/// state is valid only within one generation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub struct LifetimeToken {
    /// Controller that performed the recruitment.
    pub controller: u64,

    /// Recruitment count under that controller.
    pub count: u64,
}

/// One staged resolver key-range movement, piggybacked on commit-version
/// replies so commit proxies learn of resolver reassignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverChange {
    /// Index of the destination resolver.
    pub dest: usize,

    /// Beginning key of the moved range.
    pub begin: Vec<u8>,
}

/// Asks the coordinator for the next commit version.
#[derive(Debug)]
pub struct GetCommitVersionRequest {
    /// Identity of the requesting commit proxy.
    pub requesting_proxy: ProxyId,

    /// Per-proxy FIFO sequence number of this request.
    pub request_num: RequestNum,

    /// Highest request number fully processed by the proxy; cached replies
    /// at or below it may be evicted.
    pub most_recent_processed_request_num: RequestNum,

    /// Reply channel.
    pub reply: Promise<GetCommitVersionReply>,
}

/// Reply carrying a freshly allocated (or replayed) commit version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCommitVersionReply {
    /// Staged resolver movements as of this version.
    pub resolver_changes: Vec<ResolverChange>,

    /// Version the staged movements were created at.
    pub resolver_changes_version: Version,

    /// The allocated commit version.
    pub version: Version,

    /// The previously allocated version (`last_epoch_end` for the first in
    /// a generation).
    pub prev_version: Version,

    /// Echo of the request's sequence number.
    pub request_num: RequestNum,
}

/// Reports a raw committed version observed by a commit proxy.
#[derive(Debug)]
pub struct ReportRawCommittedVersionRequest {
    /// The committed version being reported.
    pub version: Version,

    /// The version committed immediately before `version`, if the proxy
    /// tracks causal order (version-vector mode).
    pub prev_version: Option<Version>,

    /// Lower bound on versions known committed across the cluster.
    pub min_known_committed_version: Version,

    /// Whether the database was locked as of `version`.
    pub locked: bool,

    /// Metadata version mutated at or before `version`.
    pub metadata_version: Option<Vec<u8>>,

    /// Storage tags written at `version` (version-vector mode).
    pub written_tags: Option<Vec<StorageTag>>,

    /// Reply channel (acknowledgement only).
    pub reply: Promise<()>,
}

/// Asks for the largest live committed version.
#[derive(Debug)]
pub struct GetRawCommittedVersionRequest {
    /// Optional debugging identifier to thread through trace logs.
    pub debug_id: Option<u64>,

    /// Highest version the requester already knows per-tag state for;
    /// only newer version-vector entries are returned.
    pub max_version: Version,

    /// Reply channel.
    pub reply: Promise<GetRawCommittedVersionReply>,
}

/// Reply carrying the live committed version and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRawCommittedVersionReply {
    /// The live committed version.
    pub version: Version,

    /// Whether the database is locked.
    pub locked: bool,

    /// Latest metadata version.
    pub metadata_version: Option<Vec<u8>>,

    /// Lower bound on versions known committed across the cluster.
    pub min_known_committed_version: Version,

    /// Version-vector entries above the request's `max_version`.
    pub ss_version_vector_delta: Vec<(StorageTag, Version)>,
}

/// Installs a new generation's recovery data into the coordinator.
#[derive(Debug)]
pub struct UpdateRecoveryDataRequest {
    /// First version of the new epoch.
    pub recovery_transaction_version: Version,

    /// Last version of the old epoch not rolled back.
    pub last_epoch_end: Version,

    /// Commit proxies registered for this generation; empty means keep the
    /// current registration.
    pub commit_proxies: Vec<ProxyId>,

    /// Resolvers registered for this generation.
    pub resolvers: Vec<ResolverId>,

    /// Reference epoch pinning versions to wall-clock time.
    pub version_epoch: Option<i64>,

    /// Locality of the primary datacenter.
    pub primary_locality: i8,

    /// Reply channel (acknowledgement only).
    pub reply: Promise<()>,
}

/// Priority of a read-version request. Immediate-priority requests bypass
/// tag throttling entirely.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub enum TransactionPriority {
    Batch,
    #[default]
    Default,
    Immediate,
}

/// Asks a GRV proxy for a read version, possibly tagged for throttling.
#[derive(Debug)]
pub struct GetReadVersionRequest {
    /// Request priority.
    pub priority: TransactionPriority,

    /// Map from transaction tag -> number of transactions in this request.
    /// Tag throttling uses the first tag only.
    pub tags: BTreeMap<TransactionTag, i64>,

    /// Time this request spent delayed by tag throttling, in secs.
    pub proxy_tag_throttled_duration: f64,

    /// Reply channel.
    pub reply: Promise<GetReadVersionReply>,
}

impl GetReadVersionRequest {
    /// Whether the request carries any tags at all.
    pub fn is_tagged(&self) -> bool {
        !self.tags.is_empty()
    }
}

/// Reply carrying a read version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetReadVersionReply {
    /// The read version.
    pub version: Version,

    /// Whether the database is locked.
    pub locked: bool,

    /// Latest metadata version.
    pub metadata_version: Option<Vec<u8>>,
}
