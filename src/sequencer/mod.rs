//! Master-side version coordination modules.

mod coordinator;
mod messages;
mod resolution;

pub use coordinator::{ConfigSequencer, SequencerStats, VersionCoordinator};
pub use messages::{
    GetCommitVersionReply, GetCommitVersionRequest, GetRawCommittedVersionReply,
    GetRawCommittedVersionRequest, GetReadVersionReply, GetReadVersionRequest,
    LifetimeToken, ProxyId, ReportRawCommittedVersionRequest, RequestNum,
    ResolverChange, ResolverId, StorageTag, TransactionPriority,
    TransactionTag, UpdateRecoveryDataRequest, Version, INVALID_VERSION,
};
pub use resolution::ResolutionBalancer;
