//! Public interface to the Estuary core coordination library: client-side
//! load-balanced RPC dispatch, master-side version coordination, and
//! GRV-proxy transaction-tag throttling for a distributed, strictly
//! serializable key-value database server.

#[macro_use]
mod utils;

mod rpc;
mod sequencer;
mod throttle;

pub use utils::{
    promise_pair, Clock, EstuaryError, Promise, PromiseHandle, Smoother,
};

pub use rpc::{
    basic_load_balance, load_balance, Alternatives, BasicLoadBalancedReply,
    ConfigLoadBalance, ConfigQueueModel, Endpoint, EndpointToken,
    FailureMonitor, FailureStatus, LoadBalancedReply, MeasurementSample,
    QueueModel, Reply, Request, RequestStream, RpcContext, TaskPriority,
};

pub use sequencer::{
    ConfigSequencer, GetCommitVersionReply, GetCommitVersionRequest,
    GetRawCommittedVersionReply, GetRawCommittedVersionRequest,
    GetReadVersionReply, GetReadVersionRequest, LifetimeToken, ProxyId,
    ReportRawCommittedVersionRequest, RequestNum, ResolutionBalancer,
    ResolverChange, ResolverId, SequencerStats, StorageTag,
    TransactionPriority, TransactionTag, UpdateRecoveryDataRequest, Version,
    VersionCoordinator, INVALID_VERSION,
};

pub use throttle::{ConfigThrottle, TagThrottler};
