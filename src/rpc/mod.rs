//! Client-side load-balanced RPC dispatch modules.

mod balance;
mod endpoint;
mod failmon;
mod model;
mod request;

pub use balance::{
    basic_load_balance, load_balance, ConfigLoadBalance, RpcContext,
};
pub use endpoint::{
    Alternatives, BasicLoadBalancedReply, Endpoint, EndpointToken,
    LoadBalancedReply, Reply, Request, RequestStream, TaskPriority,
};
pub use failmon::{FailureMonitor, FailureStatus};
pub use model::{ConfigQueueModel, MeasurementSample, QueueModel};
