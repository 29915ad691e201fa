//! Endpoint identity, alternatives sets, and the typed request-stream seam
//! that the load balancer dispatches through.

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use crate::utils::EstuaryError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

/// Stable 64-bit endpoint token type. The transport reissues tokens when a
/// process restarts, so a token uniquely names one incarnation of an
/// endpoint; cached tokens of a dead incarnation simply stay failed.
pub type EndpointToken = u64;

/// Opaque routable identifier of one RPC endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Endpoint {
    /// Network address of the hosting process.
    pub addr: SocketAddr,

    /// Stable token; equality and hashing use only this.
    pub token: EndpointToken,
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

/// Priority tag stamped onto a request so that the server can schedule its
/// reply accordingly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub enum TaskPriority {
    Low,
    #[default]
    Default,
    High,
}

/// Header fields shared by replies that participate in queue-model load
/// balancing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancedReply {
    /// Server-declared self-penalty; 1.0 means unpenalized. Values above
    /// 1.001 make the endpoint count as bad during placement.
    pub penalty: f64,

    /// Server-side failure delivered in-band with the reply.
    pub error: Option<EstuaryError>,
}

impl Default for LoadBalancedReply {
    fn default() -> Self {
        LoadBalancedReply {
            penalty: 1.0,
            error: None,
        }
    }
}

/// Header for replies that only report how busy the serving process is;
/// used by `basic_load_balance` placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicLoadBalancedReply {
    /// Busy time of the serving process over its last sampling interval.
    pub process_busy_time: i32,
}

/// A request type dispatchable through the load balancer.
pub trait Request: Clone + Send + 'static {
    /// Matching reply type.
    type Reply: Reply;

    /// Stamps the reply priority onto the request. The default ignores it,
    /// for request types whose server side has a single reply lane.
    fn set_reply_priority(&mut self, _priority: TaskPriority) {}
}

/// Reply-side introspection for the load-balancing headers.
pub trait Reply: Send + 'static {
    /// Returns the queue-model header if this reply type carries one.
    fn load_balanced_reply(&self) -> Option<&LoadBalancedReply> {
        None
    }

    /// Returns the busyness header if this reply type carries one.
    fn basic_load_balanced_reply(&self) -> Option<&BasicLoadBalancedReply> {
        None
    }
}

/// One replica's typed request channel.
#[async_trait]
pub trait RequestStream<R: Request>: Send + Sync + 'static {
    /// The endpoint this stream delivers to.
    fn endpoint(&self) -> Endpoint;

    /// Sends the request and waits for its reply. Transport-level failures
    /// (e.g. `BrokenPromise`, `RequestMaybeDelivered`) come back as errors;
    /// in-band server failures ride inside the reply's header.
    async fn try_get_reply(&self, req: R) -> Result<R::Reply, EstuaryError>;
}

/// Interval after which recent busyness scores are halved.
const RECENT_BUSYNESS_HALF_LIFE: f64 = 10.0;

/// Decayed per-endpoint busyness bookkeeping for `basic_load_balance`.
#[derive(Debug)]
struct RecentBusyness {
    /// Last reported busy time per alternative, decayed over time.
    scores: Vec<f64>,

    /// Time of the last decay pass.
    last_decay: f64,
}

/// An ordered set of interchangeable endpoints for one logical RPC. The
/// prefix of length `count_best` shares the caller's locality (e.g. same
/// datacenter); entries past it are remote and only consulted when too many
/// local options look bad.
#[derive(Debug)]
pub struct Alternatives<S> {
    /// Streams in placement-preference order.
    options: Vec<Arc<S>>,

    /// Length of the local prefix.
    count_best: usize,

    /// Whether this set is authoritative. Non-fresh sets ask the caller to
    /// refresh (via `AllAlternativesFailed`) after sustained total failure.
    always_fresh: bool,

    /// Human-readable description for diagnostics.
    description: String,

    /// Recent busyness scores, shared by concurrent dispatch calls.
    recent: Mutex<RecentBusyness>,
}

impl<S> Alternatives<S> {
    /// Creates a new alternatives set. `count_best` is clamped to the set
    /// size; it must be at least 1 for non-empty sets.
    pub fn new(
        options: Vec<Arc<S>>,
        count_best: usize,
        always_fresh: bool,
        description: impl Into<String>,
    ) -> Self {
        let size = options.len();
        let scores = vec![0.0; size];
        let count_best = if size == 0 {
            0
        } else {
            count_best.clamp(1, size)
        };
        Alternatives {
            options,
            count_best,
            always_fresh,
            description: description.into(),
            recent: Mutex::new(RecentBusyness {
                scores,
                last_decay: 0.0,
            }),
        }
    }

    /// Number of alternatives in the set.
    pub fn len(&self) -> usize {
        self.options.len()
    }

    /// Whether the set holds no alternatives at all.
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Length of the local ("best") prefix.
    pub fn count_best(&self) -> usize {
        self.count_best
    }

    /// Whether the set is authoritative.
    pub fn always_fresh(&self) -> bool {
        self.always_fresh
    }

    /// Description for diagnostics.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The stream at the given index.
    pub fn get(&self, index: usize) -> &Arc<S> {
        &self.options[index]
    }

    /// Records a busyness report from the alternative at `index`.
    pub(crate) fn update_recent(
        &self,
        index: usize,
        process_busy_time: i32,
        now: f64,
    ) {
        let mut recent = self.recent.lock().unwrap();
        Self::decay(&mut recent, now);
        recent.scores[index] = process_busy_time as f64;
    }

    /// Index of the recently least-busy alternative.
    pub(crate) fn get_best(&self, now: f64) -> usize {
        let mut recent = self.recent.lock().unwrap();
        Self::decay(&mut recent, now);
        let mut best = 0;
        for (i, score) in recent.scores.iter().enumerate() {
            if *score < recent.scores[best] {
                best = i;
            }
        }
        best
    }

    /// Halves all scores once per elapsed half-life interval.
    fn decay(recent: &mut RecentBusyness, now: f64) {
        while now - recent.last_decay > RECENT_BUSYNESS_HALF_LIFE {
            for score in recent.scores.iter_mut() {
                *score /= 2.0;
            }
            recent.last_decay += RECENT_BUSYNESS_HALF_LIFE;
        }
    }
}
