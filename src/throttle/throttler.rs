//! FIFO-fair per-tag admission queue for read-version requests on a GRV
//! proxy: each tag is rate-limited independently, while releases preserve
//! global arrival order across tags.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use crate::sequencer::{
    GetReadVersionRequest, TransactionPriority, TransactionTag,
};
use crate::throttle::rateinfo::{ConfigThrottle, GrvTransactionRateInfo};
use crate::utils::Clock;

/// One queued read-version request.
#[derive(Debug)]
struct DelayedRequest {
    /// The queued request.
    req: GetReadVersionRequest,

    /// Time the request entered the throttler.
    start_time: f64,

    /// Globally monotone arrival sequence number.
    sequence_number: u64,
}

/// Per-tag admission queue.
#[derive(Debug)]
struct TagQueue {
    /// Rate state; `None` means the tag is currently unlimited.
    rate_info: Option<GrvTransactionRateInfo>,

    /// Queued requests in arrival order.
    requests: VecDeque<DelayedRequest>,
}

impl TagQueue {
    fn new() -> Self {
        TagQueue {
            rate_info: None,
            requests: VecDeque::new(),
        }
    }

    fn set_rate(&mut self, config: &ConfigThrottle, clock: Clock, rate: f64) {
        match &mut self.rate_info {
            Some(info) => info.set_rate(rate),
            None => {
                self.rate_info =
                    Some(GrvTransactionRateInfo::new(config, clock, rate));
            }
        }
    }
}

/// Transaction-tag throttler of one GRV proxy.
///
/// Requests enter tagged queues and leave, in strictly increasing global
/// sequence order, into the batch- or default-priority output deque as
/// per-tag budgets allow. Immediate-priority requests bypass throttling
/// entirely and must never reach the queues.
#[derive(Debug)]
pub struct TagThrottler {
    /// Configuration parameters struct.
    config: ConfigThrottle,

    /// Network clock.
    clock: Clock,

    /// Map from transaction tag -> its queue.
    queues: HashMap<TransactionTag, TagQueue>,

    /// Next arrival sequence number.
    next_sequence_number: u64,
}

impl TagThrottler {
    /// Creates a new, empty throttler.
    pub fn new(config: ConfigThrottle, clock: Clock) -> Self {
        TagThrottler {
            config,
            clock,
            queues: HashMap::new(),
            next_sequence_number: 0,
        }
    }

    /// Installs new per-tag rates. Tags absent from `new_rates` become
    /// unlimited, and queues that are both empty and unlimited are
    /// garbage-collected.
    pub fn update_rates(&mut self, new_rates: &HashMap<TransactionTag, f64>) {
        for (tag, rate) in new_rates {
            match self.queues.get_mut(tag) {
                Some(queue) => {
                    queue.set_rate(&self.config, self.clock, *rate)
                }
                None => {
                    let mut queue = TagQueue::new();
                    queue.set_rate(&self.config, self.clock, *rate);
                    self.queues.insert(tag.clone(), queue);
                }
            }
        }

        // clean up tags that did not appear in new_rates
        for (tag, queue) in self.queues.iter_mut() {
            if !new_rates.contains_key(tag) {
                queue.rate_info = None;
            }
        }
        self.queues
            .retain(|_, queue| {
                !queue.requests.is_empty() || queue.rate_info.is_some()
            });
    }

    /// Enqueues a tagged read-version request under its first tag. Multiple
    /// tags on one request are tolerated but only the first is throttled.
    pub fn add_request(&mut self, req: GetReadVersionRequest) {
        assert!(req.is_tagged());
        let tag = req.tags.keys().next().cloned().unwrap();
        if req.tags.len() > 1 {
            pf_warn!(
                "read-version request carries {} tags; throttling by the \
                 first only",
                req.tags.len()
            );
        }

        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        self.queues
            .entry(tag)
            .or_insert_with(TagQueue::new)
            .requests
            .push_back(DelayedRequest {
                req,
                start_time: self.clock.now(),
                sequence_number,
            });
    }

    /// Releases as many queued requests as per-tag budgets allow, in global
    /// FIFO order across tags, into the output deque matching each
    /// request's priority. `elapsed` is the time since the previous call.
    pub fn release_transactions(
        &mut self,
        elapsed: f64,
        out_batch_priority: &mut VecDeque<GetReadVersionRequest>,
        out_default_priority: &mut VecDeque<GetReadVersionRequest>,
    ) {
        let now = self.clock.now();

        // track transactions released for each tag
        let mut released_counts: HashMap<TransactionTag, i64> =
            HashMap::with_capacity(self.queues.len());

        // min-heap of tag heads keyed by front sequence number
        let mut heads: BinaryHeap<Reverse<(u64, TransactionTag)>> =
            BinaryHeap::new();
        for (tag, queue) in self.queues.iter_mut() {
            if let Some(info) = &mut queue.rate_info {
                info.start_release_window();
            }
            if let Some(front) = queue.requests.front() {
                heads.push(Reverse((front.sequence_number, tag.clone())));
                released_counts.insert(tag.clone(), 0);
            }
        }

        while let Some(Reverse((mut next_seq, tag))) = heads.pop() {
            // sequence at which it is time to switch to another tag
            let next_queue_seq = heads
                .peek()
                .map(|Reverse((seq, _))| *seq)
                .unwrap_or(u64::MAX);

            let queue = self.queues.get_mut(&tag).unwrap();
            let released = released_counts.get_mut(&tag).unwrap();

            while let Some(front) = queue.requests.front() {
                let count = *front.req.tags.values().next().unwrap();
                debug_assert_eq!(next_seq, front.sequence_number);

                if let Some(info) = &queue.rate_info {
                    if !info.can_start(*released, count) {
                        // cannot release any more transactions from this
                        // tag; it stays out of the heap until next call
                        break;
                    }
                }

                if next_seq < next_queue_seq {
                    *released += count;
                    let mut delayed = queue.requests.pop_front().unwrap();
                    delayed.req.proxy_tag_throttled_duration =
                        now - delayed.start_time;
                    match delayed.req.priority {
                        TransactionPriority::Batch => {
                            out_batch_priority.push_back(delayed.req)
                        }
                        TransactionPriority::Default => {
                            out_default_priority.push_back(delayed.req)
                        }
                        TransactionPriority::Immediate => {
                            // immediate priority bypasses tag throttling
                            // and must never be queued here
                            unreachable!(
                                "immediate-priority request in tag throttler"
                            );
                        }
                    }
                    match queue.requests.front() {
                        Some(front) => next_seq = front.sequence_number,
                        None => break,
                    }
                } else {
                    // an older request waits on another tag; put this tag
                    // back and serve the older one first
                    heads.push(Reverse((next_seq, tag.clone())));
                    break;
                }
            }
        }

        // end release windows for queues with live rate state
        for (tag, queue) in self.queues.iter_mut() {
            if let Some(info) = &mut queue.rate_info {
                let released =
                    released_counts.get(tag).copied().unwrap_or(0);
                info.end_release_window(released, false, elapsed);
            }
        }
    }

    /// Number of live tag queues.
    pub fn size(&self) -> usize {
        self.queues.len()
    }
}
