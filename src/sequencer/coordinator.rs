//! Authoritative monotonic version allocation, live-committed tracking, and
//! recovery-data handling for one recruitment generation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::sequencer::messages::{
    GetCommitVersionReply, GetCommitVersionRequest, GetRawCommittedVersionReply,
    GetRawCommittedVersionRequest, LifetimeToken, ProxyId,
    ReportRawCommittedVersionRequest, RequestNum, StorageTag,
    UpdateRecoveryDataRequest, Version, INVALID_VERSION,
};
use crate::sequencer::resolution::ResolutionBalancer;
use crate::utils::{Clock, EstuaryError};

use rand::Rng;

use serde::Deserialize;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSequencer {
    /// Target version-allocation rate, in versions per second.
    pub versions_per_second: f64,

    /// Upper bound on the per-call version step.
    pub max_read_transaction_life_versions: i64,

    /// Cap on version-catchup as a fraction of the nominal step.
    pub max_version_rate_modifier: f64,

    /// Absolute cap on version-catchup.
    pub max_version_rate_offset: i64,

    /// Whether to track per-storage-tag committed versions and order
    /// committed-version reports causally.
    pub enable_version_vector: bool,

    /// Whether to seed a random negative reference version when recovery
    /// data carries none (exercises the full monotonic version range).
    pub randomize_version_epoch: bool,
}

impl Default for ConfigSequencer {
    fn default() -> Self {
        ConfigSequencer {
            versions_per_second: 1e6,
            max_read_transaction_life_versions: 5_000_000,
            max_version_rate_modifier: 0.1,
            max_version_rate_offset: 1_000_000,
            enable_version_vector: false,
            randomize_version_epoch: false,
        }
    }
}

impl ConfigSequencer {
    /// Composes the tunables from defaults plus optional TOML overrides.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, EstuaryError> {
        parsed_config!(config_str => ConfigSequencer;
                       versions_per_second,
                       max_read_transaction_life_versions,
                       max_version_rate_modifier, max_version_rate_offset,
                       enable_version_vector, randomize_version_epoch)
    }
}

/// Request counters kept by the coordinator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequencerStats {
    pub get_commit_version_requests: u64,
    pub get_live_committed_version_requests: u64,
    pub report_live_committed_version_requests: u64,
    pub wait_for_prev_commit_requests: u64,
    pub non_wait_for_prev_commit_requests: u64,
}

/// Per-commit-proxy reply bookkeeping.
#[derive(Debug)]
struct ProxyVersionReplies {
    /// Sequence number of the last fully allocated request; waiters queue
    /// on this to enforce per-proxy FIFO.
    latest_request_num: watch::Sender<RequestNum>,

    /// Cached replies by sequence number, for idempotent replay.
    replies: Mutex<BTreeMap<RequestNum, GetCommitVersionReply>>,
}

impl ProxyVersionReplies {
    fn new() -> Self {
        ProxyVersionReplies {
            latest_request_num: watch::channel(0).0,
            replies: Mutex::new(BTreeMap::new()),
        }
    }
}

/// Minimal per-storage-tag latest-commit-version map.
#[derive(Debug, Default)]
struct VersionVector {
    versions: HashMap<StorageTag, Version>,
    max_version: Version,
}

impl VersionVector {
    fn set_version(&mut self, tags: &[StorageTag], version: Version) {
        for tag in tags {
            self.versions.insert(*tag, version);
        }
        self.max_version = self.max_version.max(version);
    }

    fn delta(&self, max_version: Version) -> Vec<(StorageTag, Version)> {
        let mut delta: Vec<(StorageTag, Version)> = self
            .versions
            .iter()
            .filter(|(_, v)| **v > max_version)
            .map(|(t, v)| (*t, *v))
            .collect();
        delta.sort_unstable();
        delta
    }
}

/// Mutable coordinator state, all touched under one lock with no await
/// points inside.
#[derive(Debug)]
struct SequencerState {
    /// The last version assigned to a proxy.
    version: Version,

    /// Time of the last version assignment.
    last_version_time: f64,

    /// The last version in the old epoch not rolled back in this recovery.
    last_epoch_end: Version,

    /// The first version in this epoch.
    recovery_transaction_version: Version,

    /// Reference epoch pinning versions loosely to wall-clock time.
    reference_version: Option<i64>,

    /// Lower bound on versions known committed across the cluster.
    min_known_committed_version: Version,

    /// Whether the database is locked.
    database_locked: bool,

    /// Latest metadata version reported by commit proxies.
    proxy_metadata_version: Option<Vec<u8>>,

    /// Locality of the primary datacenter.
    locality: i8,

    /// Per-proxy reply caches of the current generation.
    proxies: HashMap<ProxyId, Arc<ProxyVersionReplies>>,

    /// Per-storage-tag committed versions (version-vector mode).
    ss_version_vector: VersionVector,

    /// Resolver placement seam.
    resolution: ResolutionBalancer,

    /// Request counters.
    stats: SequencerStats,
}

/// The master-side version coordinator of one recruitment generation.
///
/// Hands out strictly increasing commit versions (chained through
/// `prev_version`, idempotent per proxy sequence number), tracks the
/// monotone live-committed version, serves raw committed-version reads,
/// and absorbs recovery-data updates.
#[derive(Debug)]
pub struct VersionCoordinator {
    /// Configuration parameters struct.
    config: ConfigSequencer,

    /// Network clock.
    clock: Clock,

    /// Generation this instance was recruited under.
    lifetime: LifetimeToken,

    /// Mutable state.
    state: Mutex<SequencerState>,

    /// The largest live committed version reported by commit proxies;
    /// waiters queue on this for causal ordering.
    live_committed: watch::Sender<Version>,
}

impl VersionCoordinator {
    /// Creates a new, unrecovered coordinator bound to a generation.
    pub fn new(
        config: ConfigSequencer,
        clock: Clock,
        lifetime: LifetimeToken,
    ) -> Self {
        VersionCoordinator {
            config,
            clock,
            lifetime,
            state: Mutex::new(SequencerState {
                version: INVALID_VERSION,
                last_version_time: 0.0,
                last_epoch_end: INVALID_VERSION,
                recovery_transaction_version: INVALID_VERSION,
                reference_version: None,
                min_known_committed_version: 0,
                database_locked: false,
                proxy_metadata_version: None,
                locality: -1,
                proxies: HashMap::new(),
                ss_version_vector: VersionVector::default(),
                resolution: ResolutionBalancer::new(),
                stats: SequencerStats::default(),
            }),
            live_committed: watch::channel(INVALID_VERSION).0,
        }
    }

    /// Generation this coordinator serves.
    pub fn lifetime(&self) -> LifetimeToken {
        self.lifetime
    }

    /// Snapshot of the request counters.
    pub fn stats(&self) -> SequencerStats {
        self.state.lock().unwrap().stats
    }

    /// Allocates (or replays) the commit version for one proxy request.
    ///
    /// Returns `None` when no reply must ever be sent: the proxy is not in
    /// the current generation's registered set, the sequence number is
    /// stale, or it would wrap. Otherwise waits until the proxy's previous
    /// request has been allocated (per-proxy FIFO), then either replays
    /// the cached reply or computes the next version.
    pub async fn get_commit_version(
        &self,
        requesting_proxy: ProxyId,
        request_num: RequestNum,
        most_recent_processed_request_num: RequestNum,
    ) -> Option<GetCommitVersionReply> {
        let entry = {
            let mut state = self.state.lock().unwrap();
            state.stats.get_commit_version_requests += 1;
            state.proxies.get(&requesting_proxy).cloned()
        };
        // request from an unregistered proxy (e.g. a duplicate recruitment)
        let entry = entry?;

        if request_num == RequestNum::MAX {
            // sequence numbers must not wrap within a generation
            pf_warn!(
                "proxy {} exhausted its request sequence space",
                requesting_proxy
            );
            return None;
        }

        // enforce per-proxy FIFO on version allocation
        let wanted = request_num.saturating_sub(1);
        let mut latest_rx = entry.latest_request_num.subscribe();
        if latest_rx.wait_for(|latest| *latest >= wanted).await.is_err() {
            return None;
        }

        let mut replies = entry.replies.lock().unwrap();
        if let Some(cached) = replies.get(&request_num) {
            // duplicate request for an already allocated sequence number
            return Some(cached.clone());
        }

        let latest = *entry.latest_request_num.borrow();
        if request_num <= latest {
            // old request for a previously acknowledged sequence number;
            // the proxy has moved on and will never look at a reply
            debug_assert!(request_num < latest);
            return None;
        }

        let mut rep = GetCommitVersionReply {
            resolver_changes: vec![],
            resolver_changes_version: INVALID_VERSION,
            version: INVALID_VERSION,
            prev_version: INVALID_VERSION,
            request_num,
        };

        {
            let mut state = self.state.lock().unwrap();
            if state.version == INVALID_VERSION {
                state.last_version_time = self.clock.now();
                state.version = state.recovery_transaction_version;
                rep.prev_version = state.last_epoch_end;
            } else {
                let t1 = self.clock.now();
                let to_add = (self.config.versions_per_second
                    * (t1 - state.last_version_time))
                    as i64;
                let to_add = to_add
                    .min(self.config.max_read_transaction_life_versions)
                    .max(1);

                rep.prev_version = state.version;
                state.version = match state.reference_version {
                    Some(reference) => (state.version + 1).max(figure_version(
                        state.version,
                        t1,
                        reference,
                        to_add,
                        self.config.versions_per_second,
                        self.config.max_version_rate_modifier,
                        self.config.max_version_rate_offset,
                    )),
                    None => state.version + to_add,
                };
                state.last_version_time = t1;

                let proxy = requesting_proxy;
                state.resolution.set_changes_in_reply(proxy, &mut rep);
            }
            rep.version = state.version;
        }

        debug_assert!(rep.version > 0);
        // replies are unique per sequence number and never overwritten
        replies.retain(|num, _| *num > most_recent_processed_request_num);
        replies.insert(request_num, rep.clone());
        debug_assert_eq!(*entry.latest_request_num.borrow(), request_num - 1);
        entry.latest_request_num.send_replace(request_num);

        Some(rep)
    }

    /// Applies a committed-version report, keeping `live_committed`
    /// monotone. Reports carrying an older version only contribute their
    /// `min_known_committed_version`.
    pub fn update_live_committed_version(
        &self,
        version: Version,
        min_known_committed_version: Version,
        locked: bool,
        metadata_version: Option<Vec<u8>>,
        written_tags: Option<&[StorageTag]>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.min_known_committed_version = state
            .min_known_committed_version
            .max(min_known_committed_version);

        if version > *self.live_committed.borrow() {
            if self.config.enable_version_vector {
                if let Some(tags) = written_tags {
                    state.ss_version_vector.set_version(tags, version);
                }
            }
            state.database_locked = locked;
            state.proxy_metadata_version = metadata_version;
            self.live_committed.send_replace(version);
        }
        state.stats.report_live_committed_version_requests += 1;
    }

    /// Handles one committed-version report end to end: under version
    /// vectors, a report whose predecessor has not been seen yet waits for
    /// it first, preserving causal order of committed versions.
    pub async fn report_live_committed_version(
        &self,
        req: ReportRawCommittedVersionRequest,
    ) {
        let needs_wait = self.config.enable_version_vector
            && req
                .prev_version
                .is_some_and(|prev| *self.live_committed.borrow() < prev);

        if needs_wait {
            let prev = req.prev_version.unwrap();
            let mut rx = self.live_committed.subscribe();
            if rx.wait_for(|v| *v >= prev).await.is_err() {
                return;
            }
            self.state.lock().unwrap().stats.wait_for_prev_commit_requests +=
                1;
        } else {
            self.state
                .lock()
                .unwrap()
                .stats
                .non_wait_for_prev_commit_requests += 1;
        }

        self.update_live_committed_version(
            req.version,
            req.min_known_committed_version,
            req.locked,
            req.metadata_version,
            req.written_tags.as_deref(),
        );
        req.reply.send(());
    }

    /// Serves the largest live committed version, initializing it from the
    /// recovery transaction version on first use.
    pub fn get_live_committed_version(
        &self,
        max_version: Version,
    ) -> GetRawCommittedVersionReply {
        let mut state = self.state.lock().unwrap();
        if *self.live_committed.borrow() == INVALID_VERSION {
            self.live_committed
                .send_replace(state.recovery_transaction_version);
        }
        state.stats.get_live_committed_version_requests += 1;

        GetRawCommittedVersionReply {
            version: *self.live_committed.borrow(),
            locked: state.database_locked,
            metadata_version: state.proxy_metadata_version.clone(),
            min_known_committed_version: state.min_known_committed_version,
            ss_version_vector_delta: if self.config.enable_version_vector {
                state.ss_version_vector.delta(max_version)
            } else {
                vec![]
            },
        }
    }

    /// Installs a new generation's recovery data: epoch boundary versions,
    /// the commit proxy registration (replacing all reply caches), the
    /// reference version, resolver placement, and locality.
    pub fn update_recovery_data(&self, req: &UpdateRecoveryDataRequest) {
        pf_info!(
            "recovery data update: recovery_txn_version {} last_epoch_end {} \
             commit_proxies {} resolvers {} version_epoch {:?} locality {}",
            req.recovery_transaction_version,
            req.last_epoch_end,
            req.commit_proxies.len(),
            req.resolvers.len(),
            req.version_epoch,
            req.primary_locality
        );

        let mut state = self.state.lock().unwrap();
        state.recovery_transaction_version = req.recovery_transaction_version;
        state.last_epoch_end = req.last_epoch_end;

        if !req.commit_proxies.is_empty() {
            state.proxies = req
                .commit_proxies
                .iter()
                .map(|id| (*id, Arc::new(ProxyVersionReplies::new())))
                .collect();
        }

        if let Some(epoch) = req.version_epoch {
            state.reference_version = Some(epoch);
        } else if self.config.randomize_version_epoch {
            // a negative reference pushes versions deep into the monotonic
            // range, exercising large version arithmetic
            state.reference_version =
                Some(rand::thread_rng().gen_range(i64::MIN..0));
        }

        state
            .resolution
            .set_commit_proxies(req.commit_proxies.clone());
        state.resolution.set_resolvers(req.resolvers.clone());
        state.locality = req.primary_locality;
    }

    /// Runs the coordinator's serving loop until the generation is
    /// replaced (the lifetime watch no longer matches), every request
    /// channel closes, or the lifetime watch goes away. Version requests
    /// are handled concurrently; recovery updates strictly one at a time.
    pub async fn serve(
        self: Arc<Self>,
        mut rx_commit_version: mpsc::UnboundedReceiver<GetCommitVersionRequest>,
        mut rx_report: mpsc::UnboundedReceiver<ReportRawCommittedVersionRequest>,
        mut rx_raw: mpsc::UnboundedReceiver<GetRawCommittedVersionRequest>,
        mut rx_recovery: mpsc::UnboundedReceiver<UpdateRecoveryDataRequest>,
        mut rx_lifetime: watch::Receiver<LifetimeToken>,
    ) -> Result<(), EstuaryError> {
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                Some(req) = rx_commit_version.recv() => {
                    let this = Arc::clone(&self);
                    tasks.spawn(async move {
                        let GetCommitVersionRequest {
                            requesting_proxy,
                            request_num,
                            most_recent_processed_request_num,
                            reply,
                        } = req;
                        match this
                            .get_commit_version(
                                requesting_proxy,
                                request_num,
                                most_recent_processed_request_num,
                            )
                            .await
                        {
                            Some(rep) => reply.send(rep),
                            None => reply.send_never(),
                        }
                    });
                },

                Some(req) = rx_report.recv() => {
                    let needs_wait = self.config.enable_version_vector
                        && req.prev_version.is_some_and(|prev| {
                            *self.live_committed.borrow() < prev
                        });
                    if needs_wait {
                        let this = Arc::clone(&self);
                        tasks.spawn(async move {
                            this.report_live_committed_version(req).await;
                        });
                    } else {
                        self.report_live_committed_version(req).await;
                    }
                },

                Some(req) = rx_raw.recv() => {
                    let rep = self.get_live_committed_version(req.max_version);
                    req.reply.send(rep);
                },

                Some(req) = rx_recovery.recv() => {
                    self.update_recovery_data(&req);
                    req.reply.send(());
                },

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {},

                changed = rx_lifetime.changed() => {
                    if changed.is_err() {
                        pf_warn!("sequencer lifetime watch lost; terminating");
                        return Ok(());
                    }
                    if *rx_lifetime.borrow() != self.lifetime {
                        pf_warn!(
                            "sequencer generation replaced; terminating \
                             cooperatively"
                        );
                        return Ok(());
                    }
                },

                else => return Ok(()),
            }
        }
    }
}

/// Targets `expected = now * versions_per_second - reference` while
/// guaranteeing forward progress at a rate around `versions_per_second`:
/// the step away from `current` stays within `to_add +- max_offset`.
fn figure_version(
    current: Version,
    now: f64,
    reference: i64,
    to_add: i64,
    versions_per_second: f64,
    max_version_rate_modifier: f64,
    max_version_rate_offset: i64,
) -> Version {
    let expected = (now * versions_per_second) as i64 - reference;
    let max_offset = ((to_add as f64 * max_version_rate_modifier) as i64)
        .min(max_version_rate_offset);
    expected
        .max(current + to_add - max_offset)
        .min(current + to_add + max_offset)
}

#[cfg(test)]
mod coordinator_tests {
    use super::*;
    use crate::utils::promise_pair;
    use tokio::time::{self, Duration};

    fn recovery_request(
        recovery_transaction_version: Version,
        last_epoch_end: Version,
        commit_proxies: Vec<ProxyId>,
    ) -> UpdateRecoveryDataRequest {
        let (reply, _handle) = promise_pair();
        UpdateRecoveryDataRequest {
            recovery_transaction_version,
            last_epoch_end,
            commit_proxies,
            resolvers: vec![70],
            version_epoch: None,
            primary_locality: 0,
            reply,
        }
    }

    fn recovered_coordinator(config: ConfigSequencer) -> VersionCoordinator {
        let coord = VersionCoordinator::new(
            config,
            Clock::new(),
            LifetimeToken {
                controller: 1,
                count: 1,
            },
        );
        coord.update_recovery_data(&recovery_request(1_000_000, 900_000, vec![1, 2]));
        coord
    }

    #[tokio::test(start_paused = true)]
    async fn first_version_chains_from_epoch_end() {
        let coord = recovered_coordinator(ConfigSequencer::default());
        let rep = coord.get_commit_version(1, 1, 0).await.unwrap();
        assert_eq!(rep.version, 1_000_000);
        assert_eq!(rep.prev_version, 900_000);
        assert_eq!(rep.request_num, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn versions_chain_and_grow() {
        let coord = recovered_coordinator(ConfigSequencer::default());
        let clock = coord.clock;

        let mut prev = coord.get_commit_version(1, 1, 0).await.unwrap();
        for num in 2..=5 {
            clock.delay(0.01).await;
            let rep = coord.get_commit_version(1, num, num - 1).await.unwrap();
            assert_eq!(rep.prev_version, prev.version);
            assert!(rep.version > prev.version);
            prev = rep;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_request_replays_cached_reply() {
        let coord = recovered_coordinator(ConfigSequencer::default());
        let clock = coord.clock;

        let first = coord.get_commit_version(1, 1, 0).await.unwrap();
        clock.delay(0.5).await;
        let replay = coord.get_commit_version(1, 1, 0).await.unwrap();
        assert_eq!(first, replay);

        // no version was consumed by the replay: the next fresh request
        // still chains off the original allocation
        clock.delay(0.01).await;
        let next = coord.get_commit_version(1, 2, 0).await.unwrap();
        assert_eq!(next.prev_version, first.version);
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_stale_request_gets_no_reply() {
        let coord = recovered_coordinator(ConfigSequencer::default());
        let clock = coord.clock;

        coord.get_commit_version(1, 1, 0).await.unwrap();
        clock.delay(0.01).await;
        // the proxy acknowledges request 1, evicting its cached reply
        coord.get_commit_version(1, 2, 1).await.unwrap();
        assert!(coord.get_commit_version(1, 1, 1).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_proxy_gets_no_reply() {
        let coord = recovered_coordinator(ConfigSequencer::default());
        assert!(coord.get_commit_version(99, 1, 0).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_space_exhaustion_rejected() {
        let coord = recovered_coordinator(ConfigSequencer::default());
        assert!(coord
            .get_commit_version(1, RequestNum::MAX, 0)
            .await
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_requests_fifo_per_proxy() {
        let coord = Arc::new(recovered_coordinator(ConfigSequencer::default()));

        // request 2 arrives first and must wait for request 1
        let coord_ref = coord.clone();
        let second = tokio::spawn(async move {
            coord_ref.get_commit_version(1, 2, 0).await.unwrap()
        });
        time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        let first = coord.get_commit_version(1, 1, 0).await.unwrap();
        let second = second.await.unwrap();
        assert_eq!(second.prev_version, first.version);
    }

    #[tokio::test(start_paused = true)]
    async fn proxies_allocate_independently() {
        let coord = recovered_coordinator(ConfigSequencer::default());
        let clock = coord.clock;

        let a1 = coord.get_commit_version(1, 1, 0).await.unwrap();
        clock.delay(0.01).await;
        let b1 = coord.get_commit_version(2, 1, 0).await.unwrap();
        // proxy 2's first reply chains off the global version frontier
        assert_eq!(b1.prev_version, a1.version);
        assert!(b1.version > a1.version);
    }

    #[tokio::test(start_paused = true)]
    async fn reference_version_tracks_wall_clock() {
        let coord = VersionCoordinator::new(
            ConfigSequencer::default(),
            Clock::new(),
            LifetimeToken {
                controller: 1,
                count: 1,
            },
        );
        let clock = coord.clock;
        let mut recovery = recovery_request(1_000_000, 900_000, vec![1]);
        recovery.version_epoch = Some(0);
        coord.update_recovery_data(&recovery);

        clock.delay(5.0).await;
        coord.get_commit_version(1, 1, 0).await.unwrap();
        clock.delay(1.0).await;
        let rep = coord.get_commit_version(1, 2, 1).await.unwrap();

        // the allocation moved toward expected (now * rate) but no further
        // than to_add + max_offset past the previous version
        assert!(rep.version > 2_000_000);
        assert!(rep.version <= 2_150_000);
    }

    #[tokio::test(start_paused = true)]
    async fn live_committed_is_monotone() {
        let coord = recovered_coordinator(ConfigSequencer::default());

        coord.update_live_committed_version(200, 150, false, None, None);
        assert_eq!(coord.get_live_committed_version(0).version, 200);

        // a later report with a lower version is a no-op on the version but
        // still contributes its min-known bound
        coord.update_live_committed_version(180, 170, true, None, None);
        let rep = coord.get_live_committed_version(0);
        assert_eq!(rep.version, 200);
        assert!(!rep.locked);
        assert_eq!(rep.min_known_committed_version, 170);

        coord.update_live_committed_version(250, 170, true, None, None);
        let rep = coord.get_live_committed_version(0);
        assert_eq!(rep.version, 250);
        assert!(rep.locked);
    }

    #[tokio::test(start_paused = true)]
    async fn live_committed_initializes_from_recovery() {
        let coord = recovered_coordinator(ConfigSequencer::default());
        let rep = coord.get_live_committed_version(0);
        assert_eq!(rep.version, 1_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn causal_report_waits_for_predecessor() {
        let config = ConfigSequencer {
            enable_version_vector: true,
            ..Default::default()
        };
        let coord = Arc::new(recovered_coordinator(config));

        let (reply, handle) = promise_pair();
        let late = ReportRawCommittedVersionRequest {
            version: 300,
            prev_version: Some(200),
            min_known_committed_version: 0,
            locked: false,
            metadata_version: None,
            written_tags: Some(vec![3]),
            reply,
        };

        let coord_ref = coord.clone();
        let waiter = tokio::spawn(async move {
            coord_ref.report_live_committed_version(late).await;
        });
        time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // once the predecessor lands, the held report applies in order
        coord.update_live_committed_version(200, 0, false, None, None);
        waiter.await.unwrap();
        handle.wait().await.unwrap();

        let rep = coord.get_live_committed_version(0);
        assert_eq!(rep.version, 300);
        assert_eq!(rep.ss_version_vector_delta, vec![(3, 300)]);
        assert_eq!(coord.stats().wait_for_prev_commit_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_replaces_proxy_registration() {
        let coord = recovered_coordinator(ConfigSequencer::default());
        coord.get_commit_version(1, 1, 0).await.unwrap();

        coord.update_recovery_data(&recovery_request(
            2_000_000, 1_500_000, vec![5],
        ));
        // the old generation's proxy is no longer registered
        assert!(coord.get_commit_version(1, 2, 1).await.is_none());
        let rep = coord.get_commit_version(5, 1, 0).await.unwrap();
        assert_eq!(rep.request_num, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn serve_terminates_on_generation_change() {
        let lifetime = LifetimeToken {
            controller: 1,
            count: 1,
        };
        let coord = Arc::new(VersionCoordinator::new(
            ConfigSequencer::default(),
            Clock::new(),
            lifetime,
        ));
        coord.update_recovery_data(&recovery_request(1_000_000, 900_000, vec![1]));

        let (tx_commit, rx_commit) = mpsc::unbounded_channel();
        let (_tx_report, rx_report) = mpsc::unbounded_channel();
        let (tx_raw, rx_raw) = mpsc::unbounded_channel();
        let (_tx_recovery, rx_recovery) = mpsc::unbounded_channel();
        let (tx_lifetime, rx_lifetime) = watch::channel(lifetime);

        let server = tokio::spawn(coord.clone().serve(
            rx_commit,
            rx_report,
            rx_raw,
            rx_recovery,
            rx_lifetime,
        ));

        let (reply, handle) = promise_pair();
        tx_commit
            .send(GetCommitVersionRequest {
                requesting_proxy: 1,
                request_num: 1,
                most_recent_processed_request_num: 0,
                reply,
            })
            .unwrap();
        assert_eq!(handle.wait().await.unwrap().version, 1_000_000);

        let (reply, handle) = promise_pair();
        tx_raw
            .send(GetRawCommittedVersionRequest {
                debug_id: None,
                max_version: 0,
                reply,
            })
            .unwrap();
        assert_eq!(handle.wait().await.unwrap().version, 1_000_000);

        // a new generation takes over; the coordinator steps down
        tx_lifetime
            .send(LifetimeToken {
                controller: 1,
                count: 2,
            })
            .unwrap();
        server.await.unwrap().unwrap();

        // requests after termination observe a broken promise
        let (reply, handle) = promise_pair();
        let late = GetCommitVersionRequest {
            requesting_proxy: 1,
            request_num: 2,
            most_recent_processed_request_num: 1,
            reply,
        };
        if let Err(undelivered) = tx_commit.send(late) {
            drop(undelivered);
        }
        assert_eq!(
            handle.wait().await.unwrap_err(),
            EstuaryError::BrokenPromise
        );
    }
}
