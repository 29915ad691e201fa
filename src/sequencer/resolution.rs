//! Resolver/commit-proxy placement seam of the coordinator. Holds the
//! generation's registered lists and piggybacks staged resolver movements
//! onto commit-version replies.

use crate::sequencer::messages::{
    GetCommitVersionReply, ProxyId, ResolverChange, ResolverId, Version,
    INVALID_VERSION,
};

/// Balancer state installed by recovery-data updates.
#[derive(Debug, Default)]
pub struct ResolutionBalancer {
    /// Commit proxies of the current generation.
    commit_proxies: Vec<ProxyId>,

    /// Resolvers of the current generation.
    resolvers: Vec<ResolverId>,

    /// Staged key-range movements not yet acknowledged by all proxies.
    resolver_changes: Vec<ResolverChange>,

    /// Version the staged movements were created at.
    resolver_changes_version: Version,
}

impl ResolutionBalancer {
    /// Creates an empty balancer.
    pub fn new() -> Self {
        ResolutionBalancer {
            commit_proxies: vec![],
            resolvers: vec![],
            resolver_changes: vec![],
            resolver_changes_version: INVALID_VERSION,
        }
    }

    /// Installs this generation's commit proxy list.
    pub fn set_commit_proxies(&mut self, proxies: Vec<ProxyId>) {
        self.commit_proxies = proxies;
    }

    /// Installs this generation's resolver list.
    pub fn set_resolvers(&mut self, resolvers: Vec<ResolverId>) {
        self.resolvers = resolvers;
    }

    /// Registered commit proxies.
    pub fn commit_proxies(&self) -> &[ProxyId] {
        &self.commit_proxies
    }

    /// Registered resolvers.
    pub fn resolvers(&self) -> &[ResolverId] {
        &self.resolvers
    }

    /// Stages a set of resolver movements to be distributed with future
    /// commit-version replies.
    pub fn stage_changes(
        &mut self,
        changes: Vec<ResolverChange>,
        version: Version,
    ) {
        self.resolver_changes = changes;
        self.resolver_changes_version = version;
    }

    /// Stamps the staged movements into a commit-version reply.
    pub(crate) fn set_changes_in_reply(
        &self,
        _requesting_proxy: ProxyId,
        rep: &mut GetCommitVersionReply,
    ) {
        rep.resolver_changes = self.resolver_changes.clone();
        rep.resolver_changes_version = self.resolver_changes_version;
    }
}
