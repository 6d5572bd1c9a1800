// Copyright (c) 2018-2022 The Botho Foundation

//! Engine configuration (spec.md §6's config surface) plus a fluent
//! builder, in the style the rest of the workspace uses for its config
//! types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the gossip engine. All intervals are stored in seconds and
/// exposed as [`Duration`] through accessor methods, matching the rest of
/// the workspace's config types.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GossipConfig {
    /// This node's own dial-able endpoint, advertised in alive messages.
    pub endpoint: String,
    /// Endpoints to dial at startup (`connect2BootstrapPeers`).
    pub bootstrap_peers: Vec<String>,

    /// How many times an emitted message is replayed before eviction.
    pub propagate_iterations: u32,
    /// Burst size cap for the batching emitter.
    pub max_propagation_burst_size: usize,
    /// Burst latency cap, in milliseconds, for the batching emitter.
    pub max_propagation_burst_latency_ms: u64,
    /// Number of peers an emitted message fans out to per burst.
    pub propagate_peer_num: usize,

    /// Interval between per-channel pull-reconciliation rounds.
    pub pull_interval_secs: u64,
    /// Number of peers pulled from per round (discovery and per-channel).
    pub pull_peer_num: usize,

    /// How often a peer's own certificate is republished (informational;
    /// the identity mapper doesn't auto-rotate certs, but downstream
    /// embedders use this to schedule republication).
    pub publish_cert_period_secs: u64,
    /// How often channel state is proactively republished by the leader,
    /// independent of mutation-triggered republication.
    pub publish_state_info_interval_secs: u64,

    /// Interval between alive-message emission and the aliveness sweeper.
    pub alive_time_interval_secs: u64,
    /// How long since last-seen before a peer moves alive → dead.
    pub alive_expiration_timeout_secs: u64,
    /// Multiplier on `alive_expiration_timeout_secs` before a dead peer is
    /// evicted outright.
    pub msg_expiration_factor: u32,

    /// Identity mapper TTL: entries unused for this long are swept.
    pub identity_ttl_secs: u64,

    /// Warm-up window after startup during which alive messages include
    /// the sender's certificate.
    pub include_identity_period_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bootstrap_peers: Vec::new(),
            propagate_iterations: 1,
            max_propagation_burst_size: 10,
            max_propagation_burst_latency_ms: 500,
            propagate_peer_num: 3,
            pull_interval_secs: 5,
            pull_peer_num: 3,
            publish_cert_period_secs: 10 * 60,
            publish_state_info_interval_secs: 5 * 60,
            alive_time_interval_secs: 5,
            alive_expiration_timeout_secs: 25,
            msg_expiration_factor: 10,
            identity_ttl_secs: 60 * 60,
            include_identity_period_secs: 10,
        }
    }
}

impl GossipConfig {
    /// Start building a config from defaults.
    pub fn builder() -> GossipConfigBuilder {
        GossipConfigBuilder::default()
    }

    /// [`Self::max_propagation_burst_latency_ms`] as a [`Duration`].
    pub fn max_propagation_burst_latency(&self) -> Duration {
        Duration::from_millis(self.max_propagation_burst_latency_ms)
    }

    /// [`Self::pull_interval_secs`] as a [`Duration`].
    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }

    /// [`Self::alive_time_interval_secs`] as a [`Duration`].
    pub fn alive_time_interval(&self) -> Duration {
        Duration::from_secs(self.alive_time_interval_secs)
    }

    /// [`Self::alive_expiration_timeout_secs`] as a [`Duration`].
    pub fn alive_expiration_timeout(&self) -> Duration {
        Duration::from_secs(self.alive_expiration_timeout_secs)
    }

    /// The eviction threshold: `aliveExpirationTimeout × msgExpirationFactor`
    /// (spec.md §4.5).
    pub fn eviction_timeout(&self) -> Duration {
        self.alive_expiration_timeout() * self.msg_expiration_factor
    }

    /// [`Self::identity_ttl_secs`] as a [`Duration`].
    pub fn identity_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_ttl_secs)
    }

    /// [`Self::include_identity_period_secs`] as a [`Duration`].
    pub fn include_identity_period(&self) -> Duration {
        Duration::from_secs(self.include_identity_period_secs)
    }
}

/// Fluent builder for [`GossipConfig`].
#[derive(Default)]
pub struct GossipConfigBuilder {
    config: GossipConfig,
}

impl GossipConfigBuilder {
    /// Set the node's own advertised endpoint.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// Set the bootstrap peer endpoints.
    pub fn bootstrap_peers(mut self, peers: Vec<String>) -> Self {
        self.config.bootstrap_peers = peers;
        self
    }

    /// Set `propagateIterations`.
    pub fn propagate_iterations(mut self, n: u32) -> Self {
        self.config.propagate_iterations = n;
        self
    }

    /// Set `maxPropagationBurstSize`.
    pub fn max_propagation_burst_size(mut self, n: usize) -> Self {
        self.config.max_propagation_burst_size = n;
        self
    }

    /// Set `maxPropagationBurstLatency`.
    pub fn max_propagation_burst_latency(mut self, latency: Duration) -> Self {
        self.config.max_propagation_burst_latency_ms = latency.as_millis() as u64;
        self
    }

    /// Set `propagatePeerNum`.
    pub fn propagate_peer_num(mut self, n: usize) -> Self {
        self.config.propagate_peer_num = n;
        self
    }

    /// Set `pullInterval`.
    pub fn pull_interval(mut self, interval: Duration) -> Self {
        self.config.pull_interval_secs = interval.as_secs();
        self
    }

    /// Set `pullPeerNum`.
    pub fn pull_peer_num(mut self, n: usize) -> Self {
        self.config.pull_peer_num = n;
        self
    }

    /// Set `aliveTimeInterval`.
    pub fn alive_time_interval(mut self, interval: Duration) -> Self {
        self.config.alive_time_interval_secs = interval.as_secs();
        self
    }

    /// Set `aliveExpirationTimeout`.
    pub fn alive_expiration_timeout(mut self, timeout: Duration) -> Self {
        self.config.alive_expiration_timeout_secs = timeout.as_secs();
        self
    }

    /// Set `msgExpirationFactor`.
    pub fn msg_expiration_factor(mut self, factor: u32) -> Self {
        self.config.msg_expiration_factor = factor;
        self
    }

    /// Set the identity mapper TTL.
    pub fn identity_ttl(mut self, ttl: Duration) -> Self {
        self.config.identity_ttl_secs = ttl.as_secs();
        self
    }

    /// Finish building.
    pub fn build(self) -> GossipConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GossipConfig::default();
        assert!(config.pull_peer_num > 0);
        assert!(config.propagate_iterations > 0);
        assert!(config.eviction_timeout() > config.alive_expiration_timeout());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = GossipConfig::builder()
            .endpoint("node-a:9000")
            .pull_peer_num(5)
            .propagate_iterations(3)
            .build();

        assert_eq!(config.endpoint, "node-a:9000");
        assert_eq!(config.pull_peer_num, 5);
        assert_eq!(config.propagate_iterations, 3);
    }

    #[test]
    fn duration_accessors_match_stored_seconds() {
        let config = GossipConfig::builder()
            .pull_interval(Duration::from_secs(7))
            .build();
        assert_eq!(config.pull_interval(), Duration::from_secs(7));
    }
}
