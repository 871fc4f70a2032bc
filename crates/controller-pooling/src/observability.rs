//! Pooling metrics
//!
//! Counters and gauges recorded through the `metrics` facade. Recording is
//! compiled out unless the `metrics` feature is enabled; installing a recorder
//! or exporter is left to the embedding application.
//!
//! ```toml
//! controller-pooling = { version = "0.1", features = ["metrics"] }
//! ```

// ============================================================================
// Coordination Metrics
// ============================================================================

/// State machine and coordination traffic metrics
pub struct CoordinationMetrics;

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
impl CoordinationMetrics {
    // ---- Counters ----

    /// Coordination message accepted from the bus
    pub fn increment_messages_received(kind: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("controller_pooling_messages_received_total", "kind" => kind).increment(1);
    }

    /// Coordination message handed to the bus
    pub fn increment_messages_published(kind: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("controller_pooling_messages_published_total", "kind" => kind).increment(1);
    }

    /// Publish rejected by the endpoint
    pub fn increment_publish_failures() {
        #[cfg(feature = "metrics")]
        metrics::counter!("controller_pooling_publish_failures_total").increment(1);
    }

    /// Message that failed decoding or validation
    pub fn increment_invalid_messages() {
        #[cfg(feature = "metrics")]
        metrics::counter!("controller_pooling_invalid_messages_total").increment(1);
    }

    /// State change
    pub fn increment_transitions(to: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("controller_pooling_state_transitions_total", "to" => to).increment(1);
    }

    /// New assignment table installed
    pub fn increment_tables_installed() {
        #[cfg(feature = "metrics")]
        metrics::counter!("controller_pooling_tables_installed_total").increment(1);
    }

    // ---- Gauges ----

    /// Whether this host is the leader (1 = yes, 0 = no)
    pub fn set_is_leader(is_leader: bool) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("controller_pooling_is_leader").set(if is_leader { 1.0 } else { 0.0 });
    }

    /// Buckets owned by this host in the installed table
    pub fn set_owned_buckets(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("controller_pooling_owned_buckets").set(count as f64);
    }

    /// Hosts present in the installed table
    pub fn set_pool_size(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("controller_pooling_pool_size").set(count as f64);
    }
}

// ============================================================================
// Routing Metrics
// ============================================================================

/// Event routing metrics
pub struct RoutingMetrics;

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
impl RoutingMetrics {
    /// Routing decision, labelled by outcome (passed, forwarded, queued, injected)
    pub fn increment_routed(outcome: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("controller_pooling_events_routed_total", "outcome" => outcome).increment(1);
    }

    /// Event dropped, labelled by reason
    pub fn increment_dropped(reason: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("controller_pooling_events_dropped_total", "reason" => reason).increment(1);
    }

    /// Events waiting for an assignment table
    pub fn set_offline_queue_len(len: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("controller_pooling_offline_queue_len").set(len as f64);
    }
}
