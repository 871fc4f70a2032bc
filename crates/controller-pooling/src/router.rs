//! Event routing
//!
//! Decides, for each external event, whether this host processes it, hands it
//! to the owning peer as a [`Forward`] envelope, parks it until a table is
//! installed, or drops it. Decisions are pure functions of the installed
//! table; the manager applies them and performs any I/O after releasing its
//! lock.

use crate::assignments::BucketAssignments;
use crate::message::Forward;
use crate::observability::RoutingMetrics;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Outcome of offering an external event to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Pooling took the event (forwarded, queued or dropped)
    Handled,
    /// The local controller should process the event normally
    PassThrough,
}

/// Outcome of receiving a forwarded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Forwarded again, queued or dropped
    Handled,
    /// This host owns the event and must inject it locally
    InjectLocally,
}

/// Why an event was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The event's bucket has no owner
    Unassigned,
    /// The envelope exceeded the hop limit
    TooManyHops,
    /// Evicted from a full offline queue
    QueueOverflow,
    /// Sat in the offline queue too long
    Expired,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Unassigned => "unassigned",
            DropReason::TooManyHops => "hops",
            DropReason::QueueOverflow => "overflow",
            DropReason::Expired => "expired",
        }
    }
}

/// Routing decision for one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Owned by this host
    Local(Forward),
    /// Publish to the owner; channel and hop count already set
    Forward(Forward),
    /// No table installed yet
    Enqueue(Forward),
    Drop(Forward, DropReason),
}

/// Route an envelope against the installed table
pub fn decide(host: &str, table: Option<&BucketAssignments>, mut forward: Forward) -> Decision {
    if forward.exceeds_hops() {
        return Decision::Drop(forward, DropReason::TooManyHops);
    }

    let Some(table) = table else {
        return Decision::Enqueue(forward);
    };

    match table.host_for(&forward.request_id) {
        None => Decision::Drop(forward, DropReason::Unassigned),
        Some(owner) if owner == host => Decision::Local(forward),
        Some(owner) => {
            forward.bump_hops();
            if forward.exceeds_hops() {
                return Decision::Drop(forward, DropReason::TooManyHops);
            }
            forward.channel = owner.clone();
            Decision::Forward(forward)
        }
    }
}

/// Extracts the routing key of an external event
pub trait RequestIdExtractor: Send + Sync {
    fn extract(&self, topic: &str, event: &str) -> Option<String>;
}

/// Looks up the request id in a JSON event by field name or dotted path.
///
/// Fields are tried in order; the first one holding a non-empty string or a
/// number wins.
#[derive(Debug, Clone)]
pub struct JsonFieldExtractor {
    fields: Vec<String>,
}

impl JsonFieldExtractor {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

impl RequestIdExtractor for JsonFieldExtractor {
    fn extract(&self, _topic: &str, event: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(event).ok()?;
        self.fields.iter().find_map(|path| {
            let found = path
                .split('.')
                .try_fold(&value, |node, segment| node.get(segment))?;
            match found {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        })
    }
}

/// Routing counters for one manager
#[derive(Debug, Default)]
pub struct RouterStats {
    passed: AtomicU64,
    forwarded: AtomicU64,
    queued: AtomicU64,
    injected: AtomicU64,
    dropped_unassigned: AtomicU64,
    dropped_hops: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_expired: AtomicU64,
}

/// Point-in-time copy of [`RouterStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatsSnapshot {
    pub passed: u64,
    pub forwarded: u64,
    pub queued: u64,
    pub injected: u64,
    pub dropped_unassigned: u64,
    pub dropped_hops: u64,
    pub dropped_overflow: u64,
    pub dropped_expired: u64,
}

impl RouterStatsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.dropped_unassigned + self.dropped_hops + self.dropped_overflow + self.dropped_expired
    }
}

impl RouterStats {
    pub fn record_passed(&self) {
        self.passed.fetch_add(1, Ordering::Relaxed);
        RoutingMetrics::increment_routed("passed");
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        RoutingMetrics::increment_routed("forwarded");
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        RoutingMetrics::increment_routed("queued");
    }

    pub fn record_injected(&self) {
        self.injected.fetch_add(1, Ordering::Relaxed);
        RoutingMetrics::increment_routed("injected");
    }

    pub fn record_dropped(&self, reason: DropReason, forward: &Forward) {
        let counter = match reason {
            DropReason::Unassigned => &self.dropped_unassigned,
            DropReason::TooManyHops => &self.dropped_hops,
            DropReason::QueueOverflow => &self.dropped_overflow,
            DropReason::Expired => &self.dropped_expired,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        RoutingMetrics::increment_dropped(reason.as_str());
        warn!(
            request_id = %forward.request_id,
            topic = %forward.topic,
            hops = forward.num_hops,
            reason = reason.as_str(),
            "Dropping pooled event"
        );
    }

    /// Count events that aged out of the offline queue
    pub fn record_expired(&self, count: usize) {
        self.dropped_expired.fetch_add(count as u64, Ordering::Relaxed);
        for _ in 0..count {
            RoutingMetrics::increment_dropped(DropReason::Expired.as_str());
        }
    }

    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            passed: self.passed.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            injected: self.injected.load(Ordering::Relaxed),
            dropped_unassigned: self.dropped_unassigned.load(Ordering::Relaxed),
            dropped_hops: self.dropped_hops.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_expired: self.dropped_expired.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MAX_HOPS;

    fn single_owner(host: &str) -> BucketAssignments {
        BucketAssignments::new(vec![Some(host.to_string()); 8])
    }

    fn fwd(hops: u32) -> Forward {
        let mut f = Forward::new("h1", "req-1", "ueb", "events", "{}", 0);
        f.num_hops = hops;
        f
    }

    #[test]
    fn test_no_table_enqueues() {
        assert!(matches!(decide("h1", None, fwd(0)), Decision::Enqueue(_)));
    }

    #[test]
    fn test_local_owner() {
        let t = single_owner("h1");
        assert!(matches!(decide("h1", Some(&t), fwd(0)), Decision::Local(_)));
    }

    #[test]
    fn test_peer_owner_forwards_with_hop() {
        let t = single_owner("h2");
        match decide("h1", Some(&t), fwd(0)) {
            Decision::Forward(f) => {
                assert_eq!(f.channel, "h2");
                assert_eq!(f.num_hops, 1);
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_unassigned_bucket_drops() {
        let t = BucketAssignments::unassigned(8);
        assert!(matches!(
            decide("h1", Some(&t), fwd(0)),
            Decision::Drop(_, DropReason::Unassigned)
        ));
    }

    #[test]
    fn test_hop_limit() {
        let t = single_owner("h2");
        // arriving over the limit is dropped before any lookup
        assert!(matches!(
            decide("h2", Some(&t), fwd(MAX_HOPS + 1)),
            Decision::Drop(_, DropReason::TooManyHops)
        ));
        assert!(matches!(
            decide("h1", None, fwd(MAX_HOPS + 1)),
            Decision::Drop(_, DropReason::TooManyHops)
        ));
        // the last permitted hop still goes out, the next one does not
        assert!(matches!(
            decide("h1", Some(&t), fwd(MAX_HOPS - 1)),
            Decision::Forward(_)
        ));
        assert!(matches!(
            decide("h1", Some(&t), fwd(MAX_HOPS)),
            Decision::Drop(_, DropReason::TooManyHops)
        ));
    }

    #[test]
    fn test_json_extractor() {
        let extractor = JsonFieldExtractor::new(vec![
            "requestId".into(),
            "body.request_id".into(),
        ]);
        assert_eq!(
            extractor.extract("t", r#"{"requestId":"abc"}"#),
            Some("abc".to_string())
        );
        assert_eq!(
            extractor.extract("t", r#"{"body":{"request_id":17}}"#),
            Some("17".to_string())
        );
        assert_eq!(extractor.extract("t", r#"{"requestId":""}"#), None);
        assert_eq!(extractor.extract("t", r#"{"other":1}"#), None);
        assert_eq!(extractor.extract("t", "plain text"), None);
    }

    #[test]
    fn test_stats() {
        let stats = RouterStats::default();
        stats.record_passed();
        stats.record_forwarded();
        stats.record_dropped(DropReason::TooManyHops, &fwd(6));
        stats.record_dropped(DropReason::Expired, &fwd(0));

        let snap = stats.snapshot();
        assert_eq!(snap.passed, 1);
        assert_eq!(snap.forwarded, 1);
        assert_eq!(snap.dropped_hops, 1);
        assert_eq!(snap.dropped(), 2);
    }
}
