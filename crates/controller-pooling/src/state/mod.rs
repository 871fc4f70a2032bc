//! Coordination state machine
//!
//! Each host runs exactly one state at a time. States react to coordination
//! messages and their own timers and return a [`Transition`]; the manager
//! installs the next state, cancels the old state's timers and starts it.
//!
//! ```text
//!  Idle ──start──▶ Start ──own heartbeat──▶ Query ──lowest id──▶ Active
//!                                             ▲  │                  │
//!                                             │  └──otherwise──▶ Inactive
//!                                             └──leader silent──────┘
//! ```

mod active;
mod inactive;
mod query;
mod start;

pub use active::ActiveState;
pub use inactive::InactiveState;
pub use query::QueryState;
pub use start::StartState;

use crate::assignments::BucketAssignments;
use crate::config::PoolingConfig;
use crate::message::{
    Forward, Heartbeat, Identification, Leader, Message, Offline, Query, ADMIN_CHANNEL,
};
use crate::observability::{CoordinationMetrics, RoutingMetrics};
use crate::queue::EventQueue;
use crate::router::{decide, Decision, RouterStats};
use crate::scheduler::{Scheduler, TimerId, TimerKind};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which state a manager is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Idle,
    Start,
    Query,
    Active,
    Inactive,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Idle => "idle",
            StateKind::Start => "start",
            StateKind::Query => "query",
            StateKind::Active => "active",
            StateKind::Inactive => "inactive",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of handling a message or timer
pub enum Transition {
    Stay,
    To(Box<dyn State>),
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Stay => f.write_str("Stay"),
            Transition::To(next) => write!(f, "To({})", next.kind()),
        }
    }
}

/// Side effect produced under the manager lock and performed after it is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Publish(Message),
    Inject(Forward),
}

/// A state of the coordination machine.
///
/// Handlers a state does not override log the message and stay put.
pub trait State: Send {
    fn kind(&self) -> StateKind;

    /// Called once after the state is installed
    fn start(&mut self, _ctx: &mut StateContext<'_>) {}

    fn process_heartbeat(&mut self, ctx: &mut StateContext<'_>, msg: &Heartbeat) -> Transition {
        ignored(ctx, self.kind(), "heartbeat", &msg.source)
    }

    fn process_query(&mut self, ctx: &mut StateContext<'_>, msg: &Query) -> Transition {
        ignored(ctx, self.kind(), "query", &msg.source)
    }

    fn process_identification(
        &mut self,
        ctx: &mut StateContext<'_>,
        msg: &Identification,
    ) -> Transition {
        ignored(ctx, self.kind(), "identification", &msg.source)
    }

    fn process_leader(&mut self, ctx: &mut StateContext<'_>, msg: &Leader) -> Transition {
        ignored(ctx, self.kind(), "leader", &msg.source)
    }

    fn process_offline(&mut self, ctx: &mut StateContext<'_>, msg: &Offline) -> Transition {
        ignored(ctx, self.kind(), "offline", &msg.source)
    }

    fn on_timer(&mut self, ctx: &mut StateContext<'_>, kind: TimerKind) -> Transition {
        debug!(host = %ctx.host(), state = %self.kind(), timer = %kind, "Unexpected timer");
        Transition::Stay
    }
}

fn ignored(ctx: &StateContext<'_>, state: StateKind, kind: &str, source: &str) -> Transition {
    debug!(host = %ctx.host(), %state, kind, source, "Ignoring message");
    Transition::Stay
}

/// No coordination: before start, after stop and while locked
#[derive(Debug, Default)]
pub struct IdleState;

impl State for IdleState {
    fn kind(&self) -> StateKind {
        StateKind::Idle
    }
}

/// What a state may touch while it runs.
///
/// Borrowed from the manager for the duration of one handler call, under the
/// manager lock.
pub struct StateContext<'a> {
    pub(crate) host: &'a str,
    pub(crate) config: &'a PoolingConfig,
    pub(crate) table: &'a mut Option<Arc<BucketAssignments>>,
    pub(crate) queue: &'a mut EventQueue,
    pub(crate) scheduler: &'a mut Scheduler,
    pub(crate) stats: &'a RouterStats,
    pub(crate) outbox: &'a mut Vec<Outgoing>,
}

impl StateContext<'_> {
    pub fn host(&self) -> &str {
        self.host
    }

    pub fn config(&self) -> &PoolingConfig {
        self.config
    }

    /// Currently installed table
    pub fn assignments(&self) -> Option<Arc<BucketAssignments>> {
        self.table.clone()
    }

    /// True when `table` has the bucket count every host must share
    pub fn accepts_table(&self, table: &BucketAssignments) -> bool {
        table.len() == self.config.bucket_count
    }

    /// Queue a message for `channel`
    pub fn publish(&mut self, channel: &str, mut message: Message) {
        message.set_channel(channel);
        self.outbox.push(Outgoing::Publish(message));
    }

    pub fn publish_admin(&mut self, message: Message) {
        self.publish(ADMIN_CHANNEL, message);
    }

    /// Announce this host and the table it holds
    pub fn publish_identification(&mut self) {
        let table = self.table.as_deref().cloned();
        let message = Message::identification(self.host, table);
        self.publish_admin(message);
    }

    pub fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        self.scheduler.schedule(delay, kind)
    }

    pub fn schedule_with_fixed_delay(
        &mut self,
        initial: Duration,
        period: Duration,
        kind: TimerKind,
    ) -> TimerId {
        self.scheduler.schedule_with_fixed_delay(initial, period, kind)
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Install a new table and route everything parked in the offline queue.
    ///
    /// Returns false, leaving the current table in place, when the table's
    /// size does not match the local bucket count.
    pub fn start_distributing(&mut self, table: Arc<BucketAssignments>) -> bool {
        if !self.accepts_table(&table) {
            warn!(
                host = %self.host,
                buckets = table.len(),
                expected = self.config.bucket_count,
                "Rejecting assignment table with mismatched bucket count"
            );
            return false;
        }

        let owned = table.bucket_count(self.host);
        let hosts = table.all_hosts().len();
        if self.table.as_deref() != Some(&*table) {
            info!(host = %self.host, owned, hosts, "Installing assignment table");
        }
        CoordinationMetrics::increment_tables_installed();
        CoordinationMetrics::set_owned_buckets(owned);
        CoordinationMetrics::set_pool_size(hosts);
        *self.table = Some(Arc::clone(&table));

        let drained = self.queue.drain();
        if drained.expired > 0 {
            warn!(host = %self.host, expired = drained.expired, "Discarded expired offline events");
            self.stats.record_expired(drained.expired);
        }
        for forward in drained.live {
            match decide(self.host, Some(&table), forward) {
                Decision::Local(forward) => self.outbox.push(Outgoing::Inject(forward)),
                Decision::Forward(forward) => {
                    self.stats.record_forwarded();
                    self.outbox.push(Outgoing::Publish(Message::Forward(forward)));
                }
                Decision::Drop(forward, reason) => self.stats.record_dropped(reason, &forward),
                // unreachable with a table installed
                Decision::Enqueue(forward) => {
                    self.queue.add(forward);
                }
            }
        }
        RoutingMetrics::set_offline_queue_len(self.queue.len());
        true
    }

    /// Wall-clock milliseconds, used for heartbeat timestamps
    pub fn now_ms(&self) -> u64 {
        crate::message::current_time_ms()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_idle_ignores_everything() {
        let mut h = Harness::new("h1");
        let mut idle = IdleState;
        h.enter(&mut idle);

        let t = idle.process_query(
            &mut h.ctx(),
            &Query {
                channel: ADMIN_CHANNEL.into(),
                source: "h2".into(),
            },
        );
        assert!(next_kind(t).is_none());
        assert!(h.outbox.is_empty());
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_start_distributing_rejects_wrong_size() {
        let mut h = Harness::new("h1");
        let wrong = balanced(&["h1"], 4);
        assert!(!h.ctx().start_distributing(wrong));
        assert!(h.table.is_none());

        let right = balanced(&["h1"], 8);
        assert!(h.ctx().start_distributing(right));
        assert!(h.table.is_some());
    }

    #[tokio::test]
    async fn test_start_distributing_drains_queue() {
        let mut h = Harness::new("h1");
        for i in 0..6 {
            h.queue
                .add(Forward::new("h1", format!("req-{}", i), "ueb", "events", "{}", 0));
        }

        assert!(h.ctx().start_distributing(balanced(&["h1", "h2"], 8)));
        assert!(h.queue.is_empty());
        assert_eq!(h.outbox.len(), 6);

        for item in &h.outbox {
            match item {
                Outgoing::Inject(f) => {
                    let table = h.table.as_ref().unwrap();
                    assert_eq!(table.host_for(&f.request_id).unwrap(), "h1");
                }
                Outgoing::Publish(Message::Forward(f)) => {
                    assert_eq!(f.channel, "h2");
                    assert_eq!(f.num_hops, 1);
                }
                other => panic!("unexpected outgoing {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_sets_channel() {
        let mut h = Harness::new("h1");
        h.ctx().publish("h2", Message::query("h1"));
        h.ctx().publish_identification();

        let published = h.take_published();
        assert_eq!(published[0].channel(), "h2");
        assert_eq!(published[1].channel(), ADMIN_CHANNEL);
        assert!(matches!(&published[1], Message::Identification(i) if i.assignments.is_none()));
    }
}
