//! Pooling manager
//!
//! One manager per pooled controller. It owns the current coordination state,
//! the installed assignment table and the offline queue behind a single lock,
//! feeds bus traffic and timers into the state machine, and routes external
//! events. Anything that leaves the process (publishing, injecting into the
//! controller) is collected while the lock is held and performed after it is
//! released.

use crate::assignments::{BucketAssignments, HostId};
use crate::bus::{InternalBus, TopicEndpoint, TopicListener};
use crate::config::PoolingConfig;
use crate::controller::PoolingController;
use crate::error::{PoolingError, Result};
use crate::message::{current_time_ms, decode, Forward, Message, ADMIN_CHANNEL};
use crate::observability::{CoordinationMetrics, RoutingMetrics};
use crate::queue::EventQueue;
use crate::router::{
    decide, Decision, DropReason, ForwardOutcome, JsonFieldExtractor, RequestIdExtractor,
    RouteOutcome, RouterStats, RouterStatsSnapshot,
};
use crate::scheduler::{Scheduler, TimerId, TimerKind, TimerSink};
use crate::state::{IdleState, Outgoing, StartState, State, StateContext, StateKind, Transition};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

struct ManagerInner {
    state: Box<dyn State>,
    table: Option<Arc<BucketAssignments>>,
    queue: EventQueue,
    scheduler: Scheduler,
    running: bool,
}

struct Shared {
    host: HostId,
    config: PoolingConfig,
    bus: InternalBus,
    controller: Arc<dyn PoolingController>,
    extractor: Arc<dyn RequestIdExtractor>,
    stats: RouterStats,
    inner: Mutex<ManagerInner>,
}

/// Coordinates one controller's share of the pool
pub struct PoolingManager {
    shared: Arc<Shared>,
}

impl PoolingManager {
    /// Build a manager that extracts request ids from the configured JSON fields.
    ///
    /// Must be called from within a tokio runtime; its handle drives the
    /// manager's timers.
    pub fn new(
        config: PoolingConfig,
        endpoint: Arc<dyn TopicEndpoint>,
        controller: Arc<dyn PoolingController>,
    ) -> Result<Self> {
        let extractor = Arc::new(JsonFieldExtractor::new(config.request_id_fields.clone()));
        Self::with_extractor(config, endpoint, controller, extractor)
    }

    pub fn with_extractor(
        config: PoolingConfig,
        endpoint: Arc<dyn TopicEndpoint>,
        controller: Arc<dyn PoolingController>,
        extractor: Arc<dyn RequestIdExtractor>,
    ) -> Result<Self> {
        config.validate()?;
        if endpoint.topic() != config.topic {
            return Err(PoolingError::InvalidConfig(format!(
                "endpoint topic {} does not match configured topic {}",
                endpoint.topic(),
                config.topic
            )));
        }
        let runtime = Handle::try_current().map_err(|_| PoolingError::NoRuntime)?;

        let host = match &config.host {
            Some(host) => host.clone(),
            None => generate_host_id(controller.name()),
        };

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let timer_target = weak.clone();
            let sink: TimerSink = Arc::new(move |id: TimerId, kind: TimerKind, generation: u64| {
                if let Some(shared) = timer_target.upgrade() {
                    shared.fire_timer(id, kind, generation);
                }
            });

            Shared {
                inner: Mutex::new(ManagerInner {
                    state: Box::new(IdleState),
                    table: None,
                    queue: EventQueue::new(config.offline_queue_limit, config.offline_queue_age()),
                    scheduler: Scheduler::new(runtime, sink),
                    running: false,
                }),
                host,
                bus: InternalBus::new(endpoint),
                controller,
                extractor,
                stats: RouterStats::default(),
                config,
            }
        });

        info!(
            host = %shared.host,
            controller = %shared.controller.name(),
            topic = %shared.config.topic,
            "Pooling manager created"
        );
        Ok(Self { shared })
    }

    pub fn host(&self) -> &str {
        &self.shared.host
    }

    pub fn topic(&self) -> &str {
        self.shared.bus.topic()
    }

    pub fn config(&self) -> &PoolingConfig {
        &self.shared.config
    }

    pub fn state(&self) -> StateKind {
        self.shared.inner.lock().state.kind()
    }

    pub fn state_name(&self) -> &'static str {
        self.state().as_str()
    }

    /// Currently installed assignment table
    pub fn assignments(&self) -> Option<Arc<BucketAssignments>> {
        self.shared.inner.lock().table.clone()
    }

    pub fn router_stats(&self) -> RouterStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Events parked until a table is installed
    pub fn queue_len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.inner.lock().running
    }

    // ==================== Lifecycle ====================

    pub fn before_start(&self) {
        if let Err(e) = self.shared.bus.endpoint().start_publisher() {
            warn!(host = %self.shared.host, topic = %self.topic(), error = %e, "Failed to start publisher");
        }
    }

    pub fn after_start(&self) {
        let listener: Arc<dyn TopicListener> = Arc::new(BusListener {
            shared: Arc::downgrade(&self.shared),
        });
        if let Err(e) = self.shared.bus.endpoint().start_consumer(listener) {
            warn!(host = %self.shared.host, topic = %self.topic(), error = %e, "Failed to start consumer");
        }

        let mut outbox = Vec::new();
        {
            let mut inner = self.shared.inner.lock();
            inner.running = true;
            if self.shared.controller.is_locked() {
                info!(host = %self.shared.host, "Controller is locked, staying idle");
            } else {
                self.shared
                    .change_state(&mut inner, Box::new(StartState::new()), &mut outbox);
            }
        }
        self.shared.flush(outbox);
    }

    pub fn before_stop(&self) {
        self.shared.bus.endpoint().stop_consumer();
        let outbox = {
            let mut inner = self.shared.inner.lock();
            inner.running = false;
            self.shared.go_offline(&mut inner)
        };
        self.shared.flush(outbox);
    }

    pub fn after_stop(&self) {
        self.shared
            .bus
            .endpoint()
            .stop_publisher(self.shared.config.offline_publish_wait());
        info!(host = %self.shared.host, "Pooling stopped");
    }

    pub fn before_lock(&self) {
        let outbox = {
            let mut inner = self.shared.inner.lock();
            self.shared.go_offline(&mut inner)
        };
        self.shared.flush(outbox);
    }

    pub fn after_unlock(&self) {
        let mut outbox = Vec::new();
        {
            let mut inner = self.shared.inner.lock();
            if inner.running && inner.state.kind() == StateKind::Idle {
                self.shared
                    .change_state(&mut inner, Box::new(StartState::new()), &mut outbox);
            }
        }
        self.shared.flush(outbox);
    }

    // ==================== Routing ====================

    /// Offer an external event to the pool.
    ///
    /// Returns true when pooling took the event and the controller must not
    /// process it itself.
    pub fn before_offer(&self, protocol: &str, topic: &str, event: &str) -> bool {
        self.route_inbound(protocol, topic, event) == RouteOutcome::Handled
    }

    pub fn route_inbound(&self, protocol: &str, topic: &str, event: &str) -> RouteOutcome {
        self.shared.route_inbound(protocol, topic, event)
    }

    /// Route a forwarded event received from a peer
    pub fn route_forward(&self, forward: Forward) -> ForwardOutcome {
        self.shared.route_forward(forward)
    }

    // ==================== Bus ====================

    /// Entry point for raw text arriving on the internal topic
    pub fn on_topic_event(&self, topic: &str, event: &str) {
        self.shared.on_topic_event(topic, event);
    }

    /// Publish a message on `channel` right away
    pub fn publish(&self, channel: &str, mut message: Message) {
        message.set_channel(channel);
        self.shared.publish_now(&message);
    }

    pub fn publish_admin(&self, message: Message) {
        self.publish(ADMIN_CHANNEL, message);
    }
}

impl std::fmt::Debug for PoolingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolingManager")
            .field("host", &self.shared.host)
            .field("topic", &self.shared.config.topic)
            .finish()
    }
}

impl Drop for PoolingManager {
    fn drop(&mut self) {
        self.shared.bus.endpoint().stop_consumer();
        self.shared.inner.lock().scheduler.reset();
    }
}

struct BusListener {
    shared: Weak<Shared>,
}

impl TopicListener for BusListener {
    fn on_topic_event(&self, topic: &str, event: &str) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_topic_event(topic, event);
        }
    }
}

impl Shared {
    fn context<'a>(
        &'a self,
        inner: &'a mut ManagerInner,
        outbox: &'a mut Vec<Outgoing>,
    ) -> (&'a mut Box<dyn State>, StateContext<'a>) {
        let ManagerInner {
            state,
            table,
            queue,
            scheduler,
            ..
        } = inner;
        let ctx = StateContext {
            host: &self.host,
            config: &self.config,
            table,
            queue,
            scheduler,
            stats: &self.stats,
            outbox,
        };
        (state, ctx)
    }

    /// Install `next`, cancelling the previous state's timers, then start it
    fn change_state(
        &self,
        inner: &mut ManagerInner,
        next: Box<dyn State>,
        outbox: &mut Vec<Outgoing>,
    ) {
        let from = inner.state.kind();
        let to = next.kind();
        info!(host = %self.host, %from, %to, "State transition");

        inner.scheduler.reset();
        inner.state = next;
        CoordinationMetrics::increment_transitions(to.as_str());
        CoordinationMetrics::set_is_leader(to == StateKind::Active);

        let (state, mut ctx) = self.context(inner, outbox);
        state.start(&mut ctx);
    }

    fn apply(&self, inner: &mut ManagerInner, transition: Transition, outbox: &mut Vec<Outgoing>) {
        if let Transition::To(next) = transition {
            self.change_state(inner, next, outbox);
        }
    }

    /// Announce departure, stop coordinating and forget the table
    fn go_offline(&self, inner: &mut ManagerInner) -> Vec<Outgoing> {
        let mut outbox = Vec::new();
        if inner.state.kind() != StateKind::Idle {
            outbox.push(Outgoing::Publish(Message::offline(self.host.clone())));
            self.change_state(inner, Box::new(IdleState), &mut outbox);
        }
        if inner.table.take().is_some() {
            info!(host = %self.host, "Assignment table cleared");
            CoordinationMetrics::set_owned_buckets(0);
            CoordinationMetrics::set_pool_size(0);
        }
        outbox
    }

    fn fire_timer(&self, id: TimerId, kind: TimerKind, generation: u64) {
        let mut outbox = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.scheduler.accept(id, generation) {
                trace!(host = %self.host, timer = %kind, "Discarding stale timer");
                return;
            }
            let (state, mut ctx) = self.context(&mut inner, &mut outbox);
            let transition = state.on_timer(&mut ctx, kind);
            self.apply(&mut inner, transition, &mut outbox);
        }
        self.flush(outbox);
    }

    fn on_topic_event(&self, topic: &str, event: &str) {
        if topic != self.config.topic {
            debug!(host = %self.host, %topic, "Ignoring event from foreign topic");
            return;
        }

        let message = match decode(event) {
            Ok(message) => message,
            Err(e) => {
                warn!(host = %self.host, %topic, error = %e, "Discarding invalid pooling message");
                CoordinationMetrics::increment_invalid_messages();
                return;
            }
        };

        let channel = message.channel();
        if channel != ADMIN_CHANNEL && channel != self.host {
            trace!(host = %self.host, %channel, "Ignoring message for another channel");
            return;
        }

        CoordinationMetrics::increment_messages_received(message.kind().as_str());
        trace!(
            host = %self.host,
            kind = %message.kind(),
            source = %message.source(),
            "Received pooling message"
        );

        if let Message::Forward(forward) = message {
            self.route_forward(forward);
            return;
        }

        let mut outbox = Vec::new();
        {
            let mut inner = self.inner.lock();
            let (state, mut ctx) = self.context(&mut inner, &mut outbox);
            let transition = match &message {
                Message::Heartbeat(m) => state.process_heartbeat(&mut ctx, m),
                Message::Query(m) => state.process_query(&mut ctx, m),
                Message::Identification(m) => state.process_identification(&mut ctx, m),
                Message::Leader(m) => state.process_leader(&mut ctx, m),
                Message::Offline(m) => state.process_offline(&mut ctx, m),
                Message::Forward(_) => Transition::Stay,
            };
            self.apply(&mut inner, transition, &mut outbox);
        }
        self.flush(outbox);
    }

    fn route_inbound(&self, protocol: &str, topic: &str, event: &str) -> RouteOutcome {
        let Some(request_id) = self.extractor.extract(topic, event) else {
            trace!(host = %self.host, %topic, "No request id, handling locally");
            self.stats.record_passed();
            return RouteOutcome::PassThrough;
        };

        let mut outbox = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.state.kind() == StateKind::Idle || self.controller.is_locked() {
                self.stats.record_passed();
                return RouteOutcome::PassThrough;
            }

            let forward = Forward::new(
                self.host.clone(),
                request_id,
                protocol,
                topic,
                event,
                current_time_ms(),
            );
            match decide(&self.host, inner.table.as_deref(), forward) {
                Decision::Local(_) => {
                    self.stats.record_passed();
                    RouteOutcome::PassThrough
                }
                decision => {
                    self.apply_decision(&mut inner, decision, &mut outbox);
                    RouteOutcome::Handled
                }
            }
        };
        self.flush(outbox);
        outcome
    }

    fn route_forward(&self, forward: Forward) -> ForwardOutcome {
        let mut outbox = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            match decide(&self.host, inner.table.as_deref(), forward) {
                Decision::Local(forward) => {
                    outbox.push(Outgoing::Inject(forward));
                    ForwardOutcome::InjectLocally
                }
                decision => {
                    self.apply_decision(&mut inner, decision, &mut outbox);
                    ForwardOutcome::Handled
                }
            }
        };
        self.flush(outbox);
        outcome
    }

    fn apply_decision(
        &self,
        inner: &mut ManagerInner,
        decision: Decision,
        outbox: &mut Vec<Outgoing>,
    ) {
        match decision {
            Decision::Local(forward) => outbox.push(Outgoing::Inject(forward)),
            Decision::Forward(forward) => {
                debug!(
                    host = %self.host,
                    request_id = %forward.request_id,
                    owner = %forward.channel,
                    hops = forward.num_hops,
                    "Forwarding event"
                );
                self.stats.record_forwarded();
                outbox.push(Outgoing::Publish(Message::Forward(forward)));
            }
            Decision::Enqueue(forward) => {
                debug!(host = %self.host, request_id = %forward.request_id, "No assignments yet, queueing event");
                if let Some(evicted) = inner.queue.add(forward) {
                    self.stats.record_dropped(DropReason::QueueOverflow, &evicted);
                }
                self.stats.record_queued();
                RoutingMetrics::set_offline_queue_len(inner.queue.len());
            }
            Decision::Drop(forward, reason) => self.stats.record_dropped(reason, &forward),
        }
    }

    fn publish_now(&self, message: &Message) {
        match self.bus.send(message) {
            Ok(()) => CoordinationMetrics::increment_messages_published(message.kind().as_str()),
            Err(e) => {
                warn!(
                    host = %self.host,
                    topic = %self.config.topic,
                    kind = %message.kind(),
                    channel = %message.channel(),
                    error = %e,
                    "Failed to publish pooling message"
                );
                CoordinationMetrics::increment_publish_failures();
            }
        }
    }

    /// Perform side effects collected under the lock
    fn flush(&self, outbox: Vec<Outgoing>) {
        for item in outbox {
            match item {
                Outgoing::Publish(message) => self.publish_now(&message),
                Outgoing::Inject(forward) => {
                    if self
                        .controller
                        .deliver(&forward.protocol, &forward.topic, &forward.payload)
                    {
                        self.stats.record_injected();
                    } else {
                        warn!(
                            host = %self.host,
                            request_id = %forward.request_id,
                            controller = %self.controller.name(),
                            "Controller refused forwarded event"
                        );
                    }
                }
            }
        }
    }
}

fn generate_host_id(controller: &str) -> HostId {
    let prefix = if controller.is_empty() { "host" } else { controller };
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryTopic;
    use crate::message::encode;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct TestController {
        locked: AtomicBool,
        delivered: Mutex<Vec<String>>,
    }

    impl PoolingController for TestController {
        fn name(&self) -> &str {
            "ctl"
        }

        fn is_locked(&self) -> bool {
            self.locked.load(Ordering::SeqCst)
        }

        fn deliver(&self, _protocol: &str, _topic: &str, event: &str) -> bool {
            self.delivered.lock().push(event.to_string());
            true
        }
    }

    fn config(host: &str) -> PoolingConfig {
        PoolingConfig::builder("pool")
            .host(host)
            .bucket_count(8)
            .build()
            .unwrap()
    }

    fn manager(topic: &Arc<InMemoryTopic>, host: &str) -> (PoolingManager, Arc<TestController>) {
        manager_with(topic, config(host))
    }

    fn manager_with(
        topic: &Arc<InMemoryTopic>,
        config: PoolingConfig,
    ) -> (PoolingManager, Arc<TestController>) {
        let controller = Arc::new(TestController::default());
        let mgr = PoolingManager::new(config, topic.endpoint(), controller.clone()).unwrap();
        (mgr, controller)
    }

    fn only(host: &str) -> BucketAssignments {
        BucketAssignments::rebalanced(None, 8, &BTreeSet::from([host.to_string()]))
    }

    /// Feed the manager its own Start heartbeat on a topic that does not deliver
    fn echo_start_heartbeat(topic: &InMemoryTopic, mgr: &PoolingManager) {
        let heartbeat = topic.published()[0].clone();
        mgr.on_topic_event("pool", &heartbeat);
        assert_eq!(mgr.state(), StateKind::Query);
    }

    fn start(mgr: &PoolingManager) {
        mgr.before_start();
        mgr.after_start();
    }

    #[test]
    fn test_requires_runtime() {
        let topic = InMemoryTopic::new("pool");
        let err = PoolingManager::new(
            config("h1"),
            topic.endpoint(),
            Arc::new(TestController::default()),
        )
        .unwrap_err();
        assert!(matches!(err, PoolingError::NoRuntime));
    }

    #[tokio::test]
    async fn test_rejects_topic_mismatch() {
        let topic = InMemoryTopic::new("other");
        let err = PoolingManager::new(
            config("h1"),
            topic.endpoint(),
            Arc::new(TestController::default()),
        )
        .unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_generated_host_id() {
        let topic = InMemoryTopic::new("pool");
        let mut cfg = config("unused");
        cfg.host = None;
        let mgr = PoolingManager::new(cfg, topic.endpoint(), Arc::new(TestController::default()))
            .unwrap();
        assert!(mgr.host().starts_with("ctl-"));
        assert_eq!(mgr.state(), StateKind::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_host_becomes_active() {
        let topic = InMemoryTopic::new("pool");
        let (mgr, _ctl) = manager(&topic, "h1");
        start(&mgr);
        assert_eq!(mgr.state(), StateKind::Start);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mgr.state(), StateKind::Active);
        let table = mgr.assignments().unwrap();
        assert_eq!(table.bucket_count("h1"), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_passes_through() {
        let topic = InMemoryTopic::new("pool");
        let (mgr, _ctl) = manager(&topic, "h1");
        assert_eq!(
            mgr.route_inbound("ueb", "events", r#"{"requestId":"r1"}"#),
            RouteOutcome::PassThrough
        );
        assert!(!mgr.before_offer("ueb", "events", r#"{"requestId":"r1"}"#));
        assert_eq!(mgr.router_stats().passed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_queue_until_table_installed() {
        let topic = InMemoryTopic::new("pool");
        let (mgr, ctl) = manager(&topic, "h1");
        start(&mgr);

        for i in 0..3 {
            let event = format!(r#"{{"requestId":"r{}"}}"#, i);
            assert_eq!(mgr.route_inbound("ueb", "events", &event), RouteOutcome::Handled);
        }
        assert_eq!(mgr.queue_len(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mgr.state(), StateKind::Active);
        assert_eq!(mgr.queue_len(), 0);
        assert_eq!(ctl.delivered.lock().len(), 3);
        assert_eq!(mgr.router_stats().injected, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_publishes_offline_and_clears() {
        let topic = InMemoryTopic::new("pool");
        let (mgr, _ctl) = manager(&topic, "h1");
        start(&mgr);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(mgr.assignments().is_some());

        topic.clear_published();
        mgr.before_stop();
        mgr.after_stop();

        assert_eq!(mgr.state(), StateKind::Idle);
        assert!(mgr.assignments().is_none());
        let published = topic.published();
        assert_eq!(published.len(), 1);
        assert!(matches!(decode(&published[0]).unwrap(), Message::Offline(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_and_unlock() {
        let topic = InMemoryTopic::new("pool");
        let (mgr, ctl) = manager(&topic, "h1");
        start(&mgr);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mgr.state(), StateKind::Active);

        ctl.locked.store(true, Ordering::SeqCst);
        mgr.before_lock();
        assert_eq!(mgr.state(), StateKind::Idle);
        assert!(mgr.assignments().is_none());
        assert!(!mgr.before_offer("ueb", "events", r#"{"requestId":"r1"}"#));

        ctl.locked.store(false, Ordering::SeqCst);
        mgr.after_unlock();
        assert_eq!(mgr.state(), StateKind::Start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_controller_stays_idle_on_start() {
        let topic = InMemoryTopic::new("pool");
        let (mgr, ctl) = manager(&topic, "h1");
        ctl.locked.store(true, Ordering::SeqCst);
        start(&mgr);
        assert_eq!(mgr.state(), StateKind::Idle);
        assert!(mgr.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_messages_are_dropped() {
        let topic = InMemoryTopic::new("pool");
        let (mgr, _ctl) = manager(&topic, "h1");
        start(&mgr);

        mgr.on_topic_event("pool", "garbage");
        mgr.on_topic_event(
            "pool",
            r#"{"type":"leader","channel":"admin","source":"h0","assignments":[null]}"#,
        );
        mgr.on_topic_event("pool", r#"{"type":"query","channel":"h7","source":"h0"}"#);
        assert_eq!(mgr.state(), StateKind::Start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_reach_new_state() {
        let topic = InMemoryTopic::new("pool");
        topic.set_delivering(false);
        let cfg = PoolingConfig::builder("pool")
            .host("h1")
            .bucket_count(8)
            .start_heartbeat(Duration::from_secs(2))
            .identification(Duration::from_secs(10))
            .build()
            .unwrap();
        let (mgr, _ctl) = manager_with(&topic, cfg);
        start(&mgr);
        assert_eq!(mgr.state(), StateKind::Start);

        let (stale_id, stale_generation) = {
            let inner = mgr.shared.inner.lock();
            (inner.scheduler.pending_ids()[0], inner.scheduler.generation())
        };
        echo_start_heartbeat(&topic, &mgr);

        // a window timer would elect this host if it got through
        mgr.shared.fire_timer(stale_id, TimerKind::IdentificationWindow, stale_generation);
        assert_eq!(mgr.state(), StateKind::Query);
        assert!(mgr.assignments().is_none());

        // Start's retry timer went with Start
        topic.clear_published();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(topic.published().is_empty());
        assert_eq!(mgr.state(), StateKind::Query);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(mgr.state(), StateKind::Active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_routing_sees_whole_tables() {
        let topic = InMemoryTopic::new("pool");
        topic.set_delivering(false);
        let cfg = PoolingConfig::builder("pool")
            .host("h2")
            .bucket_count(8)
            .identification(Duration::from_millis(20))
            .build()
            .unwrap();
        let (mgr, _ctl) = manager_with(&topic, cfg);
        let mgr = Arc::new(mgr);
        start(&mgr);
        echo_start_heartbeat(&topic, &mgr);

        let (all_h1, all_h3) = (only("h1"), only("h3"));
        let to_h1 = encode(&Message::leader("h1", all_h1.clone())).unwrap();
        let to_h3 = encode(&Message::leader("h1", all_h3.clone())).unwrap();
        mgr.on_topic_event("pool", &to_h1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while mgr.state() != StateKind::Inactive {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("follows h1");

        let router = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                let mut outcomes = Vec::new();
                for i in 0..500 {
                    let event = format!(r#"{{"requestId":"r{}"}}"#, i);
                    outcomes.push(mgr.route_inbound("ueb", "events", &event));
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                outcomes
            })
        };

        for i in 0..200 {
            let leader = if i % 2 == 0 { &to_h3 } else { &to_h1 };
            mgr.on_topic_event("pool", leader);
            let table = mgr.assignments().unwrap();
            assert!(*table == all_h1 || *table == all_h3);
        }

        let outcomes = router.await.unwrap();
        assert!(outcomes.iter().all(|o| *o == RouteOutcome::Handled));
        let stats = mgr.router_stats();
        assert_eq!(stats.forwarded, 500);
        assert_eq!(stats.dropped(), 0);

        let forwards: Vec<Forward> = topic
            .published()
            .iter()
            .filter_map(|text| match decode(text) {
                Ok(Message::Forward(f)) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(forwards.len(), 500);
        assert!(forwards
            .iter()
            .all(|f| (f.channel == "h1" || f.channel == "h3") && f.num_hops == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_is_absorbed() {
        let topic = InMemoryTopic::new("pool");
        let (mgr, _ctl) = manager(&topic, "h1");
        start(&mgr);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mgr.state(), StateKind::Active);

        topic.clear_published();
        topic.set_rejecting(true);
        mgr.publish_admin(Message::query("h1"));
        mgr.before_stop();

        assert!(topic.published().is_empty());
        assert_eq!(mgr.state(), StateKind::Idle);
    }
}
