use super::{QueryState, State, StateContext, StateKind, Transition};
use crate::assignments::BucketAssignments;
use crate::message::{Heartbeat, Leader, Message};
use crate::scheduler::TimerKind;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Waits for the host's own heartbeat to come back over the bus.
///
/// Until the echo arrives the bus is not known to work, so the host takes no
/// part in coordination and keeps re-sending its heartbeat.
#[derive(Debug, Default)]
pub struct StartState {
    sent: HashSet<u64>,
    last_sent: u64,
    seed: Option<Arc<BucketAssignments>>,
}

impl StartState {
    pub fn new() -> Self {
        Self::default()
    }

    fn send_heartbeat(&mut self, ctx: &mut StateContext<'_>) {
        // timestamps double as nonces, keep them unique within this instance
        let timestamp = ctx.now_ms().max(self.last_sent + 1);
        self.last_sent = timestamp;
        self.sent.insert(timestamp);

        let host = ctx.host().to_string();
        ctx.publish(&host, Message::heartbeat(host.clone(), host.clone(), timestamp));
    }
}

impl State for StartState {
    fn kind(&self) -> StateKind {
        StateKind::Start
    }

    fn start(&mut self, ctx: &mut StateContext<'_>) {
        self.send_heartbeat(ctx);
        let timeout = ctx.config().start_heartbeat();
        ctx.schedule(timeout, TimerKind::StartHeartbeat);
    }

    fn process_heartbeat(&mut self, ctx: &mut StateContext<'_>, msg: &Heartbeat) -> Transition {
        if msg.source != ctx.host() || !self.sent.contains(&msg.timestamp_ms) {
            debug!(host = %ctx.host(), source = %msg.source, "Ignoring foreign heartbeat while starting");
            return Transition::Stay;
        }

        info!(host = %ctx.host(), "Own heartbeat received, querying pool");
        Transition::To(Box::new(QueryState::new(self.seed.take())))
    }

    fn process_leader(&mut self, ctx: &mut StateContext<'_>, msg: &Leader) -> Transition {
        if msg.assignments.has_assignment(ctx.host()) && ctx.accepts_table(&msg.assignments) {
            debug!(host = %ctx.host(), leader = %msg.source, "Remembering leader table while starting");
            self.seed = Some(Arc::new(msg.assignments.clone()));
        }
        Transition::Stay
    }

    fn on_timer(&mut self, ctx: &mut StateContext<'_>, kind: TimerKind) -> Transition {
        if kind == TimerKind::StartHeartbeat {
            warn!(host = %ctx.host(), "Own heartbeat not seen yet, retrying");
            self.send_heartbeat(ctx);
            let timeout = ctx.config().start_heartbeat();
            ctx.schedule(timeout, TimerKind::StartHeartbeat);
        }
        Transition::Stay
    }
}
