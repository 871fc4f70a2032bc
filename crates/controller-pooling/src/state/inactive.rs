use super::{QueryState, State, StateContext, StateKind, Transition};
use crate::assignments::HostId;
use crate::message::{Heartbeat, Leader, Offline, Query};
use crate::scheduler::{TimerId, TimerKind};
use std::sync::Arc;
use tracing::{debug, info};

/// Follows the leader's table and watches for the leader going quiet.
#[derive(Debug)]
pub struct InactiveState {
    leader: Option<HostId>,
    timer: Option<TimerId>,
}

impl InactiveState {
    /// `leader` is the host presumed to be leading, if known
    pub fn new(leader: Option<HostId>) -> Self {
        Self {
            leader,
            timer: None,
        }
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    fn rearm(&mut self, ctx: &mut StateContext<'_>) {
        if let Some(timer) = self.timer.take() {
            ctx.cancel(timer);
        }
        let timeout = ctx.config().reactivate();
        self.timer = Some(ctx.schedule(timeout, TimerKind::Reactivate));
    }
}

impl State for InactiveState {
    fn kind(&self) -> StateKind {
        StateKind::Inactive
    }

    fn start(&mut self, ctx: &mut StateContext<'_>) {
        self.rearm(ctx);
    }

    fn process_heartbeat(&mut self, ctx: &mut StateContext<'_>, msg: &Heartbeat) -> Transition {
        if self.leader.as_deref() == Some(msg.source.as_str()) {
            self.rearm(ctx);
        }
        Transition::Stay
    }

    fn process_query(&mut self, ctx: &mut StateContext<'_>, msg: &Query) -> Transition {
        if msg.source != ctx.host() {
            ctx.publish_identification();
        }
        Transition::Stay
    }

    fn process_leader(&mut self, ctx: &mut StateContext<'_>, msg: &Leader) -> Transition {
        if msg.source == ctx.host() {
            debug!(host = %ctx.host(), "Ignoring own stale leader message");
            return Transition::Stay;
        }

        if !ctx.start_distributing(Arc::new(msg.assignments.clone())) {
            return Transition::Stay;
        }
        if self.leader.as_deref() != Some(msg.source.as_str()) {
            info!(host = %ctx.host(), leader = %msg.source, "Following leader");
            self.leader = Some(msg.source.clone());
        }
        self.rearm(ctx);
        Transition::Stay
    }

    fn process_offline(&mut self, ctx: &mut StateContext<'_>, msg: &Offline) -> Transition {
        if self.leader.as_deref() == Some(msg.source.as_str()) {
            info!(host = %ctx.host(), leader = %msg.source, "Leader went offline, querying pool");
            return Transition::To(Box::new(QueryState::new(None)));
        }
        Transition::Stay
    }

    fn on_timer(&mut self, ctx: &mut StateContext<'_>, kind: TimerKind) -> Transition {
        if kind != TimerKind::Reactivate {
            return Transition::Stay;
        }
        self.timer = None;
        info!(host = %ctx.host(), leader = ?self.leader, "Leader silent, querying pool");
        Transition::To(Box::new(QueryState::new(None)))
    }
}
