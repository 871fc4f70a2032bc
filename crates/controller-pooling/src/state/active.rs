use super::{InactiveState, State, StateContext, StateKind, Transition};
use crate::assignments::{BucketAssignments, HostId};
use crate::message::{Heartbeat, Identification, Leader, Message, Offline, Query, ADMIN_CHANNEL};
use crate::scheduler::TimerKind;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The leader: owns the assignment table and keeps the pool informed.
#[derive(Debug)]
pub struct ActiveState {
    members: BTreeSet<HostId>,
    table: Option<Arc<BucketAssignments>>,
    echo_seen: bool,
    round: Option<BTreeSet<HostId>>,
}

impl ActiveState {
    /// `members` are the hosts found alive; `seed` is the table to build on
    pub fn new(members: BTreeSet<HostId>, seed: Option<Arc<BucketAssignments>>) -> Self {
        Self {
            members,
            table: seed,
            echo_seen: false,
            round: None,
        }
    }

    pub fn members(&self) -> &BTreeSet<HostId> {
        &self.members
    }

    /// Rebalance over the current members, install and announce
    fn redistribute(&mut self, ctx: &mut StateContext<'_>) {
        let bucket_count = ctx.config().bucket_count;
        let table = Arc::new(BucketAssignments::rebalanced(
            self.table.as_deref(),
            bucket_count,
            &self.members,
        ));
        ctx.start_distributing(Arc::clone(&table));
        self.table = Some(table);
        self.publish_leader(ctx);
    }

    /// Start collecting identifications; members that stay silent until the
    /// window closes lose their buckets
    fn open_round(&mut self, ctx: &mut StateContext<'_>) {
        self.round = Some(BTreeSet::from([ctx.host().to_string()]));
        let window = ctx.config().identification();
        ctx.schedule(window, TimerKind::IdentificationWindow);
    }

    fn publish_leader(&self, ctx: &mut StateContext<'_>) {
        if let Some(table) = &self.table {
            let host = ctx.host().to_string();
            ctx.publish_admin(Message::leader(host, (**table).clone()));
        }
    }
}

impl State for ActiveState {
    fn kind(&self) -> StateKind {
        StateKind::Active
    }

    fn start(&mut self, ctx: &mut StateContext<'_>) {
        self.members.insert(ctx.host().to_string());
        if self.table.is_none() {
            self.table = ctx.assignments();
        }
        info!(host = %ctx.host(), members = self.members.len(), "Becoming leader");

        self.redistribute(ctx);

        let beat = ctx.config().inter_heartbeat();
        ctx.schedule_with_fixed_delay(beat, beat, TimerKind::LeaderHeartbeat);
        let check = ctx.config().active_heartbeat();
        ctx.schedule_with_fixed_delay(check, check, TimerKind::ActiveCheck);
    }

    fn process_heartbeat(&mut self, ctx: &mut StateContext<'_>, msg: &Heartbeat) -> Transition {
        if msg.source == ctx.host() {
            self.echo_seen = true;
        }
        Transition::Stay
    }

    fn process_query(&mut self, ctx: &mut StateContext<'_>, msg: &Query) -> Transition {
        if msg.source == ctx.host() {
            return Transition::Stay;
        }

        ctx.publish_identification();
        if self.round.is_none() {
            debug!(host = %ctx.host(), querier = %msg.source, "Opening identification round");
            self.open_round(ctx);
        }
        if let Some(round) = &mut self.round {
            round.insert(msg.source.clone());
        }
        Transition::Stay
    }

    fn process_identification(
        &mut self,
        _ctx: &mut StateContext<'_>,
        msg: &Identification,
    ) -> Transition {
        if let Some(round) = &mut self.round {
            round.insert(msg.source.clone());
        }
        Transition::Stay
    }

    fn process_leader(&mut self, ctx: &mut StateContext<'_>, msg: &Leader) -> Transition {
        if msg.source == ctx.host() {
            self.echo_seen = true;
            return Transition::Stay;
        }

        self.echo_seen = true;
        if msg.source.as_str() < ctx.host() {
            info!(host = %ctx.host(), leader = %msg.source, "Yielding to lower host id");
            ctx.start_distributing(Arc::new(msg.assignments.clone()));
            return Transition::To(Box::new(InactiveState::new(Some(msg.source.clone()))));
        }

        warn!(host = %ctx.host(), challenger = %msg.source, "Re-asserting leadership");
        self.publish_leader(ctx);
        Transition::Stay
    }

    fn process_offline(&mut self, ctx: &mut StateContext<'_>, msg: &Offline) -> Transition {
        if msg.source == ctx.host() {
            return Transition::Stay;
        }
        if let Some(round) = &mut self.round {
            round.remove(&msg.source);
        }
        if self.members.remove(&msg.source) {
            info!(host = %ctx.host(), peer = %msg.source, "Member went offline, rebalancing");
            self.redistribute(ctx);
        }
        Transition::Stay
    }

    fn on_timer(&mut self, ctx: &mut StateContext<'_>, kind: TimerKind) -> Transition {
        match kind {
            TimerKind::LeaderHeartbeat => {
                let host = ctx.host().to_string();
                let now = ctx.now_ms();
                ctx.publish(ADMIN_CHANNEL, Message::heartbeat(host, ADMIN_CHANNEL, now));
            }
            TimerKind::ActiveCheck => {
                if !self.echo_seen {
                    warn!(host = %ctx.host(), "No leader traffic observed, re-publishing table");
                    self.publish_leader(ctx);
                }
                self.echo_seen = false;

                // members that died without an Offline only show up as
                // missing answers to a query
                if self.round.is_none() {
                    debug!(host = %ctx.host(), "Checking membership");
                    self.open_round(ctx);
                    let host = ctx.host().to_string();
                    ctx.publish_admin(Message::query(host));
                }
            }
            TimerKind::IdentificationWindow => {
                let Some(round) = self.round.take() else {
                    return Transition::Stay;
                };
                if round == self.members {
                    debug!(host = %ctx.host(), "Membership unchanged, re-publishing table");
                    self.publish_leader(ctx);
                } else {
                    info!(
                        host = %ctx.host(),
                        before = self.members.len(),
                        after = round.len(),
                        "Membership changed, rebalancing"
                    );
                    self.members = round;
                    self.redistribute(ctx);
                }
            }
            other => debug!(host = %ctx.host(), timer = %other, "Unexpected timer"),
        }
        Transition::Stay
    }
}
