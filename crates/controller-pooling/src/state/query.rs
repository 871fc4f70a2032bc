use super::{ActiveState, InactiveState, State, StateContext, StateKind, Transition};
use crate::assignments::{BucketAssignments, HostId};
use crate::message::{Heartbeat, Identification, Leader, Message, Offline, Query};
use crate::scheduler::TimerKind;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Discovers which hosts are alive and which tables they hold, then elects
/// the host with the lowest id as leader.
#[derive(Debug)]
pub struct QueryState {
    alive: BTreeSet<HostId>,
    leader_tables: BTreeMap<HostId, Arc<BucketAssignments>>,
    identified_tables: BTreeMap<HostId, Arc<BucketAssignments>>,
    seed: Option<Arc<BucketAssignments>>,
}

impl QueryState {
    /// `seed` is a table learned before entering the state, used when no
    /// peer offers a better one
    pub fn new(seed: Option<Arc<BucketAssignments>>) -> Self {
        Self {
            alive: BTreeSet::new(),
            leader_tables: BTreeMap::new(),
            identified_tables: BTreeMap::new(),
            seed,
        }
    }

    /// Hosts heard from so far (including this one)
    pub fn alive(&self) -> &BTreeSet<HostId> {
        &self.alive
    }

    fn mark_alive(&mut self, host: &str) {
        if !self.alive.contains(host) {
            debug!(peer = host, "Host is alive");
            self.alive.insert(host.to_string());
        }
    }

    /// Leader tables outrank identification tables; within a rank the lowest
    /// source id wins.
    fn best_candidate(&self, ctx: &StateContext<'_>) -> Option<Arc<BucketAssignments>> {
        self.leader_tables
            .values()
            .next()
            .or_else(|| self.identified_tables.values().next())
            .cloned()
            .or_else(|| ctx.assignments())
            .or_else(|| self.seed.clone())
    }
}

impl State for QueryState {
    fn kind(&self) -> StateKind {
        StateKind::Query
    }

    fn start(&mut self, ctx: &mut StateContext<'_>) {
        self.alive.insert(ctx.host().to_string());

        let host = ctx.host().to_string();
        ctx.publish_admin(Message::query(host));
        ctx.publish_identification();

        let window = ctx.config().identification();
        ctx.schedule(window, TimerKind::IdentificationWindow);
    }

    fn process_heartbeat(&mut self, _ctx: &mut StateContext<'_>, msg: &Heartbeat) -> Transition {
        self.mark_alive(&msg.source);
        Transition::Stay
    }

    fn process_query(&mut self, ctx: &mut StateContext<'_>, msg: &Query) -> Transition {
        self.mark_alive(&msg.source);
        if msg.source != ctx.host() {
            ctx.publish_identification();
        }
        Transition::Stay
    }

    fn process_identification(
        &mut self,
        ctx: &mut StateContext<'_>,
        msg: &Identification,
    ) -> Transition {
        self.mark_alive(&msg.source);
        if let Some(table) = &msg.assignments {
            if ctx.accepts_table(table) {
                self.identified_tables
                    .insert(msg.source.clone(), Arc::new(table.clone()));
            }
        }
        Transition::Stay
    }

    fn process_leader(&mut self, ctx: &mut StateContext<'_>, msg: &Leader) -> Transition {
        self.mark_alive(&msg.source);
        if ctx.accepts_table(&msg.assignments) {
            self.leader_tables
                .insert(msg.source.clone(), Arc::new(msg.assignments.clone()));
        }
        Transition::Stay
    }

    fn process_offline(&mut self, ctx: &mut StateContext<'_>, msg: &Offline) -> Transition {
        if msg.source != ctx.host() {
            debug!(host = %ctx.host(), peer = %msg.source, "Host went offline during query");
            self.alive.remove(&msg.source);
            self.leader_tables.remove(&msg.source);
            self.identified_tables.remove(&msg.source);
        }
        Transition::Stay
    }

    fn on_timer(&mut self, ctx: &mut StateContext<'_>, kind: TimerKind) -> Transition {
        if kind != TimerKind::IdentificationWindow {
            return Transition::Stay;
        }

        let best = self.best_candidate(ctx);
        let leader = match self.alive.first() {
            Some(leader) => leader.clone(),
            None => ctx.host().to_string(),
        };

        info!(
            host = %ctx.host(),
            %leader,
            alive = self.alive.len(),
            "Identification window closed"
        );

        if leader == ctx.host() {
            let members = std::mem::take(&mut self.alive);
            return Transition::To(Box::new(ActiveState::new(members, best)));
        }

        if ctx.assignments().is_none() {
            if let Some(table) = best {
                ctx.start_distributing(table);
            }
        }
        Transition::To(Box::new(InactiveState::new(Some(leader))))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    fn ident(source: &str, table: Option<Arc<BucketAssignments>>) -> Identification {
        Identification {
            channel: "admin".into(),
            source: source.into(),
            assignments: table.map(|t| (*t).clone()),
        }
    }

    #[tokio::test]
    async fn test_start_announces() {
        let mut h = Harness::new("h2");
        let mut query = QueryState::new(None);
        h.enter(&mut query);

        let published = h.take_published();
        assert!(matches!(published[0], Message::Query(_)));
        assert!(matches!(published[1], Message::Identification(_)));
        assert_eq!(h.scheduler.pending(), 1);
        assert!(query.alive().contains("h2"));
    }

    #[tokio::test]
    async fn test_lowest_id_becomes_active() {
        let mut h = Harness::new("h1");
        let mut query = QueryState::new(None);
        h.enter(&mut query);
        query.process_identification(&mut h.ctx(), &ident("h3", None));
        query.process_identification(&mut h.ctx(), &ident("h2", None));

        let t = query.on_timer(&mut h.ctx(), TimerKind::IdentificationWindow);
        assert_eq!(next_kind(t), Some(StateKind::Active));
    }

    #[tokio::test]
    async fn test_higher_id_goes_inactive_with_best_table() {
        let mut h = Harness::new("h3");
        let mut query = QueryState::new(None);
        h.enter(&mut query);

        let ident_table = balanced(&["h2", "h3"], 8);
        let leader_table = balanced(&["h1", "h2", "h3"], 8);
        query.process_identification(&mut h.ctx(), &ident("h2", Some(ident_table)));
        query.process_leader(
            &mut h.ctx(),
            &Leader {
                channel: "admin".into(),
                source: "h1".into(),
                assignments: (*leader_table).clone(),
            },
        );

        let t = query.on_timer(&mut h.ctx(), TimerKind::IdentificationWindow);
        assert_eq!(next_kind(t), Some(StateKind::Inactive));
        assert_eq!(h.table.as_deref(), Some(&*leader_table));
    }

    #[tokio::test]
    async fn test_identification_tables_rank_by_lowest_source() {
        let mut h = Harness::new("h9");
        let mut query = QueryState::new(None);
        h.enter(&mut query);

        let from_h5 = balanced(&["h5"], 8);
        let from_h4 = balanced(&["h4"], 8);
        query.process_identification(&mut h.ctx(), &ident("h5", Some(from_h5)));
        query.process_identification(&mut h.ctx(), &ident("h4", Some(from_h4.clone())));

        query.on_timer(&mut h.ctx(), TimerKind::IdentificationWindow);
        assert_eq!(h.table.as_deref(), Some(&*from_h4));
    }

    #[tokio::test]
    async fn test_offline_peer_not_elected() {
        let mut h = Harness::new("h2");
        let mut query = QueryState::new(None);
        h.enter(&mut query);
        query.process_identification(&mut h.ctx(), &ident("h1", None));
        query.process_offline(
            &mut h.ctx(),
            &Offline {
                channel: "admin".into(),
                source: "h1".into(),
            },
        );

        let t = query.on_timer(&mut h.ctx(), TimerKind::IdentificationWindow);
        assert_eq!(next_kind(t), Some(StateKind::Active));
    }

    #[tokio::test]
    async fn test_answers_peer_query_only() {
        let mut h = Harness::new("h2");
        let mut query = QueryState::new(None);
        h.enter(&mut query);
        h.take_published();

        let own = Query {
            channel: "admin".into(),
            source: "h2".into(),
        };
        query.process_query(&mut h.ctx(), &own);
        assert!(h.take_published().is_empty());

        let peer = Query {
            channel: "admin".into(),
            source: "h3".into(),
        };
        query.process_query(&mut h.ctx(), &peer);
        let published = h.take_published();
        assert_eq!(published.len(), 1);
        assert!(matches!(published[0], Message::Identification(_)));
        assert!(query.alive().contains("h3"));
    }

    #[tokio::test]
    async fn test_wrong_size_table_ignored() {
        let mut h = Harness::new("h3");
        let mut query = QueryState::new(None);
        h.enter(&mut query);
        query.process_identification(&mut h.ctx(), &ident("h1", Some(balanced(&["h1"], 4))));

        let t = query.on_timer(&mut h.ctx(), TimerKind::IdentificationWindow);
        assert_eq!(next_kind(t), Some(StateKind::Inactive));
        assert!(h.table.is_none());
    }
}
