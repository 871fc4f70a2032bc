//! Bucket assignment table
//!
//! A fixed-size array mapping each bucket to the host that owns it. Tables are
//! computed by the leader, broadcast whole, and never edited in place: every
//! change produces a fresh table that replaces the previous one.

use crate::hash::bucket_of;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Opaque host identifier, unique across the pool
pub type HostId = String;

/// Bucket-to-host assignment table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketAssignments {
    hosts: Vec<Option<HostId>>,
}

impl BucketAssignments {
    /// Wrap an explicit bucket array
    pub fn new(hosts: Vec<Option<HostId>>) -> Self {
        Self { hosts }
    }

    /// Table of `size` buckets with no owners
    pub fn unassigned(size: usize) -> Self {
        Self {
            hosts: vec![None; size],
        }
    }

    /// Number of buckets
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Owner of the bucket a routing value hashes to
    pub fn host_for(&self, routing_value: &str) -> Option<&HostId> {
        if self.hosts.is_empty() {
            return None;
        }
        self.host_for_bucket(bucket_of(routing_value, self.hosts.len()))
    }

    /// Owner of a bucket; `None` when unassigned or out of range
    pub fn host_for_bucket(&self, index: usize) -> Option<&HostId> {
        self.hosts.get(index).and_then(Option::as_ref)
    }

    /// Every host that owns at least one bucket
    pub fn all_hosts(&self) -> BTreeSet<HostId> {
        self.hosts.iter().flatten().cloned().collect()
    }

    /// True when every bucket has an owner drawn from `known_hosts`
    pub fn is_complete(&self, known_hosts: &BTreeSet<HostId>) -> bool {
        !self.hosts.is_empty()
            && self
                .hosts
                .iter()
                .all(|h| h.as_ref().is_some_and(|h| known_hosts.contains(h)))
    }

    /// True when no bucket is left without an owner
    pub fn is_fully_assigned(&self) -> bool {
        !self.hosts.is_empty() && self.hosts.iter().all(Option::is_some)
    }

    pub fn has_assignment(&self, host: &str) -> bool {
        self.hosts.iter().flatten().any(|h| h == host)
    }

    /// Number of buckets owned by `host`
    pub fn bucket_count(&self, host: &str) -> usize {
        self.hosts.iter().flatten().filter(|h| *h == host).count()
    }

    /// Bucket count per owning host
    pub fn load(&self) -> BTreeMap<HostId, usize> {
        let mut load = BTreeMap::new();
        for host in self.hosts.iter().flatten() {
            *load.entry(host.clone()).or_insert(0) += 1;
        }
        load
    }

    /// Compute a balanced table of `size` buckets over `members`.
    ///
    /// Buckets whose owner in `previous` is still a member keep that owner.
    /// Free buckets go to the least-loaded member (lowest id on ties), then
    /// buckets move from the most- to the least-loaded member until loads
    /// differ by at most one. A table that is already balanced over exactly
    /// `members` comes back unchanged.
    pub fn rebalanced(
        previous: Option<&BucketAssignments>,
        size: usize,
        members: &BTreeSet<HostId>,
    ) -> BucketAssignments {
        if members.is_empty() {
            return BucketAssignments::unassigned(size);
        }

        let mut owned: BTreeMap<&HostId, BTreeSet<usize>> =
            members.iter().map(|m| (m, BTreeSet::new())).collect();
        let mut free = Vec::new();

        for index in 0..size {
            let owner = previous
                .filter(|p| p.len() == size)
                .and_then(|p| p.host_for_bucket(index))
                .and_then(|h| members.get(h));
            match owner {
                Some(host) => {
                    if let Some(buckets) = owned.get_mut(host) {
                        buckets.insert(index);
                    }
                }
                None => free.push(index),
            }
        }

        for index in free {
            if let Some(host) = least_loaded(&owned) {
                if let Some(buckets) = owned.get_mut(host) {
                    buckets.insert(index);
                }
            }
        }

        loop {
            let (Some(most), Some(least)) = (most_loaded(&owned), least_loaded(&owned)) else {
                break;
            };
            if owned[most].len() <= owned[least].len() + 1 {
                break;
            }
            let moved = owned.get_mut(most).and_then(BTreeSet::pop_last);
            match moved {
                Some(index) => {
                    if let Some(buckets) = owned.get_mut(least) {
                        buckets.insert(index);
                    }
                }
                None => break,
            }
        }

        let mut hosts = vec![None; size];
        for (host, buckets) in owned {
            for index in buckets {
                hosts[index] = Some(host.clone());
            }
        }
        BucketAssignments { hosts }
    }
}

fn least_loaded<'a>(owned: &BTreeMap<&'a HostId, BTreeSet<usize>>) -> Option<&'a HostId> {
    // BTreeMap iterates in id order, so min_by_key keeps the lowest id on ties
    owned
        .iter()
        .min_by_key(|(_, buckets)| buckets.len())
        .map(|(host, _)| *host)
}

fn most_loaded<'a>(owned: &BTreeMap<&'a HostId, BTreeSet<usize>>) -> Option<&'a HostId> {
    // max_by_key returns the last maximum, i.e. the highest id on ties
    owned
        .iter()
        .max_by_key(|(_, buckets)| buckets.len())
        .map(|(host, _)| *host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[&str]) -> BTreeSet<HostId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn table(ids: &[Option<&str>]) -> BucketAssignments {
        BucketAssignments::new(ids.iter().map(|h| h.map(String::from)).collect())
    }

    #[test]
    fn test_lookup() {
        let t = table(&[Some("a"), None, Some("b")]);
        assert_eq!(t.len(), 3);
        assert_eq!(t.host_for_bucket(0).map(String::as_str), Some("a"));
        assert_eq!(t.host_for_bucket(1), None);
        assert_eq!(t.host_for_bucket(9), None);
        assert_eq!(t.all_hosts(), members(&["a", "b"]));
        assert!(t.has_assignment("b"));
        assert!(!t.has_assignment("c"));
        assert_eq!(t.bucket_count("a"), 1);
        assert!(!t.is_fully_assigned());
        assert!(!t.is_complete(&members(&["a", "b"])));
    }

    #[test]
    fn test_host_for_is_deterministic() {
        let t = BucketAssignments::rebalanced(None, 64, &members(&["h1", "h2", "h3"]));
        let first = t.host_for("request-7").cloned();
        assert!(first.is_some());
        for _ in 0..10 {
            assert_eq!(t.host_for("request-7").cloned(), first);
        }
        assert_eq!(BucketAssignments::unassigned(0).host_for("x"), None);
    }

    #[test]
    fn test_is_complete() {
        let t = table(&[Some("a"), Some("b")]);
        assert!(t.is_complete(&members(&["a", "b", "c"])));
        assert!(!t.is_complete(&members(&["a"])));
        assert!(!BucketAssignments::unassigned(0).is_complete(&members(&["a"])));
    }

    #[test]
    fn test_rebalanced_from_scratch() {
        let t = BucketAssignments::rebalanced(None, 10, &members(&["a", "b", "c"]));
        assert!(t.is_fully_assigned());
        let load = t.load();
        assert_eq!(load["a"], 4);
        assert_eq!(load["b"], 3);
        assert_eq!(load["c"], 3);
    }

    #[test]
    fn test_rebalanced_keeps_surviving_owners() {
        let before = BucketAssignments::rebalanced(None, 12, &members(&["a", "b", "c"]));
        let after = BucketAssignments::rebalanced(Some(&before), 12, &members(&["a", "c"]));

        assert!(!after.has_assignment("b"));
        assert_eq!(after.bucket_count("a"), 6);
        assert_eq!(after.bucket_count("c"), 6);
        for i in 0..12 {
            let prev = before.host_for_bucket(i).unwrap();
            if prev != "b" {
                assert_eq!(after.host_for_bucket(i), Some(prev));
            }
        }
    }

    #[test]
    fn test_rebalanced_balanced_table_unchanged() {
        let before = BucketAssignments::rebalanced(None, 1024, &members(&["a", "b", "c"]));
        let again = BucketAssignments::rebalanced(Some(&before), 1024, &members(&["a", "b", "c"]));
        assert_eq!(before, again);
    }

    #[test]
    fn test_rebalanced_new_member_takes_share() {
        let before = BucketAssignments::rebalanced(None, 9, &members(&["a", "b"]));
        let after = BucketAssignments::rebalanced(Some(&before), 9, &members(&["a", "b", "c"]));
        let load = after.load();
        assert_eq!(load.values().sum::<usize>(), 9);
        assert_eq!(load["c"], 3);
        let max = load.values().max().unwrap();
        let min = load.values().min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn test_rebalanced_size_mismatch_starts_fresh() {
        let before = BucketAssignments::rebalanced(None, 4, &members(&["a"]));
        let after = BucketAssignments::rebalanced(Some(&before), 6, &members(&["b"]));
        assert_eq!(after.len(), 6);
        assert_eq!(after.bucket_count("b"), 6);
    }

    #[test]
    fn test_rebalanced_no_members() {
        let t = BucketAssignments::rebalanced(None, 4, &BTreeSet::new());
        assert_eq!(t.len(), 4);
        assert!(t.all_hosts().is_empty());
    }

    #[test]
    fn test_serde_shape() {
        let t = table(&[Some("a"), None]);
        assert_eq!(serde_json::to_string(&t).unwrap(), r#"["a",null]"#);
        let back: BucketAssignments = serde_json::from_str(r#"["a",null]"#).unwrap();
        assert_eq!(back, t);
    }
}
