//! Ownership balancing.
//!
//! A pure function from the current ownership table to the writes this
//! processor should attempt in the next cycle. No processor coordinates with
//! another: each one runs the same deterministic rule over the same table
//! and the fleet converges on an even split.
//!
//! Fair share over `P` partitions and `n` active owners is `min = P / n`,
//! with `extra = P % n` owners allowed `min + 1`. Active owners are the
//! identities holding at least one live lease or a live presence heartbeat,
//! plus this processor. Leases held by someone else are never claimed until
//! they expire or are released.

use std::collections::{BTreeMap, HashMap};

use eventflow_core::{
    compare_partition_ids, sort_partition_ids, PartitionOwnership, ProcessorPresence, StreamScope,
};

use crate::config::LoadBalancingStrategy;

/// Everything the balancer looks at for one decision.
#[derive(Debug, Clone, Copy)]
pub struct BalanceInput<'a> {
    pub scope: &'a StreamScope,
    pub owner_id: &'a str,
    /// Partition ids the stream currently reports.
    pub partition_ids: &'a [String],
    /// Ownership records as listed from the store.
    pub ownership: &'a [PartitionOwnership],
    /// Heartbeats as listed from the store.
    pub presence: &'a [ProcessorPresence],
    pub now_ms: u64,
    pub lease_duration_ms: u64,
    pub strategy: LoadBalancingStrategy,
}

/// Conditional writes for one cycle. Each record carries the stamp it was
/// derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipPlan {
    /// Fair share this processor is working towards.
    pub target: usize,
    /// Unowned or expired partitions to take.
    pub to_claim: Vec<PartitionOwnership>,
    /// Live leases to keep.
    pub to_renew: Vec<PartitionOwnership>,
    /// Live leases to give up.
    pub to_relinquish: Vec<PartitionOwnership>,
}

/// Computes this processor's claims, renewals and releases.
///
/// Records outside `scope` or for partitions the stream no longer reports
/// are ignored.
#[must_use]
pub fn plan_ownership(input: &BalanceInput<'_>) -> OwnershipPlan {
    let mut partition_ids = input.partition_ids.to_vec();
    sort_partition_ids(&mut partition_ids);

    let records: HashMap<&str, &PartitionOwnership> = input
        .ownership
        .iter()
        .filter(|r| r.is_in(input.scope))
        .map(|r| (r.partition_id.as_str(), r))
        .collect();

    let live_owner = |pid: &str| {
        records
            .get(pid)
            .and_then(|r| r.active_owner(input.now_ms, input.lease_duration_ms))
    };

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    counts.insert(input.owner_id, 0);
    for presence in input.presence {
        if presence.is_live(input.now_ms, input.lease_duration_ms) {
            counts.entry(presence.owner_id.as_str()).or_insert(0);
        }
    }
    let mut mine: Vec<&PartitionOwnership> = Vec::new();
    let mut claimable: Vec<&str> = Vec::new();

    for pid in &partition_ids {
        match live_owner(pid) {
            Some(owner) => {
                *counts.entry(owner).or_default() += 1;
                if owner == input.owner_id {
                    if let Some(&record) = records.get(pid.as_str()) {
                        mine.push(record);
                    }
                }
            }
            None => claimable.push(pid),
        }
    }

    let target = fair_share(&counts, input.owner_id, partition_ids.len());
    let held = mine.len();
    let mut plan = OwnershipPlan {
        target,
        ..OwnershipPlan::default()
    };

    if held > target {
        // Give up partitions without progress first, then the highest ids.
        mine.sort_by(|a, b| {
            a.checkpoint
                .is_some()
                .cmp(&b.checkpoint.is_some())
                .then_with(|| compare_partition_ids(&b.partition_id, &a.partition_id))
        });
        let excess = held - target;
        plan.to_relinquish = mine[..excess].iter().map(|r| r.relinquished()).collect();
        plan.to_renew = mine[excess..]
            .iter()
            .map(|r| r.claimed_by(input.owner_id))
            .collect();
        plan.to_renew
            .sort_by(|a, b| compare_partition_ids(&a.partition_id, &b.partition_id));
        return plan;
    }

    plan.to_renew = mine.iter().map(|r| r.claimed_by(input.owner_id)).collect();

    let wanted = match input.strategy {
        LoadBalancingStrategy::Balanced => (target - held).min(1),
        LoadBalancingStrategy::Greedy => target - held,
    };
    let has_checkpoint = |pid: &str| records.get(pid).is_some_and(|r| r.checkpoint.is_some());
    claimable.sort_by(|a, b| {
        has_checkpoint(*a)
            .cmp(&has_checkpoint(*b))
            .then_with(|| compare_partition_ids(a, b))
    });
    plan.to_claim = claimable
        .into_iter()
        .take(wanted)
        .map(|pid| {
            records
                .get(pid)
                .map_or_else(|| PartitionOwnership::new(input.scope, pid), |r| (*r).clone())
                .claimed_by(input.owner_id)
        })
        .collect();

    plan
}

/// Partitions `owner_id` should hold given each active owner's live count.
///
/// `counts` must contain `owner_id`. An owner may take one of the `extra`
/// slots while they are not all occupied; when more owners than `extra`
/// sit above `min`, only the first `extra` by identity keep the slot.
fn fair_share(counts: &BTreeMap<&str, usize>, owner_id: &str, partition_count: usize) -> usize {
    let owners = counts.len().max(1);
    let min = partition_count / owners;
    let extra = partition_count % owners;
    if extra == 0 {
        return min;
    }

    let own = counts.get(owner_id).copied().unwrap_or(0);
    let mut above = counts.iter().filter(|(_, &c)| c > min).map(|(id, _)| *id);
    let may_hold_extra = if own > min {
        above
            .position(|id| id == owner_id)
            .is_some_and(|rank| rank < extra)
    } else {
        above.count() < extra
    };
    min + usize::from(may_hold_extra)
}

/// Orders plans' partition ids for logging.
#[must_use]
pub fn partition_list(records: &[PartitionOwnership]) -> Vec<&str> {
    let mut ids: Vec<&str> = records.iter().map(|r| r.partition_id.as_str()).collect();
    ids.sort_by(|a, b| compare_partition_ids(a, b));
    ids
}

#[cfg(test)]
mod tests {
    use eventflow_core::Checkpoint;
    use proptest::prelude::*;

    use super::*;

    const LEASE: u64 = 30_000;
    const NOW: u64 = 1_000_000;

    fn scope() -> StreamScope {
        StreamScope::new("ns", "stream", "cg")
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| i.to_string()).collect()
    }

    fn owned(pid: &str, owner: &str, stamp: u64) -> PartitionOwnership {
        PartitionOwnership {
            owner_id: Some(owner.to_string()),
            last_modified_ms: Some(stamp),
            ..PartitionOwnership::new(&scope(), pid)
        }
    }

    fn with_checkpoint(mut record: PartitionOwnership) -> PartitionOwnership {
        record.checkpoint = Some(Checkpoint {
            partition_id: record.partition_id.clone(),
            offset: 10,
            sequence_number: 10,
            enqueued_time_ms: 1,
        });
        record
    }

    fn plan(
        owner: &str,
        partition_ids: &[String],
        ownership: &[PartitionOwnership],
        strategy: LoadBalancingStrategy,
    ) -> OwnershipPlan {
        plan_with_presence(owner, partition_ids, ownership, &[], strategy)
    }

    fn plan_with_presence(
        owner: &str,
        partition_ids: &[String],
        ownership: &[PartitionOwnership],
        presence: &[ProcessorPresence],
        strategy: LoadBalancingStrategy,
    ) -> OwnershipPlan {
        let scope = scope();
        plan_ownership(&BalanceInput {
            scope: &scope,
            owner_id: owner,
            partition_ids,
            ownership,
            presence,
            now_ms: NOW,
            lease_duration_ms: LEASE,
            strategy,
        })
    }

    fn claimed(plan: &OwnershipPlan) -> Vec<&str> {
        partition_list(&plan.to_claim)
    }

    #[test]
    fn lone_balanced_processor_claims_one_per_cycle() {
        let p = plan("a", &ids(4), &[], LoadBalancingStrategy::Balanced);
        assert_eq!(p.target, 4);
        assert_eq!(claimed(&p), vec!["0"]);
        assert!(p.to_claim[0].last_modified_ms.is_none());
        assert_eq!(p.to_claim[0].owner_id.as_deref(), Some("a"));
    }

    #[test]
    fn lone_greedy_processor_claims_everything() {
        let p = plan("a", &ids(4), &[], LoadBalancingStrategy::Greedy);
        assert_eq!(claimed(&p), vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn live_foreign_lease_is_never_claimed() {
        let table = vec![owned("0", "b", NOW - 10), owned("1", "b", NOW - 10)];
        let p = plan("a", &ids(2), &table, LoadBalancingStrategy::Greedy);
        assert_eq!(p.target, 1);
        assert!(p.to_claim.is_empty());
    }

    #[test]
    fn expired_lease_is_claimed_with_observed_stamp() {
        let table = vec![owned("0", "b", NOW - LEASE)];
        let p = plan("a", &ids(1), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(claimed(&p), vec!["0"]);
        assert_eq!(p.to_claim[0].last_modified_ms, Some(NOW - LEASE));
    }

    #[test]
    fn relinquished_record_is_claimable() {
        let table = vec![owned("0", "b", NOW - 1).relinquished()];
        let p = plan("a", &ids(1), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(claimed(&p), vec!["0"]);
    }

    #[test]
    fn own_leases_are_renewed_every_cycle() {
        let table = vec![owned("0", "a", NOW - 5_000), owned("1", "b", NOW - 5_000)];
        let p = plan("a", &ids(2), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(partition_list(&p.to_renew), vec!["0"]);
        assert_eq!(p.to_renew[0].last_modified_ms, Some(NOW - 5_000));
        assert!(p.to_claim.is_empty());
        assert!(p.to_relinquish.is_empty());
    }

    #[test]
    fn holder_of_everything_releases_down_when_a_peer_appears() {
        let mut table: Vec<_> = (0..6).map(|i| owned(&i.to_string(), "a", NOW - 1)).collect();
        table[0] = owned("0", "b", NOW - 1);
        let p = plan("a", &ids(6), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(p.target, 3);
        assert_eq!(p.to_relinquish.len(), 2);
        assert_eq!(p.to_renew.len(), 3);
        assert!(p.to_relinquish.iter().all(|r| r.owner_id.is_none()));
    }

    fn seen(owner: &str, at: u64) -> ProcessorPresence {
        ProcessorPresence {
            owner_id: owner.to_string(),
            last_seen_ms: at,
        }
    }

    #[test]
    fn idle_processor_with_live_heartbeat_counts_toward_fair_share() {
        let table: Vec<_> = (0..4).map(|i| owned(&i.to_string(), "a", NOW - 1)).collect();
        let presence = [seen("a", NOW - 1), seen("b", NOW - 1)];

        let a = plan_with_presence("a", &ids(4), &table, &presence, LoadBalancingStrategy::Balanced);
        assert_eq!(a.target, 2);
        assert_eq!(partition_list(&a.to_relinquish), vec!["2", "3"]);
        assert_eq!(partition_list(&a.to_renew), vec!["0", "1"]);

        let b = plan_with_presence("b", &ids(4), &table, &presence, LoadBalancingStrategy::Balanced);
        assert_eq!(b.target, 2);
        assert!(b.to_claim.is_empty());
    }

    #[test]
    fn lapsed_heartbeat_is_ignored() {
        let table: Vec<_> = (0..4).map(|i| owned(&i.to_string(), "a", NOW - 1)).collect();
        let presence = [seen("b", NOW - LEASE)];
        let a = plan_with_presence("a", &ids(4), &table, &presence, LoadBalancingStrategy::Balanced);
        assert_eq!(a.target, 4);
        assert!(a.to_relinquish.is_empty());
    }

    #[test]
    fn release_prefers_partitions_without_checkpoint_then_highest_id() {
        let table = vec![
            owned("0", "a", NOW - 1),
            with_checkpoint(owned("1", "a", NOW - 1)),
            owned("2", "a", NOW - 1),
            with_checkpoint(owned("3", "a", NOW - 1)),
            owned("4", "b", NOW - 1),
            owned("5", "b", NOW - 1),
        ];
        // Six partitions, two owners: a keeps three of its four.
        let p = plan("a", &ids(6), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(partition_list(&p.to_relinquish), vec!["2"]);
        assert_eq!(partition_list(&p.to_renew), vec!["0", "1", "3"]);
    }

    #[test]
    fn claim_prefers_partitions_without_checkpoint_history() {
        let table = vec![
            with_checkpoint(owned("0", "gone", NOW - LEASE * 2)),
            owned("1", "gone", NOW - LEASE * 2),
        ];
        let p = plan("a", &ids(2), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(claimed(&p), vec!["1"]);
    }

    #[test]
    fn extra_slot_goes_to_first_owners_by_identity() {
        // 5 partitions over a, b: min 2, one extra slot.
        let table = vec![
            owned("0", "a", NOW - 1),
            owned("1", "a", NOW - 1),
            owned("2", "a", NOW - 1),
            owned("3", "b", NOW - 1),
            owned("4", "b", NOW - 1),
        ];
        let a = plan("a", &ids(5), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(a.target, 3);
        assert!(a.to_relinquish.is_empty());
        let b = plan("b", &ids(5), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(b.target, 2);
        assert!(b.to_claim.is_empty());
    }

    #[test]
    fn later_identity_gives_back_contested_extra_slot() {
        // 7 partitions over a, b, c: min 2, one extra slot, claimed by both a and b.
        let mut table: Vec<_> = (0..3).map(|i| owned(&i.to_string(), "a", NOW - 1)).collect();
        table.extend((3..6).map(|i| owned(&i.to_string(), "b", NOW - 1)));
        table.push(owned("6", "c", NOW - 1));

        let a = plan("a", &ids(7), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(a.target, 3);
        assert!(a.to_relinquish.is_empty());

        let b = plan("b", &ids(7), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(b.target, 2);
        assert_eq!(b.to_relinquish.len(), 1);

        let c = plan("c", &ids(7), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(c.target, 2);
        assert!(c.to_claim.is_empty());
    }

    #[test]
    fn open_extra_slots_are_not_contested() {
        // 5 partitions over a, b, c: min 1, two extra slots. c may not take one.
        let table = vec![
            owned("0", "a", NOW - 1),
            owned("1", "a", NOW - 1),
            owned("2", "b", NOW - 1),
            owned("3", "b", NOW - 1),
            owned("4", "c", NOW - 1),
        ];
        let c = plan("c", &ids(5), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(c.target, 1);
        assert!(c.to_relinquish.is_empty());
    }

    #[test]
    fn foreign_scope_and_vanished_partitions_are_ignored() {
        let mut other = owned("0", "b", NOW - 1);
        other.consumer_group = "other-group".to_string();
        let table = vec![other, owned("9", "a", NOW - 1)];
        let p = plan("a", &ids(1), &table, LoadBalancingStrategy::Balanced);
        assert_eq!(claimed(&p), vec!["0"]);
        assert!(p.to_renew.is_empty());
        assert!(p.to_relinquish.is_empty());
    }

    #[test]
    fn no_partitions_means_no_work() {
        let p = plan("a", &[], &[], LoadBalancingStrategy::Greedy);
        assert_eq!(p, OwnershipPlan::default());
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    /// Applies a plan to a table keyed by partition id with compare-and-set
    /// on the stamp, as a store would.
    fn apply(table: &mut HashMap<String, PartitionOwnership>, plan: &OwnershipPlan, stamp: &mut u64) {
        for request in plan
            .to_claim
            .iter()
            .chain(&plan.to_renew)
            .chain(&plan.to_relinquish)
        {
            let current = table.get(&request.partition_id).and_then(|r| r.last_modified_ms);
            if current == request.last_modified_ms {
                *stamp += 1;
                let mut stored = request.clone();
                stored.last_modified_ms = Some(*stamp);
                table.insert(request.partition_id.clone(), stored);
            }
        }
    }

    /// Runs `early` processors for `rounds` rounds, then adds `late` ones
    /// and runs `rounds` more. Each processor heartbeats after its turn.
    fn run_fleet(partitions: usize, early: usize, late: usize, rounds: usize) -> BTreeMap<String, usize> {
        let scope = scope();
        let partition_ids = ids(partitions);
        let owners: Vec<String> = (0..early + late).map(|i| format!("p{i:02}")).collect();
        let mut table: HashMap<String, PartitionOwnership> = HashMap::new();
        let mut heartbeats: BTreeMap<String, u64> = BTreeMap::new();
        let mut stamp = 1u64;

        let phases = [(&owners[..early], rounds), (&owners[..], if late == 0 { 0 } else { rounds })];
        for (active, rounds) in phases {
            for _ in 0..rounds {
                for owner in active {
                    let snapshot: Vec<_> = table.values().cloned().collect();
                    let presence: Vec<ProcessorPresence> =
                        heartbeats.iter().map(|(o, at)| seen(o, *at)).collect();
                    let plan = plan_ownership(&BalanceInput {
                        scope: &scope,
                        owner_id: owner,
                        partition_ids: &partition_ids,
                        ownership: &snapshot,
                        presence: &presence,
                        now_ms: stamp,
                        lease_duration_ms: u64::MAX / 2,
                        strategy: LoadBalancingStrategy::Balanced,
                    });
                    apply(&mut table, &plan, &mut stamp);
                    heartbeats.insert(owner.clone(), stamp);
                }
            }
        }

        let mut counts: BTreeMap<String, usize> = owners.iter().map(|o| (o.clone(), 0)).collect();
        for record in table.values() {
            if let Some(owner) = &record.owner_id {
                *counts.entry(owner.clone()).or_default() += 1;
            }
        }
        counts
    }

    proptest! {
        #[test]
        fn balanced_fleet_converges_to_floor_or_ceil(
            partitions in 1usize..40,
            processors in 1usize..7,
        ) {
            let counts = run_fleet(partitions, processors, 0, partitions * 2 + 10);
            let total: usize = counts.values().sum();
            prop_assert_eq!(total, partitions);
            let floor = partitions / processors;
            let ceil = partitions.div_ceil(processors);
            for (owner, count) in &counts {
                prop_assert!(
                    *count == floor || *count == ceil,
                    "{} holds {} of {} over {} owners", owner, count, partitions, processors
                );
            }
        }

        #[test]
        fn converged_fleet_is_stable(partitions in 1usize..24, processors in 1usize..5) {
            let first = run_fleet(partitions, processors, 0, partitions * 2 + 10);
            let later = run_fleet(partitions, processors, 0, partitions * 2 + 20);
            prop_assert_eq!(first, later);
        }

        #[test]
        fn late_joiners_get_a_fair_share(
            partitions in 1usize..30,
            early in 1usize..4,
            late in 1usize..4,
        ) {
            let counts = run_fleet(partitions, early, late, partitions * 2 + 10);
            let total: usize = counts.values().sum();
            prop_assert_eq!(total, partitions);
            let processors = early + late;
            let floor = partitions / processors;
            let ceil = partitions.div_ceil(processors);
            for (owner, count) in &counts {
                prop_assert!(
                    *count == floor || *count == ceil,
                    "{} holds {} of {} over {} owners", owner, count, partitions, processors
                );
            }
        }

        #[test]
        fn never_claims_or_releases_a_foreign_live_lease(
            rows in prop::collection::vec((0u8..5, any::<bool>(), any::<bool>()), 1..24),
            greedy in any::<bool>(),
        ) {
            const OWNERS: [&str; 4] = ["self", "b", "c", "d"];
            let partition_ids = ids(rows.len());
            let table: Vec<PartitionOwnership> = rows
                .iter()
                .enumerate()
                .filter_map(|(i, (owner, live, checkpointed))| {
                    let owner = OWNERS.get(usize::from(*owner))?;
                    let stamp = if *live { NOW - 1 } else { NOW - LEASE };
                    let record = owned(&i.to_string(), owner, stamp);
                    Some(if *checkpointed { with_checkpoint(record) } else { record })
                })
                .collect();
            let strategy = if greedy { LoadBalancingStrategy::Greedy } else { LoadBalancingStrategy::Balanced };
            let p = plan("self", &partition_ids, &table, strategy);

            for request in &p.to_claim {
                let observed = table.iter().find(|r| r.partition_id == request.partition_id);
                prop_assert!(!observed.is_some_and(|r| r.active_owner(NOW, LEASE).is_some()));
            }
            for request in p.to_renew.iter().chain(&p.to_relinquish) {
                let observed = table.iter().find(|r| r.partition_id == request.partition_id);
                prop_assert!(observed.is_some_and(|r| r.is_owned_by("self", NOW, LEASE)));
            }
            prop_assert!(p.to_claim.len() + p.to_renew.len() <= p.target.max(p.to_renew.len()));
        }
    }
}
