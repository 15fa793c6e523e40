//! The renewal loop: one balancing cycle per tick.
//!
//! Each cycle lists ownership and heartbeats, heartbeats itself, discovers
//! partitions, runs the balancer, writes the resulting claims, renewals and
//! releases, and then reconciles the running pumps with the set of
//! partitions confirmed owned.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use eventflow_core::{sort_partition_ids, ClaimOutcome, ClockSource, PartitionOwnership};

use crate::balancer::{partition_list, plan_ownership, BalanceInput};
use crate::handlers::StopReason;
use crate::partitions::{Discovery, PartitionCache};
use crate::pump::{PartitionPump, PumpContext, PumpExited};
use crate::worker::BackgroundRunnable;

/// Balancing state owned by the renewal loop task.
pub(crate) struct OwnershipCycle {
    ctx: Arc<PumpContext>,
    clock: Arc<dyn ClockSource>,
    partitions: PartitionCache,
    pumps: HashMap<String, PartitionPump>,
    /// Last confirmed record per owned partition, carrying the current stamp.
    owned: HashMap<String, PartitionOwnership>,
    /// Parent of every pump's stop token.
    token: CancellationToken,
}

impl OwnershipCycle {
    pub(crate) fn new(ctx: Arc<PumpContext>, clock: Arc<dyn ClockSource>, token: CancellationToken) -> Self {
        let partitions = PartitionCache::new(ctx.options.partition_refresh_interval);
        Self {
            ctx,
            clock,
            partitions,
            pumps: HashMap::new(),
            owned: HashMap::new(),
            token,
        }
    }

    async fn report(&self, operation: &str, error: anyhow::Error) {
        warn!(operation, error = %error, "ownership cycle step failed");
        self.ctx.handlers.process_error(None, operation, error).await;
    }

    async fn discover_partitions(&mut self) -> Option<Vec<String>> {
        let (ids, error) = match self.partitions.discover(self.ctx.connection.as_ref()).await {
            Discovery::Current(ids) => (Some(ids.to_vec()), None),
            Discovery::Stale(ids, error) => (Some(ids.to_vec()), Some(error)),
            Discovery::Unavailable(error) => (None, Some(error)),
        };
        if let Some(error) = error {
            self.report("discover partitions", error).await;
        }
        ids
    }

    /// Drops handles of pumps that exited on their own.
    async fn reap_finished(&mut self) {
        let finished: Vec<String> = self
            .pumps
            .iter()
            .filter(|(_, pump)| pump.is_finished())
            .map(|(pid, _)| pid.clone())
            .collect();
        for pid in finished {
            if let Some(pump) = self.pumps.remove(&pid) {
                let state = pump.join(self.ctx.options.shutdown_timeout).await;
                debug!(partition_id = %pid, ?state, "reaped partition pump");
            }
        }
    }

    /// Stops the given pumps concurrently with `reason`.
    async fn stop_pumps(&mut self, partition_ids: &[String], reason: StopReason) {
        let grace = self.ctx.options.shutdown_timeout;
        let stopping: Vec<_> = partition_ids
            .iter()
            .filter_map(|pid| self.pumps.remove(pid))
            .map(|pump| {
                debug!(
                    partition_id = pump.partition_id(),
                    reason = %reason,
                    last_checkpoint_offset = ?pump.last_checkpoint().map(|c| c.offset),
                    "stopping partition pump"
                );
                pump.stop(reason, grace)
            })
            .collect();
        if !stopping.is_empty() {
            join_all(stopping).await;
        }
    }

    fn start_pump(&mut self, partition_id: &str) {
        if self.pumps.contains_key(partition_id) {
            return;
        }
        let pump = PartitionPump::start(Arc::clone(&self.ctx), partition_id, &self.token);
        self.pumps.insert(partition_id.to_string(), pump);
    }

    /// Writes a claim or renewal. Returns `true` if the partition is
    /// confirmed owned afterwards.
    async fn write_claim(&mut self, request: PartitionOwnership, renewal: bool) -> bool {
        let pid = request.partition_id.clone();
        match self.ctx.store.claim_ownership(request).await {
            Ok(ClaimOutcome::Claimed(record)) => {
                if !renewal {
                    metrics::counter!("eventflow_ownership_claims_total").increment(1);
                    info!(partition_id = %pid, "claimed partition");
                }
                self.owned.insert(pid, record);
                true
            }
            Ok(ClaimOutcome::Conflict) => {
                metrics::counter!("eventflow_ownership_conflicts_total").increment(1);
                if renewal {
                    info!(partition_id = %pid, "lease renewal lost to another processor");
                } else {
                    debug!(partition_id = %pid, "claim lost to another processor");
                }
                self.owned.remove(&pid);
                false
            }
            Err(error) => {
                let operation = if renewal { "renew ownership" } else { "claim ownership" };
                self.report(operation, error).await;
                // A failed renewal keeps the partition while the last confirmed lease is live.
                renewal && self.lease_still_live(&pid)
            }
        }
    }

    fn lease_still_live(&self, partition_id: &str) -> bool {
        let now = self.clock.now();
        let lease = self.ctx.options.ownership_expiration_ms();
        self.owned
            .get(partition_id)
            .is_some_and(|r| r.is_owned_by(&self.ctx.owner_id, now, lease))
    }

    /// Writes a release request derived from an observed record.
    async fn relinquish(&mut self, request: PartitionOwnership) {
        let pid = request.partition_id.clone();
        self.owned.remove(&pid);
        match self.ctx.store.claim_ownership(request).await {
            Ok(ClaimOutcome::Claimed(_)) => info!(partition_id = %pid, "relinquished partition"),
            Ok(ClaimOutcome::Conflict) => debug!(partition_id = %pid, "partition changed hands before release"),
            Err(error) => self.report("relinquish ownership", error).await,
        }
    }

    async fn cycle(&mut self) {
        self.reap_finished().await;
        if self.token.is_cancelled() {
            return;
        }

        let ownership = match self.ctx.store.list_ownership(&self.ctx.scope).await {
            Ok(records) => records,
            Err(error) => {
                self.report("list ownership", error).await;
                return;
            }
        };
        let presence = match self.ctx.store.list_presence(&self.ctx.scope).await {
            Ok(presence) => presence,
            Err(error) => {
                self.report("list presence", error).await;
                Vec::new()
            }
        };
        if let Err(error) = self
            .ctx
            .store
            .announce_presence(&self.ctx.scope, &self.ctx.owner_id)
            .await
        {
            self.report("announce presence", error).await;
        }
        let Some(partition_ids) = self.discover_partitions().await else {
            return;
        };

        let plan = plan_ownership(&BalanceInput {
            scope: &self.ctx.scope,
            owner_id: &self.ctx.owner_id,
            partition_ids: &partition_ids,
            ownership: &ownership,
            presence: &presence,
            now_ms: self.clock.now(),
            lease_duration_ms: self.ctx.options.ownership_expiration_ms(),
            strategy: self.ctx.options.load_balancing_strategy,
        });
        debug!(
            target_count = plan.target,
            claim = ?partition_list(&plan.to_claim),
            renew = ?partition_list(&plan.to_renew),
            relinquish = ?partition_list(&plan.to_relinquish),
            "balancing plan"
        );

        let releasing: Vec<String> = plan
            .to_relinquish
            .iter()
            .map(|r| r.partition_id.clone())
            .collect();
        self.stop_pumps(&releasing, StopReason::OwnershipLost).await;
        for request in plan.to_relinquish {
            self.relinquish(request).await;
        }

        let mut confirmed: HashSet<String> = HashSet::new();
        for request in plan.to_renew {
            let pid = request.partition_id.clone();
            if self.write_claim(request, true).await {
                confirmed.insert(pid);
            }
        }
        for request in plan.to_claim {
            let pid = request.partition_id.clone();
            if self.write_claim(request, false).await {
                confirmed.insert(pid);
            }
        }

        let lost: Vec<String> = self
            .pumps
            .keys()
            .filter(|pid| !confirmed.contains(*pid))
            .cloned()
            .collect();
        if !lost.is_empty() {
            info!(partitions = ?lost, "stopping pumps for partitions no longer owned");
            self.stop_pumps(&lost, StopReason::OwnershipLost).await;
        }
        self.owned.retain(|pid, _| confirmed.contains(pid));

        if self.token.is_cancelled() {
            return;
        }
        let mut to_start: Vec<String> = confirmed.into_iter().collect();
        sort_partition_ids(&mut to_start);
        for pid in &to_start {
            self.start_pump(pid);
        }

        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("eventflow_owned_partitions").set(self.owned.len() as f64);
    }
}

#[async_trait::async_trait]
impl BackgroundRunnable for OwnershipCycle {
    type Task = PumpExited;

    async fn run(&mut self, exited: PumpExited) {
        let terminal = self
            .pumps
            .get(&exited.partition_id)
            .is_some_and(|pump| pump.state().is_terminal());
        if !terminal {
            return;
        }
        if let Some(pump) = self.pumps.remove(&exited.partition_id) {
            pump.join(self.ctx.options.shutdown_timeout).await;
        }
        if exited.reason == StopReason::OwnershipLost {
            self.owned.remove(&exited.partition_id);
        }
        debug!(
            partition_id = %exited.partition_id,
            reason = %exited.reason,
            "partition pump exited, restart considered next cycle"
        );
    }

    /// Abandons the cycle in progress once the processor is stopping.
    async fn on_tick(&mut self) {
        let token = self.token.clone();
        tokio::select! {
            biased;
            () = token.cancelled() => debug!("ownership cycle interrupted by stop"),
            () = self.cycle() => {}
        }
    }

    /// Stops every pump, then hands the leases and the heartbeat back. The
    /// whole sequence is bounded by the shutdown timeout; leases not handed
    /// back by then lapse on their own.
    async fn shutdown(&mut self) {
        self.token.cancel();
        let grace = self.ctx.options.shutdown_timeout;
        let started = tokio::time::Instant::now();
        let running: Vec<String> = self.pumps.keys().cloned().collect();
        self.stop_pumps(&running, StopReason::Shutdown).await;

        let owned: Vec<PartitionOwnership> = self.owned.drain().map(|(_, r)| r).collect();
        let releases = owned.into_iter().map(|record| {
            let store = Arc::clone(&self.ctx.store);
            async move {
                let pid = record.partition_id.clone();
                match store.claim_ownership(record.relinquished()).await {
                    Ok(ClaimOutcome::Claimed(_)) => debug!(partition_id = %pid, "released on shutdown"),
                    Ok(ClaimOutcome::Conflict) => {}
                    Err(error) => warn!(partition_id = %pid, error = %error, "release on shutdown failed"),
                }
            }
        });
        let store = Arc::clone(&self.ctx.store);
        let scope = Arc::clone(&self.ctx.scope);
        let owner_id = Arc::clone(&self.ctx.owner_id);
        let hand_back = async move {
            join_all(releases).await;
            if let Err(error) = store.withdraw_presence(&scope, &owner_id).await {
                warn!(error = %error, "withdrawing presence on shutdown failed");
            }
        };
        let remaining = grace.saturating_sub(started.elapsed());
        if tokio::time::timeout(remaining, hand_back).await.is_err() {
            warn!(
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "handing ownership back timed out, leases will lapse"
            );
        }
        metrics::gauge!("eventflow_owned_partitions").set(0.0);
        info!("ownership cycle shut down");
    }
}
