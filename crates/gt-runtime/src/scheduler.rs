use std::collections::HashSet;

use chrono::Utc;
use gt_core::config::RuntimeConfig;
use gt_core::errors::GtError;
use gt_core::identity::{parse_session_name, AgentId, Role};
use gt_core::issue::{labels, Issue};
use gt_core::names::pick_name;
use gt_core::schedmeta::{strip, SchedulerMetadata};
use gt_core::workspace::Town;

use crate::cancel::CancelToken;
use crate::ledger::{Ledger, ListFilter, UpdateFields};
use crate::lifecycle::{Lifecycle, SpawnRequest, StartOutcome};

/// Bounded retry: the fourth dispatch attempt is quarantined, not run.
pub const MAX_DISPATCH_FAILURES: u32 = 3;

/// Default formula applied when a scheduled item names none.
pub const DEFAULT_FORMULA: &str = "polecat-work";

/// One pending scheduled item with its parsed metadata.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub issue: Issue,
    pub meta: SchedulerMetadata,
    /// Parsed from the legacy delimiter; rewritten on next touch.
    pub legacy: bool,
}

/// Readiness predicate for pending items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Readiness {
    AllReady,
    /// Drop items whose id is not in the ledger's `ready()` set.
    #[default]
    BlockerAware,
}

/// Why a plan stopped where it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanReason {
    Capacity,
    Batch,
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub dispatch: usize,
    pub reason: PlanReason,
}

/// Plan one cycle under capacity `c` (0 = unbounded), batch `b`, and
/// `active` live workers, over `ready` dispatchable items.
pub fn plan(capacity: u32, batch: u32, active: u32, ready: usize) -> Plan {
    let cap_room = if capacity > 0 {
        capacity.saturating_sub(active) as usize
    } else {
        usize::MAX
    };
    if cap_room == 0 {
        return Plan {
            dispatch: 0,
            reason: PlanReason::Capacity,
        };
    }
    let batch = batch.max(1) as usize;
    let n = ready.min(batch).min(cap_room);
    let reason = if n == ready {
        PlanReason::Drained
    } else if cap_room < batch {
        PlanReason::Capacity
    } else {
        PlanReason::Batch
    };
    Plan {
        dispatch: n,
        reason,
    }
}

/// Report of one dispatch cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub dispatched: Vec<String>,
    pub quarantined: Vec<String>,
    pub failed: Vec<String>,
    pub skipped_unparseable: Vec<String>,
    pub plan: Option<Plan>,
}

/// Translates scheduled items into worker spawns under capacity, batch,
/// and readiness policies, with bounded-retry quarantine.
pub struct Scheduler {
    rig: String,
    ledger: Ledger,
    readiness: Readiness,
}

impl Scheduler {
    pub fn new(town: &Town, rig: &str) -> Self {
        Scheduler {
            rig: rig.to_string(),
            ledger: Ledger::new(town.rig(rig).root()),
            readiness: Readiness::default(),
        }
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Enqueue an item. Idempotent: re-scheduling an already-queued
    /// item refreshes the metadata block without duplicating the label.
    pub async fn schedule(
        &self,
        issue_id: &str,
        mut meta: SchedulerMetadata,
        cancel: &CancelToken,
    ) -> Result<(), GtError> {
        let issue = self.ledger.show(issue_id, cancel).await?;
        if meta.formula.is_empty() {
            meta.formula = DEFAULT_FORMULA.to_string();
        }
        if meta.target_rig.is_empty() {
            meta.target_rig = self.rig.clone();
        }
        meta.enqueued_at = Some(Utc::now());

        let already_queued = issue.has_label(labels::QUEUED);
        let description = meta.attach(&issue.description);
        let fields = UpdateFields {
            description: Some(description),
            add_labels: if already_queued {
                vec![]
            } else {
                vec![labels::QUEUED.to_string()]
            },
            ..Default::default()
        };
        self.ledger.update(issue_id, &fields, cancel).await?;
        Ok(())
    }

    /// Step 1: list queued items and parse their metadata. Items with
    /// no parseable block are skipped (and reported); legacy blocks are
    /// upgraded in place.
    pub async fn collect_pending(
        &self,
        cancel: &CancelToken,
    ) -> Result<(Vec<PendingItem>, Vec<String>), GtError> {
        let filter = ListFilter {
            labels: vec![labels::QUEUED.to_string()],
            ..Default::default()
        };
        let issues = self.ledger.list(&filter, cancel).await?;
        let mut pending = Vec::new();
        let mut skipped = Vec::new();
        for issue in issues {
            if !issue.is_open() {
                continue;
            }
            match SchedulerMetadata::parse(&issue.description) {
                Some(parsed) => {
                    if parsed.legacy {
                        let upgraded = parsed.meta.attach(&issue.description);
                        self.ledger
                            .update(
                                &issue.id,
                                &UpdateFields {
                                    description: Some(upgraded),
                                    ..Default::default()
                                },
                                cancel,
                            )
                            .await?;
                    }
                    pending.push(PendingItem {
                        issue,
                        meta: parsed.meta,
                        legacy: parsed.legacy,
                    });
                }
                None => {
                    tracing::warn!("queued item {} has no metadata block; skipping", issue.id);
                    skipped.push(issue.id);
                }
            }
        }
        Ok((pending, skipped))
    }

    /// Step 2: circuit-break items past the failure bound. Quarantined
    /// items lose `gt:queued`, gain `gt:dispatch-failed`, and keep
    /// their description untouched.
    pub async fn quarantine(
        &self,
        pending: Vec<PendingItem>,
        cancel: &CancelToken,
    ) -> Result<(Vec<PendingItem>, Vec<String>), GtError> {
        let mut kept = Vec::new();
        let mut quarantined = Vec::new();
        for item in pending {
            if item.meta.dispatch_failures >= MAX_DISPATCH_FAILURES {
                tracing::warn!(
                    "{}: {} dispatch failures; quarantining",
                    item.issue.id,
                    item.meta.dispatch_failures
                );
                self.ledger
                    .update(
                        &item.issue.id,
                        &UpdateFields {
                            add_labels: vec![labels::DISPATCH_FAILED.to_string()],
                            remove_labels: vec![labels::QUEUED.to_string()],
                            ..Default::default()
                        },
                        cancel,
                    )
                    .await?;
                quarantined.push(item.issue.id);
            } else {
                kept.push(item);
            }
        }
        Ok((kept, quarantined))
    }

    /// Step 3: readiness filter.
    pub async fn filter_ready(
        &self,
        pending: Vec<PendingItem>,
        cancel: &CancelToken,
    ) -> Result<Vec<PendingItem>, GtError> {
        match self.readiness {
            Readiness::AllReady => Ok(pending),
            Readiness::BlockerAware => {
                let ready_ids: HashSet<String> = self
                    .ledger
                    .ready(cancel)
                    .await?
                    .into_iter()
                    .map(|i| i.id)
                    .collect();
                Ok(pending
                    .into_iter()
                    .filter(|item| ready_ids.contains(&item.issue.id))
                    .collect())
            }
        }
    }

    /// Live worker sessions of the target role in this rig.
    pub async fn active_count(&self, lifecycle: &Lifecycle) -> Result<u32, GtError> {
        let sessions = lifecycle.tmux().list().await?;
        let count = sessions
            .iter()
            .filter_map(|s| parse_session_name(s))
            .filter(|id| id.role == Role::Polecat && id.rig.as_deref() == Some(self.rig.as_str()))
            .count();
        Ok(count as u32)
    }

    /// Step 5 for one item: reconstruct spawn parameters and start the
    /// worker. Success clears `gt:queued`; failure bumps the counters
    /// in the metadata block so the bound eventually quarantines it.
    async fn dispatch_one(
        &self,
        item: &PendingItem,
        lifecycle: &Lifecycle,
        runtime: &RuntimeConfig,
        taken: &mut HashSet<String>,
        cancel: &CancelToken,
    ) -> Result<(), GtError> {
        let name = pick_name(taken);
        taken.insert(name.clone());
        let id = AgentId::worker(Role::Polecat, item.meta.target_rig.clone(), name);
        let mut req = SpawnRequest::new(id);
        req.hook = Some(item.issue.id.clone());
        req.preset = item.meta.account.clone().or_else(|| item.meta.agent.clone());
        req.prompt = Some(format!(
            "You are a polecat. Your hook is {}. Run `gt prime` then execute formula '{}'.",
            item.issue.id, item.meta.formula
        ));

        match lifecycle.start(&req, runtime, &self.ledger, cancel).await? {
            StartOutcome::Started | StartOutcome::AlreadyRunning | StartOutcome::LeftSpawning => {
                self.ledger
                    .update(
                        &item.issue.id,
                        &UpdateFields {
                            remove_labels: vec![labels::QUEUED.to_string()],
                            ..Default::default()
                        },
                        cancel,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn record_failure(
        &self,
        item: &PendingItem,
        error: &GtError,
        cancel: &CancelToken,
    ) -> Result<(), GtError> {
        let mut meta = item.meta.clone();
        meta.dispatch_failures += 1;
        meta.last_failure = Some(error.to_string());
        let body = strip(&item.issue.description);
        let description = meta.attach(&body);
        self.ledger
            .update(
                &item.issue.id,
                &UpdateFields {
                    description: Some(description),
                    ..Default::default()
                },
                cancel,
            )
            .await
    }

    /// One full cycle: collect, quarantine, filter, plan, dispatch.
    pub async fn cycle(
        &self,
        lifecycle: &Lifecycle,
        runtime: &RuntimeConfig,
        capacity: u32,
        batch: u32,
        cancel: &CancelToken,
    ) -> Result<CycleReport, GtError> {
        let mut report = CycleReport::default();

        let (pending, skipped) = self.collect_pending(cancel).await?;
        report.skipped_unparseable = skipped;

        let (pending, quarantined) = self.quarantine(pending, cancel).await?;
        report.quarantined = quarantined;

        let ready = self.filter_ready(pending, cancel).await?;
        let active = self.active_count(lifecycle).await?;
        let the_plan = plan(capacity, batch, active, ready.len());
        report.plan = Some(the_plan);
        tracing::info!(
            "scheduler {}: {} ready, {} active, dispatching {} ({:?})",
            self.rig,
            ready.len(),
            active,
            the_plan.dispatch,
            the_plan.reason
        );

        let mut taken: HashSet<String> = lifecycle
            .tmux()
            .list()
            .await?
            .iter()
            .filter_map(|s| parse_session_name(s))
            .filter_map(|id| id.worker)
            .collect();

        // Insertion order of the ledger list; no stronger ordering.
        for item in ready.into_iter().take(the_plan.dispatch) {
            match self
                .dispatch_one(&item, lifecycle, runtime, &mut taken, cancel)
                .await
            {
                Ok(()) => report.dispatched.push(item.issue.id.clone()),
                Err(e) => {
                    tracing::warn!("dispatch {} failed: {e}", item.issue.id);
                    self.record_failure(&item, &e, cancel).await?;
                    report.failed.push(item.issue.id.clone());
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_zero_room_skips_cycle() {
        let p = plan(4, 10, 4, 7);
        assert_eq!(p.dispatch, 0);
        assert_eq!(p.reason, PlanReason::Capacity);
        // Over capacity counts the same.
        assert_eq!(plan(4, 10, 9, 7).reason, PlanReason::Capacity);
    }

    #[test]
    fn plan_limiting_factors() {
        // Drained: fewer ready than any limit.
        let p = plan(10, 5, 0, 3);
        assert_eq!(p.dispatch, 3);
        assert_eq!(p.reason, PlanReason::Drained);
        // Batch-limited.
        let p = plan(10, 2, 0, 8);
        assert_eq!(p.dispatch, 2);
        assert_eq!(p.reason, PlanReason::Batch);
        // Capacity-limited.
        let p = plan(3, 5, 1, 8);
        assert_eq!(p.dispatch, 2);
        assert_eq!(p.reason, PlanReason::Capacity);
        // Unbounded capacity.
        let p = plan(0, 4, 99, 2);
        assert_eq!(p.dispatch, 2);
        assert_eq!(p.reason, PlanReason::Drained);
    }

    #[test]
    fn failure_bound_is_exactly_three() {
        let mut meta = SchedulerMetadata {
            target_rig: "demo".into(),
            formula: DEFAULT_FORMULA.into(),
            ..Default::default()
        };
        meta.dispatch_failures = 2;
        assert!(meta.dispatch_failures < MAX_DISPATCH_FAILURES);
        meta.dispatch_failures += 1;
        // Third failure recorded; the next cycle quarantines instead of
        // attempting a fourth dispatch.
        assert!(meta.dispatch_failures >= MAX_DISPATCH_FAILURES);
    }
}
