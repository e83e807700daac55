use std::process::Stdio;

use chrono::{DateTime, Utc};
use gt_core::config::{MergeStrategy, RigSettings};
use gt_core::errors::GtError;
use gt_core::feed::Event;
use gt_core::identity::{AgentId, Role};
use gt_core::issue::{labels, Issue, IssueStatus, IssueType};
use gt_core::mr::{Claim, ConflictMetadata, MrMetadata};
use gt_core::names::short_id;
use gt_core::workspace::Town;
use tokio::process::Command;

use crate::cancel::CancelToken;
use crate::git::Git;
use crate::ledger::{Ledger, ListFilter, UpdateFields};
use crate::mail::{FailureType, MessageBus, WellKnownSubject};

const REMOTE: &str = "origin";

/// An MR with its parsed metadata.
#[derive(Debug, Clone)]
pub struct MrEntry {
    pub issue: Issue,
    pub meta: MrMetadata,
}

/// Conditions the ready filter lists separately instead of queueing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    StaleClaim {
        id: String,
        holder: String,
        minutes: i64,
    },
    MissingMetadata { id: String },
}

#[derive(Debug, Default)]
pub struct ReadyList {
    pub ready: Vec<MrEntry>,
    pub anomalies: Vec<Anomaly>,
}

/// Derive the ready queue from open `gt:merge-request` issues. No
/// persistent queue exists anywhere; this set is recomputed every time.
pub fn filter_ready(issues: Vec<Issue>, now: DateTime<Utc>, self_addr: &str) -> ReadyList {
    let mut out = ReadyList::default();
    for issue in issues {
        if !issue.is_open()
            || issue.has_label(labels::MERGED)
            || issue.has_label(labels::REJECTED)
        {
            continue;
        }
        if !issue.blocked_by.is_empty() {
            continue;
        }
        let Some(meta) = MrMetadata::parse(&issue.description) else {
            out.anomalies.push(Anomaly::MissingMetadata {
                id: issue.id.clone(),
            });
            continue;
        };
        if let Some(claim) = &meta.claim {
            if claim.holder != self_addr {
                if claim.is_stale(now) {
                    out.anomalies.push(Anomaly::StaleClaim {
                        id: issue.id.clone(),
                        holder: claim.holder.clone(),
                        minutes: (now - claim.at).num_minutes(),
                    });
                } // else: another holder is actively on it.
                continue;
            }
        }
        out.ready.push(MrEntry { issue, meta });
    }
    out
}

/// Retry count for a new conflict task: how many conflict tasks already
/// reference this MR.
pub fn count_retries(conflict_tasks: &[Issue], mr_id: &str) -> u32 {
    conflict_tasks
        .iter()
        .filter(|t| {
            ConflictMetadata::parse(&t.description)
                .map(|m| m.original_mr == mr_id)
                .unwrap_or(false)
        })
        .count() as u32
}

/// A successfully prepared MR, ready to merge.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub mr_id: String,
    pub temp_branch: String,
    pub head_sha: String,
    pub meta: MrMetadata,
}

#[derive(Debug)]
pub enum PrepareOutcome {
    Ready(Prepared),
    ConflictDetected { task_id: String },
    GateFailed { gate: String, output: String },
}

/// Inputs for `reject`.
#[derive(Debug, Clone)]
pub enum RejectKind {
    Conflict { conflict_sha: String, detail: String },
    QualityCheck { gate: String, output: String },
    Regression { gate: String, output: String },
}

/// Serialized merge pipeline for one rig: rebase, quality gates,
/// fast-forward merge, verified push, structured conflict handoff.
pub struct Refinery {
    rig: String,
    git: Git,
    ledger: Ledger,
    settings: RigSettings,
    feed_path: std::path::PathBuf,
}

impl Refinery {
    pub fn new(town: &Town, rig: &str, settings: RigSettings) -> Self {
        let paths = town.rig(rig);
        Refinery {
            rig: rig.to_string(),
            git: Git::at(paths.refinery_clone()),
            ledger: Ledger::new(paths.root()),
            settings,
            feed_path: paths.feed_path(),
        }
    }

    fn addr(&self) -> AgentId {
        AgentId::rig_singleton(Role::Refinery, self.rig.clone())
    }

    fn witness(&self) -> AgentId {
        AgentId::rig_singleton(Role::Witness, self.rig.clone())
    }

    fn target_of(&self, meta: &MrMetadata) -> String {
        if meta.target_branch.is_empty() {
            self.settings.target_branch().to_string()
        } else {
            meta.target_branch.clone()
        }
    }

    fn emit(&self, kind: &str, target: &str, message: &str) {
        let event = Event::new(kind, self.addr().render())
            .target(target)
            .rig(self.rig.clone())
            .role(Role::Refinery.as_str())
            .message(message);
        if let Err(e) = gt_core::feed::append(&self.feed_path, &event) {
            tracing::debug!("feed append failed: {e}");
        }
    }

    /// Open MRs in this rig's ledger, unfiltered.
    pub async fn open_mrs(&self, cancel: &CancelToken) -> Result<Vec<Issue>, GtError> {
        let filter = ListFilter {
            status: None,
            issue_type: None,
            labels: vec![labels::MERGE_REQUEST.to_string()],
        };
        let issues = self.ledger.list(&filter, cancel).await?;
        Ok(issues.into_iter().filter(Issue::is_open).collect())
    }

    /// The derived ready queue plus anomalies.
    pub async fn ready_list(&self, cancel: &CancelToken) -> Result<ReadyList, GtError> {
        let issues = self.open_mrs(cancel).await?;
        Ok(filter_ready(issues, Utc::now(), &self.addr().render()))
    }

    /// Claim an MR: status in-progress, claim recorded in metadata.
    pub async fn claim(&self, mr_id: &str, cancel: &CancelToken) -> Result<MrMetadata, GtError> {
        let issue = self.ledger.show(mr_id, cancel).await?;
        let mut meta = MrMetadata::parse(&issue.description).ok_or_else(|| {
            GtError::ValidationFailed {
                message: format!("MR {mr_id} has no metadata section"),
                suggestion: "gt mq submit".into(),
            }
        })?;
        meta.claim = Some(Claim {
            holder: self.addr().render(),
            at: Utc::now(),
        });
        let description = replace_metadata(&issue.description, &meta.render());
        self.ledger
            .update(
                mr_id,
                &UpdateFields {
                    description: Some(description),
                    status: Some(IssueStatus::InProgress),
                    ..Default::default()
                },
                cancel,
            )
            .await?;
        Ok(meta)
    }

    async fn run_gate(&self, command: &str) -> Result<(), (String, String)> {
        let output = Command::new("sh")
            .args(["-c", command])
            .current_dir(self.git.repo())
            .env("CI", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| (command.to_string(), format!("failed to run: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            Err((command.to_string(), combined))
        }
    }

    /// Fetch, verify the source branch, rebase a temp branch onto the
    /// target, run quality gates. Conflicts route through
    /// `reject(conflict)` here; gate failures return without filing
    /// anything — regression-vs-branch diagnosis is the supervisor's.
    pub async fn prepare(
        &self,
        mr_id: &str,
        bus: &MessageBus,
        cancel: &CancelToken,
    ) -> Result<PrepareOutcome, GtError> {
        let issue = self.ledger.show(mr_id, cancel).await?;
        let meta = MrMetadata::parse(&issue.description).ok_or_else(|| {
            GtError::ValidationFailed {
                message: format!("MR {mr_id} has no metadata section"),
                suggestion: "gt mq submit".into(),
            }
        })?;
        let target = self.target_of(&meta);

        self.git.fetch(REMOTE).await?;
        if !self
            .git
            .remote_branch_exists(REMOTE, &meta.source_branch)
            .await?
        {
            return Err(GtError::Git {
                op: "prepare".into(),
                code: 1,
                stderr: format!(
                    "source branch '{}' does not exist on {REMOTE}",
                    meta.source_branch
                ),
            });
        }

        let temp_branch = format!("gt/merge-{}", short_id());
        self.git
            .checkout_new(&temp_branch, &format!("{REMOTE}/{}", meta.source_branch))
            .await?;

        let target_ref = format!("{REMOTE}/{target}");
        match self.git.rebase(&target_ref).await {
            Ok(()) => {}
            Err(GtError::GitConflict { detail, .. }) => {
                let conflict_sha = self.git.rev_parse(&target_ref).await?;
                let _ = self.git.checkout(&self.target_of(&meta)).await;
                let _ = self.git.delete_branch(&temp_branch).await;
                let task_id = self
                    .reject(
                        mr_id,
                        RejectKind::Conflict {
                            conflict_sha,
                            detail,
                        },
                        bus,
                        cancel,
                    )
                    .await?
                    .unwrap_or_default();
                return Ok(PrepareOutcome::ConflictDetected { task_id });
            }
            Err(e) => return Err(e),
        }

        for (gate, command) in self.settings.gates.ordered() {
            tracing::info!("mr {mr_id}: running gate '{gate}'");
            if let Err((_, output)) = self.run_gate(command).await {
                tracing::warn!("mr {mr_id}: gate '{gate}' failed");
                return Ok(PrepareOutcome::GateFailed {
                    gate: gate.to_string(),
                    output,
                });
            }
        }

        let head_sha = self.git.head_sha().await?;
        Ok(PrepareOutcome::Ready(Prepared {
            mr_id: mr_id.to_string(),
            temp_branch,
            head_sha,
            meta,
        }))
    }

    /// Fast-forward the target to the prepared result, push with SHA
    /// verification, then do the bookkeeping. Any failure before the
    /// push leaves the MR open for retry; a push mismatch is fatal for
    /// this cycle and labels the MR instead of closing it.
    pub async fn merge(
        &self,
        prepared: &Prepared,
        bus: &MessageBus,
        cancel: &CancelToken,
    ) -> Result<(), GtError> {
        let target = self.target_of(&prepared.meta);

        // Target must sit at the remote tip or the push verify would
        // reject a correct merge; -B resets it there.
        self.git
            .checkout_new(&target, &format!("{REMOTE}/{target}"))
            .await?;

        match self.settings.merge_strategy {
            MergeStrategy::RebaseFf => {
                self.git.merge_ff_only(&prepared.temp_branch).await?;
            }
            MergeStrategy::Squash => {
                self.git
                    .merge_squash(
                        &prepared.temp_branch,
                        &format!(
                            "Squash merge {} ({})",
                            prepared.meta.source_branch, prepared.mr_id
                        ),
                    )
                    .await?;
            }
        }

        let local_sha = self.git.head_sha().await?;
        match self
            .git
            .push_verify_sha(REMOTE, &target, &local_sha)
            .await
        {
            Ok(()) => {}
            Err(e @ GtError::GitPushMismatch { .. }) => {
                self.ledger
                    .update(
                        &prepared.mr_id,
                        &UpdateFields {
                            add_labels: vec![labels::MERGE_ERROR.to_string()],
                            ..Default::default()
                        },
                        cancel,
                    )
                    .await?;
                self.emit("merge-error", &prepared.mr_id, "push verification mismatch");
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        bus.send(
            &self.addr(),
            &self.witness(),
            &WellKnownSubject::Merged {
                worker: prepared.meta.worker.clone(),
            }
            .render(),
            &format!(
                "{} merged into {target} at {local_sha}",
                prepared.meta.source_branch
            ),
            cancel,
        )
        .await?;

        self.ledger
            .update(
                &prepared.mr_id,
                &UpdateFields {
                    add_labels: vec![labels::MERGED.to_string()],
                    ..Default::default()
                },
                cancel,
            )
            .await?;
        self.ledger
            .close(&prepared.mr_id, Some("merged"), cancel)
            .await?;

        // Source branch retires, remote and local; the temp branch too.
        if let Err(e) = self.git.push_delete(REMOTE, &prepared.meta.source_branch).await {
            tracing::warn!("remote branch delete failed: {e}");
        }
        if let Err(e) = self.git.delete_branch(&prepared.meta.source_branch).await {
            tracing::debug!("local branch delete: {e}");
        }
        if let Err(e) = self.git.delete_branch(&prepared.temp_branch).await {
            tracing::debug!("temp branch delete: {e}");
        }

        self.emit(
            "merge",
            &prepared.mr_id,
            &format!("{} -> {target}", prepared.meta.source_branch),
        );
        tracing::info!(
            "merged {} ({} -> {target})",
            prepared.mr_id,
            prepared.meta.source_branch
        );
        Ok(())
    }

    /// Structured rejection. Returns the filed task id for kinds that
    /// file one.
    pub async fn reject(
        &self,
        mr_id: &str,
        kind: RejectKind,
        bus: &MessageBus,
        cancel: &CancelToken,
    ) -> Result<Option<String>, GtError> {
        let issue = self.ledger.show(mr_id, cancel).await?;
        let meta = MrMetadata::parse(&issue.description).unwrap_or_default();
        let target = self.target_of(&meta);

        match kind {
            RejectKind::Conflict {
                conflict_sha,
                detail,
            } => {
                let existing = self
                    .ledger
                    .list(
                        &ListFilter {
                            labels: vec![labels::CONFLICT_TASK.to_string()],
                            ..Default::default()
                        },
                        cancel,
                    )
                    .await?;
                let conflict_meta = ConflictMetadata {
                    original_mr: mr_id.to_string(),
                    branch: meta.source_branch.clone(),
                    target: target.clone(),
                    source_issue: meta.source_issue.clone(),
                    conflict_sha,
                    retry_count: count_retries(&existing, mr_id),
                };
                let description = format!(
                    "Rebase of {} onto {target} hit conflicts.\n\n{}\n```\n{detail}\n```",
                    meta.source_branch,
                    conflict_meta.render(),
                );
                let task_id = self
                    .ledger
                    .create(
                        IssueType::Task,
                        &format!("Resolve merge conflicts for {mr_id}"),
                        &description,
                        &[labels::CONFLICT_TASK.to_string()],
                        Some(1),
                        cancel,
                    )
                    .await?;

                // The dependency edge is the sole mechanism keeping the
                // MR out of the ready queue; read it back like a push
                // verify rather than trusting the write.
                self.ledger.add_dependency(mr_id, &task_id, cancel).await?;
                let blockers = self.ledger.blocked(mr_id, cancel).await?;
                if !blockers.iter().any(|b| b == &task_id) {
                    tracing::warn!(
                        "{mr_id}: dependency on {task_id} not visible after add; it may re-enter the ready queue"
                    );
                }
                self.ledger.merge_slot_ensure_exists(cancel).await?;

                bus.send(
                    &self.addr(),
                    &self.witness(),
                    &WellKnownSubject::MergeFailed {
                        worker: meta.worker.clone(),
                        failure: FailureType::Conflict,
                    }
                    .render(),
                    &format!("conflict task {task_id} filed for {mr_id}"),
                    cancel,
                )
                .await?;
                self.emit("conflict", mr_id, &format!("task {task_id}"));
                Ok(Some(task_id))
            }
            RejectKind::QualityCheck { gate, output } => {
                if let Some(source_issue) = &meta.source_issue {
                    self.ledger
                        .update(
                            source_issue,
                            &UpdateFields {
                                status: Some(IssueStatus::Open),
                                ..Default::default()
                            },
                            cancel,
                        )
                        .await?;
                }
                bus.send(
                    &self.addr(),
                    &self.witness(),
                    &WellKnownSubject::MergeFailed {
                        worker: meta.worker.clone(),
                        failure: FailureType::QualityCheck,
                    }
                    .render(),
                    &format!("gate '{gate}' failed:\n{output}"),
                    cancel,
                )
                .await?;
                self.ledger
                    .update(
                        mr_id,
                        &UpdateFields {
                            add_labels: vec![labels::REJECTED.to_string()],
                            ..Default::default()
                        },
                        cancel,
                    )
                    .await?;
                self.ledger
                    .close(mr_id, Some("quality gate failed"), cancel)
                    .await?;
                self.emit("reject", mr_id, &format!("gate {gate}"));
                Ok(None)
            }
            RejectKind::Regression { gate, output } => {
                // Pre-existing breakage on the target: file it there and
                // leave the MR for re-evaluation.
                let task_id = self
                    .ledger
                    .create(
                        IssueType::Bug,
                        &format!("{target} regression: gate '{gate}' failing"),
                        &format!("Found while preparing {mr_id}.\n\n```\n{output}\n```"),
                        &[],
                        Some(1),
                        cancel,
                    )
                    .await?;
                self.emit("regression", &task_id, &format!("gate {gate}"));
                Ok(Some(task_id))
            }
        }
    }

    /// Acquire the merge slot for conflict-resolution work. Ensures the
    /// slot exists first; the external ledger does not promise
    /// auto-creation on acquire.
    pub async fn acquire_merge_slot(&self, cancel: &CancelToken) -> Result<(), GtError> {
        self.ledger.merge_slot_ensure_exists(cancel).await?;
        self.ledger
            .merge_slot_acquire(&self.addr().render(), true, cancel)
            .await
    }

    pub async fn release_merge_slot(&self, cancel: &CancelToken) -> Result<(), GtError> {
        self.ledger
            .merge_slot_release(&self.addr().render(), cancel)
            .await
    }
}

/// Replace the `## Metadata` section of a description, preserving the
/// text around it.
fn replace_metadata(description: &str, new_section: &str) -> String {
    match description.find("## Metadata") {
        None => {
            if description.trim().is_empty() {
                new_section.to_string()
            } else {
                format!("{}\n\n{new_section}", description.trim_end_matches('\n'))
            }
        }
        Some(start) => {
            let tail = &description[start..];
            // Section ends at the next heading after the first line.
            let end = tail[1..]
                .find("\n## ")
                .map(|i| start + 1 + i + 1)
                .unwrap_or(description.len());
            format!(
                "{}{}{}",
                &description[..start],
                new_section.trim_end_matches('\n'),
                if end < description.len() {
                    format!("\n{}", &description[end..])
                } else {
                    String::new()
                }
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gt_core::issue::IssueType;

    fn mr_issue(id: &str, desc: String, blocked_by: Vec<String>) -> Issue {
        Issue {
            id: id.into(),
            title: format!("Merge {id}"),
            description: desc,
            issue_type: IssueType::Task,
            status: IssueStatus::Open,
            priority: 2,
            labels: vec![labels::MERGE_REQUEST.to_string()],
            assignee: None,
            blocked_by,
            created_at: None,
            updated_at: None,
        }
    }

    fn meta(worker: &str) -> MrMetadata {
        MrMetadata {
            source_branch: format!("polecat/{worker}"),
            target_branch: "main".into(),
            source_issue: Some("demo-12".into()),
            worker: worker.into(),
            claim: None,
        }
    }

    #[test]
    fn ready_filter_drops_blocked_and_closed() {
        let now = Utc::now();
        let open = mr_issue("mr-1", meta("nux").render(), vec![]);
        let blocked = mr_issue("mr-2", meta("slit").render(), vec!["task-9".into()]);
        let mut closed = mr_issue("mr-3", meta("ace").render(), vec![]);
        closed.status = IssueStatus::Closed;
        let mut merged = mr_issue("mr-4", meta("dag").render(), vec![]);
        merged.labels.push(labels::MERGED.to_string());

        let list = filter_ready(vec![open, blocked, closed, merged], now, "demo/refinery");
        assert_eq!(list.ready.len(), 1);
        assert_eq!(list.ready[0].issue.id, "mr-1");
        assert!(list.anomalies.is_empty());
    }

    #[test]
    fn ready_filter_claims() {
        let now = Utc::now();
        let mut fresh_meta = meta("nux");
        fresh_meta.claim = Some(Claim {
            holder: "elsewhere/refinery".into(),
            at: now - Duration::minutes(10),
        });
        let mut stale_meta = meta("slit");
        stale_meta.claim = Some(Claim {
            holder: "elsewhere/refinery".into(),
            at: now - Duration::minutes(45),
        });
        let mut own_meta = meta("ace");
        own_meta.claim = Some(Claim {
            holder: "demo/refinery".into(),
            at: now - Duration::minutes(45),
        });

        let issues = vec![
            mr_issue("mr-1", fresh_meta.render(), vec![]),
            mr_issue("mr-2", stale_meta.render(), vec![]),
            mr_issue("mr-3", own_meta.render(), vec![]),
        ];
        let list = filter_ready(issues, now, "demo/refinery");
        // Fresh foreign claim: silently skipped. Stale: anomaly. Own: ready.
        assert_eq!(list.ready.len(), 1);
        assert_eq!(list.ready[0].issue.id, "mr-3");
        assert_eq!(list.anomalies.len(), 1);
        assert!(matches!(
            &list.anomalies[0],
            Anomaly::StaleClaim { id, minutes, .. } if id == "mr-2" && *minutes >= 45
        ));
    }

    #[test]
    fn ready_filter_flags_missing_metadata() {
        let issue = mr_issue("mr-1", "no metadata here".into(), vec![]);
        let list = filter_ready(vec![issue], Utc::now(), "demo/refinery");
        assert!(list.ready.is_empty());
        assert_eq!(
            list.anomalies,
            vec![Anomaly::MissingMetadata { id: "mr-1".into() }]
        );
    }

    #[test]
    fn retry_count_from_existing_tasks() {
        let mut prior = ConflictMetadata {
            original_mr: "mr-1".into(),
            branch: "polecat/nux".into(),
            target: "main".into(),
            source_issue: None,
            conflict_sha: "abc".into(),
            retry_count: 0,
        };
        let t1 = mr_issue("t-1", prior.render(), vec![]);
        prior.retry_count = 1;
        let t2 = mr_issue("t-2", prior.render(), vec![]);
        let other = mr_issue("t-3", "unrelated".into(), vec![]);
        assert_eq!(count_retries(&[t1.clone(), t2, other], "mr-1"), 2);
        assert_eq!(count_retries(&[t1], "mr-9"), 0);
    }

    #[test]
    fn replace_metadata_preserves_surrounding_text() {
        let original = format!("Intro text.\n\n{}", meta("nux").render());
        let mut updated_meta = meta("nux");
        updated_meta.claim = Some(Claim {
            holder: "demo/refinery".into(),
            at: Utc::now(),
        });
        let replaced = replace_metadata(&original, &updated_meta.render());
        assert!(replaced.starts_with("Intro text.\n\n## Metadata"));
        assert!(replaced.contains("Claimed by: demo/refinery"));
        let parsed = MrMetadata::parse(&replaced).unwrap();
        assert_eq!(parsed.claim.unwrap().holder, "demo/refinery");
    }
}
