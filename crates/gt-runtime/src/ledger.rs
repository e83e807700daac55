use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gt_core::errors::GtError;
use gt_core::issue::{Issue, IssueStatus, IssueType, Priority};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;

/// Ledger operations may block on a network database; every call is
/// bounded by this timeout unless the caller overrides it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fields for `update`. Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<IssueStatus>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

/// Filters for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<IssueStatus>,
    pub issue_type: Option<IssueType>,
    pub labels: Vec<String>,
}

/// One record from the ledger's activity feed subscription. Tolerant:
/// unknown shapes still carry their raw line.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityRecord {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub issue_id: Option<String>,
}

/// Narrow facade over the external `bd` issue database. The working
/// directory selects the rig's ledger namespace.
#[derive(Debug, Clone)]
pub struct Ledger {
    bin: String,
    cwd: PathBuf,
    timeout: Duration,
}

impl Ledger {
    pub fn new(rig_dir: impl Into<PathBuf>) -> Self {
        Ledger {
            bin: std::env::var("GT_BEADS_BIN").unwrap_or_else(|_| "bd".into()),
            cwd: rig_dir.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    async fn run_once(&self, args: &[String], cancel: &CancelToken) -> Result<String, GtError> {
        if cancel.is_cancelled() {
            return Err(GtError::Cancelled);
        }
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(GtError::Cancelled),
            out = tokio::time::timeout(self.timeout, cmd.output()) => out
                .map_err(|_| GtError::LedgerTransport(format!(
                    "{} {} timed out after {}s",
                    self.bin,
                    args.first().map(String::as_str).unwrap_or(""),
                    self.timeout.as_secs()
                )))?
                .map_err(|e| GtError::LedgerTransport(format!("failed to run {}: {e}", self.bin)))?,
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(classify(
            &String::from_utf8_lossy(&output.stderr),
            args.first().map(String::as_str).unwrap_or(""),
        ))
    }

    /// Run a ledger command. `stale` is recovered locally: one `sync`
    /// followed by one retry, then surfaced.
    async fn run(&self, args: &[String], cancel: &CancelToken) -> Result<String, GtError> {
        match self.run_once(args, cancel).await {
            Err(GtError::LedgerStale) => {
                tracing::info!("ledger stale; syncing and retrying once");
                self.run_once(&[String::from("sync")], cancel).await?;
                self.run_once(args, cancel).await
            }
            other => other,
        }
    }

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    pub async fn create(
        &self,
        issue_type: IssueType,
        title: &str,
        description: &str,
        labels: &[String],
        priority: Option<Priority>,
        cancel: &CancelToken,
    ) -> Result<String, GtError> {
        let mut args = Self::args(&["create", "--json", "--type", issue_type.as_str()]);
        args.push("--title".into());
        args.push(title.to_string());
        args.push("--description".into());
        args.push(description.to_string());
        if let Some(p) = priority {
            args.push("--priority".into());
            args.push(p.to_string());
        }
        for label in labels {
            args.push("--label".into());
            args.push(label.clone());
        }
        let out = self.run(&args, cancel).await?;
        parse_created_id(&out)
    }

    pub async fn update(
        &self,
        id: &str,
        fields: &UpdateFields,
        cancel: &CancelToken,
    ) -> Result<(), GtError> {
        let mut args = Self::args(&["update", id]);
        if let Some(t) = &fields.title {
            args.push("--title".into());
            args.push(t.clone());
        }
        if let Some(d) = &fields.description {
            args.push("--description".into());
            args.push(d.clone());
        }
        if let Some(s) = &fields.status {
            args.push("--status".into());
            args.push(s.as_str().into());
        }
        if let Some(p) = &fields.priority {
            args.push("--priority".into());
            args.push(p.to_string());
        }
        if let Some(a) = &fields.assignee {
            args.push("--assignee".into());
            args.push(a.clone());
        }
        for l in &fields.add_labels {
            args.push("--add-label".into());
            args.push(l.clone());
        }
        for l in &fields.remove_labels {
            args.push("--remove-label".into());
            args.push(l.clone());
        }
        self.run(&args, cancel).await?;
        Ok(())
    }

    /// Close an issue. Closing an already-closed (or vanished) item is
    /// a no-op by contract.
    pub async fn close(
        &self,
        id: &str,
        reason: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<(), GtError> {
        let mut args = Self::args(&["close", id]);
        if let Some(r) = reason {
            args.push("--reason".into());
            args.push(r.to_string());
        }
        match self.run(&args, cancel).await {
            Ok(_) => Ok(()),
            Err(GtError::LedgerNotFound(_)) => Ok(()),
            Err(GtError::LedgerInvalidArgument(msg)) if msg.contains("closed") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn show(&self, id: &str, cancel: &CancelToken) -> Result<Issue, GtError> {
        let out = self
            .run(&Self::args(&["show", id, "--json"]), cancel)
            .await?;
        serde_json::from_str(&out)
            .map_err(|e| GtError::LedgerTransport(format!("unparseable show output: {e}")))
    }

    pub async fn list(&self, filter: &ListFilter, cancel: &CancelToken) -> Result<Vec<Issue>, GtError> {
        let mut args = Self::args(&["list", "--json"]);
        if let Some(s) = &filter.status {
            args.push("--status".into());
            args.push(s.as_str().into());
        }
        if let Some(t) = &filter.issue_type {
            args.push("--type".into());
            args.push(t.as_str().into());
        }
        for l in &filter.labels {
            args.push("--label".into());
            args.push(l.clone());
        }
        let out = self.run(&args, cancel).await?;
        serde_json::from_str(&out)
            .map_err(|e| GtError::LedgerTransport(format!("unparseable list output: {e}")))
    }

    /// Open items whose blocked_by set is empty.
    pub async fn ready(&self, cancel: &CancelToken) -> Result<Vec<Issue>, GtError> {
        let out = self.run(&Self::args(&["ready", "--json"]), cancel).await?;
        serde_json::from_str(&out)
            .map_err(|e| GtError::LedgerTransport(format!("unparseable ready output: {e}")))
    }

    pub async fn add_dependency(
        &self,
        blocked: &str,
        blocker: &str,
        cancel: &CancelToken,
    ) -> Result<(), GtError> {
        self.run(&Self::args(&["dep", "add", blocked, blocker]), cancel)
            .await?;
        Ok(())
    }

    pub async fn remove_dependency(
        &self,
        blocked: &str,
        blocker: &str,
        cancel: &CancelToken,
    ) -> Result<(), GtError> {
        self.run(&Self::args(&["dep", "remove", blocked, blocker]), cancel)
            .await?;
        Ok(())
    }

    /// IDs currently blocking an item.
    pub async fn blocked(&self, id: &str, cancel: &CancelToken) -> Result<Vec<String>, GtError> {
        Ok(self.show(id, cancel).await?.blocked_by)
    }

    pub async fn sync(&self, cancel: &CancelToken) -> Result<(), GtError> {
        self.run_once(&Self::args(&["sync"]), cancel).await?;
        Ok(())
    }

    pub async fn merge_slot_ensure_exists(&self, cancel: &CancelToken) -> Result<(), GtError> {
        match self
            .run(&Self::args(&["merge-slot", "ensure"]), cancel)
            .await
        {
            Ok(_) => Ok(()),
            Err(GtError::LedgerConflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn merge_slot_acquire(
        &self,
        holder: &str,
        wait: bool,
        cancel: &CancelToken,
    ) -> Result<(), GtError> {
        let mut args = Self::args(&["merge-slot", "acquire", "--holder", holder]);
        if wait {
            args.push("--wait".into());
        }
        self.run(&args, cancel).await?;
        Ok(())
    }

    pub async fn merge_slot_release(
        &self,
        holder: &str,
        cancel: &CancelToken,
    ) -> Result<(), GtError> {
        self.run(&Self::args(&["merge-slot", "release", "--holder", holder]), cancel)
            .await?;
        Ok(())
    }

    /// Subscribe to the ledger's activity feed. Records stream over the
    /// returned channel until the token cancels or the process exits.
    pub fn activity_follow(
        &self,
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<ActivityRecord>, GtError> {
        let (tx, rx) = mpsc::channel(64);
        let mut child = Command::new(&self.bin)
            .args(["activity", "--follow", "--json"])
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GtError::LedgerTransport(format!("failed to follow activity: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GtError::LedgerTransport("activity stream has no stdout".into()))?;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Ok(record) = serde_json::from_str::<ActivityRecord>(&line) {
                                if tx.send(record).await.is_err() {
                                    break;
                                }
                            }
                        }
                        _ => break,
                    },
                }
            }
            let _ = child.kill().await;
        });

        Ok(rx)
    }
}

/// Classify a failed ledger invocation from its stderr.
fn classify(stderr: &str, op: &str) -> GtError {
    let lower = stderr.to_lowercase();
    let line = stderr.lines().next().unwrap_or("").trim().to_string();
    if lower.contains("not found") || lower.contains("no such issue") || lower.contains("unknown issue") {
        GtError::LedgerNotFound(line)
    } else if lower.contains("stale") || lower.contains("out of date") || lower.contains("needs sync") {
        GtError::LedgerStale
    } else if lower.contains("already held") || lower.contains("slot held") || lower.contains("conflict") || lower.contains("locked") {
        GtError::LedgerConflict(line)
    } else if lower.contains("invalid") || lower.contains("already closed") || lower.contains("already exists") {
        GtError::LedgerInvalidArgument(line)
    } else {
        GtError::LedgerTransport(format!("{op}: {line}"))
    }
}

#[derive(Debug, Deserialize)]
struct CreatedId {
    id: String,
}

/// `bd create --json` prints the new issue (or at least its id); older
/// builds print the bare id on stdout.
fn parse_created_id(stdout: &str) -> Result<String, GtError> {
    let trimmed = stdout.trim();
    if let Ok(created) = serde_json::from_str::<CreatedId>(trimmed) {
        return Ok(created.id);
    }
    let bare = trimmed.lines().last().unwrap_or("").trim();
    if bare.is_empty() {
        return Err(GtError::LedgerTransport(
            "create returned no issue id".into(),
        ));
    }
    Ok(bare.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_stderr_kinds() {
        assert!(matches!(
            classify("error: issue demo-99 not found", "show"),
            GtError::LedgerNotFound(_)
        ));
        assert!(matches!(
            classify("database is stale, run sync", "list"),
            GtError::LedgerStale
        ));
        assert!(matches!(
            classify("merge slot held by demo/refinery", "merge-slot"),
            GtError::LedgerConflict(_)
        ));
        assert!(matches!(
            classify("invalid priority 9", "create"),
            GtError::LedgerInvalidArgument(_)
        ));
        assert!(matches!(
            classify("connection refused", "list"),
            GtError::LedgerTransport(_)
        ));
    }

    #[test]
    fn created_id_json_and_bare() {
        assert_eq!(
            parse_created_id("{\"id\":\"demo-7\",\"title\":\"x\"}").unwrap(),
            "demo-7"
        );
        assert_eq!(parse_created_id("demo-8\n").unwrap(), "demo-8");
        assert!(parse_created_id("").is_err());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = ledger.show("demo-1", &cancel).await.unwrap_err();
        assert!(matches!(err, GtError::Cancelled));
    }
}
