use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known labels the core routes on.
pub mod labels {
    pub const MERGE_REQUEST: &str = "gt:merge-request";
    pub const QUEUED: &str = "gt:queued";
    pub const DISPATCH_FAILED: &str = "gt:dispatch-failed";
    pub const CONFLICT_TASK: &str = "gt:conflict-task";
    pub const MERGED: &str = "gt:merged";
    pub const REJECTED: &str = "gt:rejected";
    pub const MERGE_ERROR: &str = "gt:merge-error";
    pub const MAIL: &str = "gt:mail";
    pub const INBOX: &str = "gt:inbox";
    pub const READ: &str = "gt:read";
    pub const AGENT: &str = "gt:agent";
    pub const CONVOY: &str = "gt:convoy";
    pub const DECISION: &str = "gt:decision";
    pub const GATE: &str = "gt:gate";
    pub const DEATH_WARRANT: &str = "gt:death-warrant";

    pub fn to_addr(addr: &str) -> String {
        format!("gt:to:{addr}")
    }

    pub fn from_addr(addr: &str) -> String {
        format!("gt:from:{addr}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueType {
    Task,
    Epic,
    Bug,
    MergeRequest,
    Decision,
    Agent,
    SessionDigest,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Task => "task",
            IssueType::Epic => "epic",
            IssueType::Bug => "bug",
            IssueType::MergeRequest => "merge-request",
            IssueType::Decision => "decision",
            IssueType::Agent => "agent",
            IssueType::SessionDigest => "session-digest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in-progress",
            IssueStatus::Blocked => "blocked",
            IssueStatus::Closed => "closed",
        }
    }
}

/// 0 critical … 4 backlog.
pub type Priority = u8;

/// One ledger item as the external database reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub status: IssueStatus,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_priority() -> Priority {
    2
}

impl Issue {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.status, IssueStatus::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_type_wire_format() {
        assert_eq!(
            serde_json::to_string(&IssueType::MergeRequest).unwrap(),
            r#""merge-request""#
        );
        assert_eq!(
            serde_json::from_str::<IssueType>(r#""session-digest""#).unwrap(),
            IssueType::SessionDigest
        );
    }

    #[test]
    fn parse_bd_issue_json() {
        let json = r#"{
            "id": "demo-42",
            "title": "Fix the war rig",
            "type": "task",
            "status": "open",
            "priority": 1,
            "labels": ["gt:queued"]
        }"#;
        let issue: Issue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.id, "demo-42");
        assert!(issue.has_label(labels::QUEUED));
        assert!(issue.is_open());
        assert!(issue.blocked_by.is_empty());
    }

    #[test]
    fn routing_labels() {
        assert_eq!(labels::to_addr("demo/witness"), "gt:to:demo/witness");
        assert_eq!(labels::from_addr("mayor"), "gt:from:mayor");
    }
}
