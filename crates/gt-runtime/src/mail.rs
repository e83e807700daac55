use gt_core::errors::GtError;
use gt_core::identity::AgentId;
use gt_core::issue::{labels, Issue, IssueType};

use crate::cancel::CancelToken;
use crate::ledger::{Ledger, ListFilter, UpdateFields};
use crate::tmux::Tmux;

/// Subjects the supervisors dispatch on. Unknown subjects are delivered
/// but not acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WellKnownSubject {
    MergeReady { worker: String },
    Merged { worker: String },
    MergeFailed { worker: String, failure: FailureType },
    PolecatDone,
    Help,
    Handoff,
    HealthCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    Conflict,
    QualityCheck,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::Conflict => "conflict",
            FailureType::QualityCheck => "quality-check",
        }
    }
}

impl WellKnownSubject {
    pub fn render(&self) -> String {
        match self {
            WellKnownSubject::MergeReady { worker } => format!("MERGE_READY {worker}"),
            WellKnownSubject::Merged { worker } => format!("MERGED {worker}"),
            WellKnownSubject::MergeFailed { worker, failure } => {
                format!("MERGE_FAILED {worker} FailureType:{}", failure.as_str())
            }
            WellKnownSubject::PolecatDone => "POLECAT_DONE".into(),
            WellKnownSubject::Help => "HELP".into(),
            WellKnownSubject::Handoff => "HANDOFF".into(),
            WellKnownSubject::HealthCheck => "HEALTH_CHECK".into(),
        }
    }

    /// Prefix-dispatch a subject line.
    pub fn parse(subject: &str) -> Option<Self> {
        let subject = subject.trim();
        if let Some(rest) = subject.strip_prefix("MERGE_READY ") {
            return Some(WellKnownSubject::MergeReady {
                worker: rest.trim().to_string(),
            });
        }
        if let Some(rest) = subject.strip_prefix("MERGED ") {
            return Some(WellKnownSubject::Merged {
                worker: rest.trim().to_string(),
            });
        }
        if let Some(rest) = subject.strip_prefix("MERGE_FAILED ") {
            let mut parts = rest.split_whitespace();
            let worker = parts.next()?.to_string();
            let failure = match parts.next().and_then(|p| p.strip_prefix("FailureType:")) {
                Some("conflict") => FailureType::Conflict,
                Some("quality-check") => FailureType::QualityCheck,
                _ => return None,
            };
            return Some(WellKnownSubject::MergeFailed { worker, failure });
        }
        match subject {
            "POLECAT_DONE" => Some(WellKnownSubject::PolecatDone),
            "HELP" => Some(WellKnownSubject::Help),
            "HANDOFF" => Some(WellKnownSubject::Handoff),
            "HEALTH_CHECK" => Some(WellKnownSubject::HealthCheck),
            _ => None,
        }
    }
}

/// A delivered message, reconstructed from its ledger item.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub from: Option<String>,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub unread: bool,
}

impl Message {
    fn from_issue(issue: Issue) -> Self {
        let from = issue
            .labels
            .iter()
            .find_map(|l| l.strip_prefix("gt:from:").map(str::to_string));
        let to = issue
            .labels
            .iter()
            .find_map(|l| l.strip_prefix("gt:to:").map(str::to_string))
            .unwrap_or_default();
        let unread = issue.has_label(labels::INBOX);
        Message {
            id: issue.id,
            from,
            to,
            subject: issue.title,
            body: issue.description,
            unread,
        }
    }
}

/// Messages are first-class ledger items labeled `gt:mail`, with
/// routing and state carried as labels. A recipient with no live
/// session still receives mail; its first act on start is reading the
/// inbox.
pub struct MessageBus {
    ledger: Ledger,
    tmux: Tmux,
}

impl MessageBus {
    pub fn new(ledger: Ledger, tmux: Tmux) -> Self {
        MessageBus { ledger, tmux }
    }

    pub async fn send(
        &self,
        from: &AgentId,
        to: &AgentId,
        subject: &str,
        body: &str,
        cancel: &CancelToken,
    ) -> Result<String, GtError> {
        let message_labels = vec![
            labels::MAIL.to_string(),
            labels::INBOX.to_string(),
            labels::to_addr(&to.render()),
            labels::from_addr(&from.render()),
        ];
        let id = self
            .ledger
            .create(IssueType::Task, subject, body, &message_labels, Some(3), cancel)
            .await?;
        tracing::debug!("mail {id}: {} -> {} '{subject}'", from.render(), to.render());
        Ok(id)
    }

    pub async fn inbox(
        &self,
        recipient: &AgentId,
        cancel: &CancelToken,
    ) -> Result<Vec<Message>, GtError> {
        let filter = ListFilter {
            labels: vec![
                labels::MAIL.to_string(),
                labels::to_addr(&recipient.render()),
            ],
            ..Default::default()
        };
        let issues = self.ledger.list(&filter, cancel).await?;
        Ok(issues
            .into_iter()
            .filter(|i| i.is_open())
            .map(Message::from_issue)
            .collect())
    }

    /// Mark a message read. Idempotent.
    pub async fn read(&self, message_id: &str, cancel: &CancelToken) -> Result<Message, GtError> {
        let issue = self.ledger.show(message_id, cancel).await?;
        if issue.has_label(labels::INBOX) {
            self.ledger
                .update(
                    message_id,
                    &UpdateFields {
                        add_labels: vec![labels::READ.to_string()],
                        remove_labels: vec![labels::INBOX.to_string()],
                        ..Default::default()
                    },
                    cancel,
                )
                .await?;
        }
        Ok(Message::from_issue(issue))
    }

    /// Archive = close the underlying item; closing twice is a no-op.
    pub async fn archive(&self, message_id: &str, cancel: &CancelToken) -> Result<(), GtError> {
        self.ledger.close(message_id, Some("archived"), cancel).await
    }

    /// Store a message, then best-effort poke the recipient's session.
    /// The keystroke is a notification, never a delivery guarantee.
    pub async fn nudge(
        &self,
        from: &AgentId,
        to: &AgentId,
        text: &str,
        cancel: &CancelToken,
    ) -> Result<String, GtError> {
        let id = self.send(from, to, "NUDGE", text, cancel).await?;
        let session = to.session_name();
        match self.tmux.has(&session).await {
            Ok(true) => {
                if let Err(e) = self
                    .tmux
                    .send_keys(&session, &format!("gt mail inbox # {text}"), true)
                    .await
                {
                    tracing::debug!("nudge keystroke to {session} failed: {e}");
                }
            }
            _ => {
                tracing::debug!("nudge: no live session for {}", to.render());
            }
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gt_core::issue::{IssueStatus, IssueType};

    #[test]
    fn well_known_subject_round_trip() {
        let cases = vec![
            WellKnownSubject::MergeReady {
                worker: "nux".into(),
            },
            WellKnownSubject::Merged {
                worker: "nux".into(),
            },
            WellKnownSubject::MergeFailed {
                worker: "nux".into(),
                failure: FailureType::Conflict,
            },
            WellKnownSubject::MergeFailed {
                worker: "slit".into(),
                failure: FailureType::QualityCheck,
            },
            WellKnownSubject::PolecatDone,
            WellKnownSubject::Help,
            WellKnownSubject::Handoff,
            WellKnownSubject::HealthCheck,
        ];
        for subject in cases {
            let rendered = subject.render();
            assert_eq!(WellKnownSubject::parse(&rendered), Some(subject), "{rendered}");
        }
    }

    #[test]
    fn unknown_subjects_are_inert() {
        assert_eq!(WellKnownSubject::parse("HELLO nux"), None);
        assert_eq!(WellKnownSubject::parse("MERGE_FAILED nux"), None);
        assert_eq!(
            WellKnownSubject::parse("MERGE_FAILED nux FailureType:weird"),
            None
        );
    }

    #[test]
    fn message_reconstruction_from_issue() {
        let issue = Issue {
            id: "town-9".into(),
            title: "MERGED nux".into(),
            description: "branch landed".into(),
            issue_type: IssueType::Task,
            status: IssueStatus::Open,
            priority: 3,
            labels: vec![
                labels::MAIL.to_string(),
                labels::INBOX.to_string(),
                "gt:to:demo/witness".into(),
                "gt:from:demo/refinery".into(),
            ],
            assignee: None,
            blocked_by: vec![],
            created_at: None,
            updated_at: None,
        };
        let msg = Message::from_issue(issue);
        assert_eq!(msg.to, "demo/witness");
        assert_eq!(msg.from.as_deref(), Some("demo/refinery"));
        assert!(msg.unread);
        assert_eq!(
            WellKnownSubject::parse(&msg.subject),
            Some(WellKnownSubject::Merged {
                worker: "nux".into()
            })
        );
    }
}
