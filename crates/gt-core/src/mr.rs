use chrono::{DateTime, Duration, Utc};

/// Claims older than this are stale and may be taken over.
pub const CLAIM_STALE_AFTER_MINS: i64 = 30;

/// Structured metadata carried in an MR issue's `## Metadata` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MrMetadata {
    pub source_branch: String,
    pub target_branch: String,
    pub source_issue: Option<String>,
    pub worker: String,
    pub claim: Option<Claim>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub holder: String,
    pub at: DateTime<Utc>,
}

impl Claim {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.at > Duration::minutes(CLAIM_STALE_AFTER_MINS)
    }
}

/// Metadata required on a conflict task filed by the refinery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictMetadata {
    pub original_mr: String,
    pub branch: String,
    pub target: String,
    pub source_issue: Option<String>,
    pub conflict_sha: String,
    pub retry_count: u32,
}

const SECTION: &str = "## Metadata";

fn render_section(fields: &[(&str, String)]) -> String {
    let mut out = String::from(SECTION);
    out.push('\n');
    for (key, value) in fields {
        out.push_str(&format!("- {key}: {value}\n"));
    }
    out
}

fn parse_section(description: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    let mut in_section = false;
    for line in description.lines() {
        let trimmed = line.trim();
        if trimmed == SECTION {
            in_section = true;
            continue;
        }
        if in_section {
            if trimmed.starts_with("##") {
                break;
            }
            let Some(rest) = trimmed.strip_prefix("- ") else {
                continue;
            };
            if let Some((key, value)) = rest.split_once(':') {
                fields.push((key.trim().to_string(), value.trim().to_string()));
            }
        }
    }
    fields
}

impl MrMetadata {
    pub fn render(&self) -> String {
        let mut fields = vec![
            ("Source branch", self.source_branch.clone()),
            ("Target branch", self.target_branch.clone()),
            ("Worker", self.worker.clone()),
        ];
        if let Some(src) = &self.source_issue {
            fields.push(("Source issue", src.clone()));
        }
        if let Some(claim) = &self.claim {
            fields.push((
                "Claimed by",
                format!("{} at {}", claim.holder, claim.at.to_rfc3339()),
            ));
        }
        render_section(&fields)
    }

    pub fn parse(description: &str) -> Option<Self> {
        let fields = parse_section(description);
        if fields.is_empty() {
            return None;
        }
        let mut meta = MrMetadata::default();
        for (key, value) in fields {
            match key.as_str() {
                "Source branch" => meta.source_branch = value,
                "Target branch" => meta.target_branch = value,
                "Worker" => meta.worker = value,
                "Source issue" => meta.source_issue = Some(value),
                "Claimed by" => {
                    if let Some((holder, at)) = value.rsplit_once(" at ") {
                        if let Ok(t) = DateTime::parse_from_rfc3339(at.trim()) {
                            meta.claim = Some(Claim {
                                holder: holder.trim().to_string(),
                                at: t.with_timezone(&Utc),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        if meta.source_branch.is_empty() {
            return None;
        }
        Some(meta)
    }
}

impl ConflictMetadata {
    pub fn render(&self) -> String {
        let mut fields = vec![
            ("Original MR", self.original_mr.clone()),
            ("Branch", self.branch.clone()),
            ("Target", self.target.clone()),
        ];
        if let Some(src) = &self.source_issue {
            fields.push(("Source issue", src.clone()));
        }
        fields.push(("Conflict with", self.conflict_sha.clone()));
        fields.push(("Retry count", self.retry_count.to_string()));
        render_section(&fields)
    }

    pub fn parse(description: &str) -> Option<Self> {
        let fields = parse_section(description);
        if fields.is_empty() {
            return None;
        }
        let mut meta = ConflictMetadata::default();
        for (key, value) in fields {
            match key.as_str() {
                "Original MR" => meta.original_mr = value,
                "Branch" => meta.branch = value,
                "Target" => meta.target = value,
                "Source issue" => meta.source_issue = Some(value),
                "Conflict with" => meta.conflict_sha = value,
                "Retry count" => meta.retry_count = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        if meta.original_mr.is_empty() {
            return None;
        }
        Some(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn mr_metadata_round_trip() {
        let meta = MrMetadata {
            source_branch: "polecat/nux".into(),
            target_branch: "main".into(),
            source_issue: Some("demo-12".into()),
            worker: "nux".into(),
            claim: Some(Claim {
                holder: "demo/refinery".into(),
                at: Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap(),
            }),
        };
        let rendered = format!("MR for nux's work.\n\n{}", meta.render());
        let parsed = MrMetadata::parse(&rendered).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn conflict_metadata_round_trip() {
        let meta = ConflictMetadata {
            original_mr: "demo-mr-1".into(),
            branch: "polecat/nux".into(),
            target: "main".into(),
            source_issue: Some("demo-12".into()),
            conflict_sha: "abc1234".into(),
            retry_count: 1,
        };
        let parsed = ConflictMetadata::parse(&meta.render()).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn conflict_section_has_required_fields() {
        let meta = ConflictMetadata {
            original_mr: "demo-mr-1".into(),
            branch: "polecat/nux".into(),
            target: "main".into(),
            source_issue: None,
            conflict_sha: "abc1234".into(),
            retry_count: 0,
        };
        let rendered = meta.render();
        assert!(rendered.contains("## Metadata"));
        for field in ["Original MR", "Branch", "Target", "Conflict with", "Retry count"] {
            assert!(rendered.contains(field), "missing {field}");
        }
    }

    #[test]
    fn claim_staleness_threshold() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let fresh = Claim {
            holder: "x".into(),
            at: now - Duration::minutes(29),
        };
        let stale = Claim {
            holder: "x".into(),
            at: now - Duration::minutes(31),
        };
        assert!(!fresh.is_stale(now));
        assert!(stale.is_stale(now));
    }

    #[test]
    fn parse_ignores_other_sections() {
        let desc = "## Summary\n- not: metadata\n\n## Metadata\n- Original MR: m1\n- Branch: b\n- Target: main\n- Conflict with: sha\n- Retry count: 2\n\n## Notes\n- Branch: wrong\n";
        let parsed = ConflictMetadata::parse(desc).unwrap();
        assert_eq!(parsed.original_mr, "m1");
        assert_eq!(parsed.retry_count, 2);
        assert_eq!(parsed.branch, "b");
    }
}
