use chrono::{DateTime, Utc};

/// Current metadata block delimiter.
pub const DELIMITER: &str = "---gt:scheduler:v1---";
/// Legacy delimiter, read-only; blocks found under it are upgraded in
/// place on the next write.
pub const LEGACY_DELIMITER: &str = "---gt:queue:v1---";

/// Scheduler metadata carried in a delimited block inside an issue's
/// description. Unknown keys survive a parse/format cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerMetadata {
    pub target_rig: String,
    pub formula: String,
    pub args: Vec<String>,
    /// `K=V` entries; stored as repeated `var:` lines so values may
    /// contain commas.
    pub vars: Vec<String>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub merge_mode: Option<String>,
    pub convoy: Option<String>,
    pub base_branch: Option<String>,
    pub account: Option<String>,
    pub agent: Option<String>,
    pub hook_raw_bead: bool,
    pub dispatch_failures: u32,
    pub last_failure: Option<String>,
    /// Keys this version does not know, preserved verbatim in order.
    pub unknown: Vec<(String, String)>,
}

/// Result of locating a metadata block in a description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBlock {
    pub meta: SchedulerMetadata,
    /// True when the block used the legacy delimiter and should be
    /// rewritten with the current one.
    pub legacy: bool,
}

/// Escape a value for a metadata line: no embedded newlines, no
/// delimiter strings.
fn sanitize(value: &str) -> String {
    value
        .replace(DELIMITER, "")
        .replace(LEGACY_DELIMITER, "")
        .replace('\r', "")
        .replace('\n', "\\n")
}

fn unsanitize(value: &str) -> String {
    value.replace("\\n", "\n")
}

impl SchedulerMetadata {
    /// Render the delimited block (opening line, `key: value` lines,
    /// closing line).
    pub fn format(&self) -> String {
        let mut lines = vec![DELIMITER.to_string()];
        lines.push(format!("target_rig: {}", sanitize(&self.target_rig)));
        lines.push(format!("formula: {}", sanitize(&self.formula)));
        for arg in &self.args {
            lines.push(format!("arg: {}", sanitize(arg)));
        }
        for var in &self.vars {
            lines.push(format!("var: {}", sanitize(var)));
        }
        if let Some(t) = &self.enqueued_at {
            lines.push(format!("enqueued_at: {}", t.to_rfc3339()));
        }
        if let Some(v) = &self.merge_mode {
            lines.push(format!("merge_mode: {}", sanitize(v)));
        }
        if let Some(v) = &self.convoy {
            lines.push(format!("convoy: {}", sanitize(v)));
        }
        if let Some(v) = &self.base_branch {
            lines.push(format!("base_branch: {}", sanitize(v)));
        }
        if let Some(v) = &self.account {
            lines.push(format!("account: {}", sanitize(v)));
        }
        if let Some(v) = &self.agent {
            lines.push(format!("agent: {}", sanitize(v)));
        }
        if self.hook_raw_bead {
            lines.push("hook_raw_bead: true".into());
        }
        if self.dispatch_failures > 0 {
            lines.push(format!("dispatch_failures: {}", self.dispatch_failures));
        }
        if let Some(v) = &self.last_failure {
            lines.push(format!("last_failure: {}", sanitize(v)));
        }
        for (k, v) in &self.unknown {
            lines.push(format!("{k}: {v}"));
        }
        lines.push(DELIMITER.to_string());
        lines.join("\n")
    }

    /// Append this block to a description, separated by one blank line.
    pub fn attach(&self, description: &str) -> String {
        let stripped = strip(description);
        if stripped.is_empty() {
            self.format()
        } else {
            format!("{}\n\n{}", stripped.trim_end_matches('\n'), self.format())
        }
    }

    /// Find and parse the metadata block in a description. Tries the
    /// current delimiter first, then the legacy one.
    pub fn parse(description: &str) -> Option<ParsedBlock> {
        for (delim, legacy) in [(DELIMITER, false), (LEGACY_DELIMITER, true)] {
            if let Some(meta) = parse_with(description, delim) {
                return Some(ParsedBlock { meta, legacy });
            }
        }
        None
    }
}

fn parse_with(description: &str, delim: &str) -> Option<SchedulerMetadata> {
    let mut in_block = false;
    let mut meta = SchedulerMetadata::default();
    let mut saw_block = false;

    for line in description.lines() {
        if line.trim() == delim {
            if in_block {
                return Some(meta);
            }
            in_block = true;
            saw_block = true;
            continue;
        }
        if !in_block {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "target_rig" => meta.target_rig = unsanitize(value),
            "formula" => meta.formula = unsanitize(value),
            "arg" => meta.args.push(unsanitize(value)),
            "var" => meta.vars.push(unsanitize(value)),
            "enqueued_at" => {
                meta.enqueued_at = DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|t| t.with_timezone(&Utc));
            }
            "merge_mode" => meta.merge_mode = Some(unsanitize(value)),
            "convoy" => meta.convoy = Some(unsanitize(value)),
            "base_branch" => meta.base_branch = Some(unsanitize(value)),
            "account" => meta.account = Some(unsanitize(value)),
            "agent" => meta.agent = Some(unsanitize(value)),
            "hook_raw_bead" => meta.hook_raw_bead = value == "true",
            "dispatch_failures" => {
                meta.dispatch_failures = value.parse().unwrap_or(0);
            }
            "last_failure" => meta.last_failure = Some(unsanitize(value)),
            _ => meta.unknown.push((key.to_string(), value.to_string())),
        }
    }

    // Unterminated block still counts; tolerate descriptions whose tail
    // was truncated by an external editor.
    if saw_block {
        Some(meta)
    } else {
        None
    }
}

/// Remove exactly the metadata block (current or legacy delimiter),
/// leaving the rest of the description bit-identical.
pub fn strip(description: &str) -> String {
    for delim in [DELIMITER, LEGACY_DELIMITER] {
        if let Some(start) = description.find(delim) {
            let after_open = start + delim.len();
            let end = match description[after_open..].find(delim) {
                Some(close) => after_open + close + delim.len(),
                None => description.len(),
            };
            let mut out = String::new();
            // Drop the blank separator line `attach` emitted, if present.
            let head = &description[..start];
            out.push_str(head.strip_suffix("\n\n").unwrap_or(head));
            let tail = &description[end..];
            out.push_str(tail.strip_prefix('\n').unwrap_or(tail));
            return out;
        }
    }
    description.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> SchedulerMetadata {
        SchedulerMetadata {
            target_rig: "demo".into(),
            formula: "polecat-work".into(),
            args: vec!["gt-demo-12".into()],
            vars: vec!["branch=feature/x".into(), "note=a,b,c".into()],
            enqueued_at: Some(Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap()),
            merge_mode: Some("rebase-ff".into()),
            convoy: None,
            base_branch: Some("main".into()),
            account: None,
            agent: Some("claude".into()),
            hook_raw_bead: false,
            dispatch_failures: 0,
            last_failure: None,
            unknown: vec![],
        }
    }

    #[test]
    fn format_parse_round_trip() {
        let meta = sample();
        let parsed = SchedulerMetadata::parse(&meta.format()).unwrap();
        assert!(!parsed.legacy);
        assert_eq!(parsed.meta, meta);
    }

    #[test]
    fn attach_and_parse_from_description() {
        let desc = "Fix the flux capacitor.\n\nDetails follow.";
        let attached = sample().attach(desc);
        let parsed = SchedulerMetadata::parse(&attached).unwrap();
        assert_eq!(parsed.meta.target_rig, "demo");
        assert_eq!(parsed.meta.vars.len(), 2);
    }

    #[test]
    fn strip_leaves_unrelated_text_bit_identical() {
        let desc = "Fix the flux capacitor.\n\nDetails follow.";
        let attached = sample().attach(desc);
        assert_eq!(strip(&attached), desc);
        // No block: identity.
        assert_eq!(strip(desc), desc);
    }

    #[test]
    fn vars_tolerate_commas() {
        let attached = sample().attach("");
        let parsed = SchedulerMetadata::parse(&attached).unwrap();
        assert_eq!(parsed.meta.vars[1], "note=a,b,c");
    }

    #[test]
    fn legacy_delimiter_is_read_and_flagged() {
        let block = sample().format().replace(DELIMITER, LEGACY_DELIMITER);
        let parsed = SchedulerMetadata::parse(&block).unwrap();
        assert!(parsed.legacy);
        assert_eq!(parsed.meta.formula, "polecat-work");
    }

    #[test]
    fn values_are_sanitized() {
        let mut meta = sample();
        meta.last_failure = Some(format!("boom\nwith {DELIMITER} inside"));
        let rendered = meta.format();
        // One opening and one closing delimiter line only.
        assert_eq!(rendered.matches(DELIMITER).count(), 2);
        let parsed = SchedulerMetadata::parse(&rendered).unwrap();
        assert_eq!(
            parsed.meta.last_failure.as_deref(),
            Some("boom\nwith  inside")
        );
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let rendered = format!(
            "{DELIMITER}\ntarget_rig: demo\nformula: f\nfuture_key: 42\n{DELIMITER}"
        );
        let parsed = SchedulerMetadata::parse(&rendered).unwrap();
        assert_eq!(parsed.meta.unknown, vec![("future_key".into(), "42".into())]);
        let re_rendered = parsed.meta.format();
        assert!(re_rendered.contains("future_key: 42"));
    }

    #[test]
    fn counters_survive_rewrite() {
        let mut meta = sample();
        meta.dispatch_failures = 2;
        meta.last_failure = Some("spawn failed".into());
        let parsed = SchedulerMetadata::parse(&meta.format()).unwrap();
        assert_eq!(parsed.meta.dispatch_failures, 2);
        assert_eq!(parsed.meta.last_failure.as_deref(), Some("spawn failed"));
    }
}
