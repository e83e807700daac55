use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::GtError;
use crate::issue::IssueType;

/// Consecutive `update` events for the same target inside this window
/// (inclusive) are collapsed to one.
pub const DEDUP_WINDOW_SECS: i64 = 2;

/// Recommended reader poll interval.
pub const TAIL_POLL_MS: u64 = 100;

/// One immutable activity record, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub rig: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub message: String,
}

impl Event {
    pub fn new(kind: impl Into<String>, actor: impl Into<String>) -> Self {
        Event {
            time: Utc::now(),
            kind: kind.into(),
            actor: actor.into(),
            target: String::new(),
            rig: String::new(),
            role: String::new(),
            message: String::new(),
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn rig(mut self, rig: impl Into<String>) -> Self {
        self.rig = rig.into();
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Append-only JSONL writer with the dedup and suppression rules.
/// Dedup state is per-writer and in-memory.
pub struct FeedWriter {
    path: PathBuf,
    last_update: Option<(String, DateTime<Utc>)>,
}

impl FeedWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FeedWriter {
            path: path.into(),
            last_update: None,
        }
    }

    /// Append one event as a whole line. Never truncates or rewrites.
    /// Returns false when the event was collapsed by dedup.
    pub fn write(&mut self, event: &Event) -> Result<bool, GtError> {
        let mut event = event.clone();
        if event.kind.is_empty() {
            // Unclassifiable events still get written.
            event.kind = "other".into();
        }

        if event.kind == "update" {
            if let Some((target, at)) = &self.last_update {
                if *target == event.target
                    && event.time - *at <= Duration::seconds(DEDUP_WINDOW_SECS)
                {
                    return Ok(false);
                }
            }
            self.last_update = Some((event.target.clone(), event.time));
        } else {
            self.last_update = None;
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(&event)
            .map_err(|e| GtError::ConfigParse(e.to_string()))?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(true)
    }

    /// Issue-update convenience that applies the agent-session
    /// suppression rule: updates to `agent`-type issues never reach the
    /// feed (they are high-frequency and visible in the agent tree).
    pub fn write_issue_update(
        &mut self,
        issue_type: IssueType,
        event: &Event,
    ) -> Result<bool, GtError> {
        if issue_type == IssueType::Agent {
            return Ok(false);
        }
        self.write(event)
    }
}

/// Resumable tail reader: seek to a known offset (or the end), then
/// poll for appended complete lines.
pub struct FeedTailer {
    path: PathBuf,
    offset: u64,
}

impl FeedTailer {
    /// Start tailing from the current end of file.
    pub fn from_end(path: impl Into<PathBuf>) -> Result<Self, GtError> {
        let path = path.into();
        let offset = match std::fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(_) => 0,
        };
        Ok(FeedTailer { path, offset })
    }

    /// Resume from a previously saved offset.
    pub fn from_offset(path: impl Into<PathBuf>, offset: u64) -> Self {
        FeedTailer {
            path: path.into(),
            offset,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read any complete lines appended since the last poll. A trailing
    /// partial line is left for the next poll.
    pub fn poll(&mut self) -> Result<Vec<Event>, GtError> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Ok(vec![]),
        };
        let len = file.metadata()?.len();
        if len <= self.offset {
            // Writers never truncate; a shorter file means rotation.
            if len < self.offset {
                self.offset = 0;
            } else {
                return Ok(vec![]);
            }
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;

        let mut events = Vec::new();
        let mut consumed = 0usize;
        for line in buf.split_inclusive('\n') {
            if !line.ends_with('\n') {
                break;
            }
            consumed += line.len();
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(trimmed) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("skipping malformed feed line: {e}"),
            }
        }
        self.offset += consumed as u64;
        Ok(events)
    }
}

/// Convenience for one-off writers that don't hold dedup state.
pub fn append(path: &Path, event: &Event) -> Result<(), GtError> {
    FeedWriter::new(path).write(event)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ev(kind: &str, target: &str, time: DateTime<Utc>) -> Event {
        let mut e = Event::new(kind, "witness").target(target).rig("demo");
        e.time = time;
        e
    }

    #[test]
    fn append_and_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        let mut tailer = FeedTailer::from_end(&path).unwrap();
        let mut writer = FeedWriter::new(&path);

        writer
            .write(&Event::new("spawn", "witness").target("nux"))
            .unwrap();
        writer
            .write(&Event::new("merge", "refinery").target("demo-mr-1"))
            .unwrap();

        let events = tailer.poll().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "spawn");
        assert_eq!(events[1].target, "demo-mr-1");
        // Nothing new on the next poll.
        assert!(tailer.poll().unwrap().is_empty());
    }

    #[test]
    fn dedup_window_is_two_seconds_inclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        let mut writer = FeedWriter::new(&path);
        let t0 = Utc::now();

        assert!(writer.write(&ev("update", "demo-1", t0)).unwrap());
        // Exactly at the window boundary: collapsed (inclusive).
        assert!(!writer
            .write(&ev("update", "demo-1", t0 + Duration::seconds(2)))
            .unwrap());
        // Past the window: written.
        assert!(writer
            .write(&ev("update", "demo-1", t0 + Duration::seconds(3)))
            .unwrap());
        // Different target: written.
        assert!(writer
            .write(&ev("update", "demo-2", t0 + Duration::seconds(3)))
            .unwrap());
    }

    #[test]
    fn non_update_breaks_dedup_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        let mut writer = FeedWriter::new(&path);
        let t0 = Utc::now();

        assert!(writer.write(&ev("update", "demo-1", t0)).unwrap());
        assert!(writer.write(&ev("merge", "demo-1", t0)).unwrap());
        // Not consecutive any more, so this update is written.
        assert!(writer
            .write(&ev("update", "demo-1", t0 + Duration::seconds(1)))
            .unwrap());
    }

    #[test]
    fn agent_session_updates_are_suppressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        let mut writer = FeedWriter::new(&path);
        let written = writer
            .write_issue_update(IssueType::Agent, &ev("update", "agent-1", Utc::now()))
            .unwrap();
        assert!(!written);
        assert!(!path.exists());
    }

    #[test]
    fn unclassified_events_become_other() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        let mut writer = FeedWriter::new(&path);
        writer.write(&Event::new("", "someone")).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(r#""type":"other""#));
    }

    #[test]
    fn resumable_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        let mut writer = FeedWriter::new(&path);
        let mut tailer = FeedTailer::from_end(&path).unwrap();

        writer.write(&Event::new("spawn", "a")).unwrap();
        tailer.poll().unwrap();
        let saved = tailer.offset();

        writer.write(&Event::new("nuke", "b")).unwrap();
        let mut resumed = FeedTailer::from_offset(&path, saved);
        let events = resumed.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "nuke");
    }

    #[test]
    fn partial_lines_wait_for_completion() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        std::fs::write(&path, "{\"time\":\"2026-01-05T00:00:00Z\",\"type\":\"spawn\",\"actor\":\"a\"}\n{\"time\":\"2026-01-05T00:00:01Z\"").unwrap();
        let mut tailer = FeedTailer::from_offset(&path, 0);
        let events = tailer.poll().unwrap();
        assert_eq!(events.len(), 1);
        // Offset stops at the start of the partial line.
        let complete_len = path.metadata().unwrap().len()
            - "{\"time\":\"2026-01-05T00:00:01Z\"".len() as u64;
        assert_eq!(tailer.offset(), complete_len);
    }
}
