use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const CHECKPOINT_FILE: &str = ".gt-checkpoint.json";

/// Session handoff state, written by `gt handoff` in a worker's
/// directory and read back by `gt prime` when the next session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub hooked_work: Option<String>,
    pub branch: Option<String>,
    pub last_commit: Option<String>,
    pub modified_files: Vec<String>,
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Write the checkpoint into the given worker directory.
    pub fn write(&self, dir: &Path) -> anyhow::Result<()> {
        let path = dir.join(CHECKPOINT_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(())
    }

    pub fn read(dir: &Path) -> anyhow::Result<Option<Self>> {
        let path = dir.join(CHECKPOINT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    pub fn clear(dir: &Path) -> anyhow::Result<bool> {
        let path = dir.join(CHECKPOINT_FILE);
        if path.exists() {
            std::fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cp = Checkpoint {
            hooked_work: Some("demo-12".into()),
            branch: Some("polecat/nux".into()),
            last_commit: Some("abc1234".into()),
            modified_files: vec!["src/main.rs".into()],
            notes: Some("tests half done".into()),
            timestamp: Utc::now(),
        };

        cp.write(dir.path()).unwrap();
        let loaded = Checkpoint::read(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.hooked_work, Some("demo-12".into()));
        assert_eq!(loaded.modified_files.len(), 1);

        assert!(Checkpoint::clear(dir.path()).unwrap());
        assert!(Checkpoint::read(dir.path()).unwrap().is_none());
        assert!(!Checkpoint::clear(dir.path()).unwrap());
    }
}
