use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Durable slot checkpoint for restart resume.
///
/// The live resume checkpoint is the in-memory `lastSlot` the stream loop
/// carries; this file only survives process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_processed_slot: u64,
    pub last_updated: i64,
    #[serde(skip)]
    last_saved_slot: u64,
}

impl Checkpoint {
    pub fn new(slot: u64) -> Self {
        Self {
            last_processed_slot: slot,
            last_updated: chrono::Utc::now().timestamp(),
            last_saved_slot: 0,
        }
    }

    /// Load checkpoint from file, returns None if the file doesn't exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        if !path.as_ref().exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path).context("Failed to read checkpoint file")?;
        let mut checkpoint: Checkpoint =
            serde_json::from_str(&contents).context("Failed to parse checkpoint file")?;
        checkpoint.last_saved_slot = checkpoint.last_processed_slot;

        info!(
            "✅ Loaded checkpoint: slot {} (updated at {})",
            checkpoint.last_processed_slot, checkpoint.last_updated
        );
        Ok(Some(checkpoint))
    }

    /// Save checkpoint to file (write temp, then rename).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create checkpoint directory")?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize checkpoint")?;

        let temp_path = path.as_ref().with_extension("tmp");
        fs::write(&temp_path, contents).context("Failed to write temp checkpoint file")?;
        fs::rename(&temp_path, &path).context("Failed to rename checkpoint file")?;

        self.last_saved_slot = self.last_processed_slot;
        Ok(())
    }

    pub fn update(&mut self, slot: u64) {
        self.last_processed_slot = slot;
        self.last_updated = chrono::Utc::now().timestamp();
    }

    /// Save if at least `interval` slots have passed since the last save.
    pub fn save_if_needed<P: AsRef<Path>>(&mut self, path: P, interval: u64) -> Result<bool> {
        if self.last_processed_slot >= self.last_saved_slot + interval {
            match self.save(&path) {
                Ok(_) => Ok(true),
                Err(e) => {
                    warn!("Failed to save checkpoint: {}", e);
                    Err(e)
                }
            }
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_checkpoint_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let mut checkpoint = Checkpoint::new(12345);
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap().unwrap();
        assert_eq!(loaded.last_processed_slot, 12345);

        let mut updated = loaded;
        updated.update(67890);
        updated.save(&path).unwrap();

        let reloaded = Checkpoint::load(&path).unwrap().unwrap();
        assert_eq!(reloaded.last_processed_slot, 67890);
    }

    #[test]
    fn test_checkpoint_load_nonexistent() {
        let result = Checkpoint::load("nonexistent.json").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_save_if_needed_respects_interval() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let mut checkpoint = Checkpoint::new(1000);
        checkpoint.save(&path).unwrap();

        checkpoint.update(1500);
        assert!(!checkpoint.save_if_needed(&path, 1000).unwrap());

        checkpoint.update(2000);
        assert!(checkpoint.save_if_needed(&path, 1000).unwrap());
        assert_eq!(
            Checkpoint::load(&path).unwrap().unwrap().last_processed_slot,
            2000
        );
    }
}
