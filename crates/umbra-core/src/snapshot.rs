//! # Snapshots
//!
//! Lightweight copies of the settings document taken before a change is
//! applied, so the change can be rolled back.

use crate::settings::Settings;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of snapshots retained.
pub const MAX_SNAPSHOTS: usize = 10;

/// A stored snapshot. `data` is the settings document without `history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub at: String,
    pub label: String,
    pub data: Value,
}

/// `history`: snapshots, newest first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct History {
    pub snapshots: Vec<Snapshot>,
    pub last_snapshot_id: Option<String>,
}

impl Settings {
    /// Snapshot the current document under `label`. Returns the snapshot id.
    pub fn create_snapshot(&mut self, label: &str) -> Result<String> {
        self.create_snapshot_at(label, crate::epoch_millis())
    }

    /// Snapshot with an explicit clock reading (epoch milliseconds).
    ///
    /// Ids are strictly increasing even when two snapshots share a millisecond.
    pub fn create_snapshot_at(&mut self, label: &str, now_ms: u64) -> Result<String> {
        let label = match label.trim() {
            "" => "Snapshot",
            l => l,
        };

        let newest = self
            .history
            .snapshots
            .iter()
            .filter_map(|s| s.id.parse::<u64>().ok())
            .max();
        let id = match newest {
            Some(prev) if now_ms <= prev => prev.saturating_add(1),
            _ => now_ms,
        }
        .to_string();

        let mut data = self.to_value()?;
        if let Value::Object(map) = &mut data {
            map.remove("history");
        }

        self.history.snapshots.insert(
            0,
            Snapshot {
                id: id.clone(),
                at: crate::timestamp(),
                label: label.to_string(),
                data,
            },
        );
        self.history.snapshots.truncate(MAX_SNAPSHOTS);
        self.history.last_snapshot_id = Some(id.clone());
        Ok(id)
    }

    /// Restore the snapshot with `id`.
    ///
    /// `meta.app`, `meta.version`, `meta.created_at` and the history itself
    /// are kept from the current document.
    pub fn rollback_snapshot(&mut self, id: &str) -> Result<()> {
        let id = id.trim();
        let snapshot = self
            .history
            .snapshots
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("snapshot {id}")))?;

        let mut restored = Settings::from_value(snapshot.data.clone())?;
        restored.meta.app = self.meta.app.clone();
        restored.meta.version = self.meta.version.clone();
        restored.meta.created_at = self.meta.created_at.clone();
        restored.history = std::mem::take(&mut self.history);

        *self = restored;
        Ok(())
    }

    /// Restore the newest snapshot.
    pub fn rollback_last(&mut self) -> Result<String> {
        let id = self
            .history
            .snapshots
            .first()
            .map(|s| s.id.clone())
            .ok_or_else(|| CoreError::NotFound("snapshot".to_string()))?;
        self.rollback_snapshot(&id)?;
        Ok(id)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_excludes_history() {
        let mut s = Settings::default();
        s.create_snapshot_at("first", 1_000).unwrap();
        s.create_snapshot_at("second", 2_000).unwrap();
        let snap = &s.history.snapshots[0];
        assert_eq!(snap.label, "second");
        assert!(snap.data.get("history").is_none());
        assert_eq!(s.history.last_snapshot_id.as_deref(), Some("2000"));
    }

    #[test]
    fn snapshot_ids_strictly_increase() {
        let mut s = Settings::default();
        let a = s.create_snapshot_at("a", 5_000).unwrap();
        let b = s.create_snapshot_at("b", 5_000).unwrap();
        let c = s.create_snapshot_at("c", 4_000).unwrap();
        assert_eq!(a, "5000");
        assert_eq!(b, "5001");
        assert_eq!(c, "5002");
    }

    #[test]
    fn history_is_capped() {
        let mut s = Settings::default();
        for i in 0..15u64 {
            s.create_snapshot_at(&format!("s{i}"), 1_000 + i).unwrap();
        }
        assert_eq!(s.history.snapshots.len(), MAX_SNAPSHOTS);
        assert_eq!(s.history.snapshots[0].label, "s14");
    }

    #[test]
    fn blank_label_defaults() {
        let mut s = Settings::default();
        s.create_snapshot_at("  ", 1).unwrap();
        assert_eq!(s.history.snapshots[0].label, "Snapshot");
    }

    #[test]
    fn rollback_restores_data_but_keeps_history_and_meta() {
        let mut s = Settings::default();
        s.ui.refresh_interval_s = 30;
        let id = s.create_snapshot_at("before", 10).unwrap();

        s.ui.refresh_interval_s = 5;
        s.meta.version = "9.9.9".to_string();
        s.rollback_snapshot(&id).unwrap();

        assert_eq!(s.ui.refresh_interval_s, 30);
        assert_eq!(s.meta.version, "9.9.9");
        assert_eq!(s.history.snapshots.len(), 1);
    }

    #[test]
    fn rollback_last_and_missing() {
        let mut s = Settings::default();
        assert!(s.rollback_last().is_err());
        s.subscriptions.push("https://a".to_string());
        s.create_snapshot_at("with sub", 1).unwrap();
        s.subscriptions.clear();
        assert_eq!(s.rollback_last().unwrap(), "1");
        assert_eq!(s.subscriptions, vec!["https://a".to_string()]);
        assert!(matches!(
            s.rollback_snapshot("nope"),
            Err(CoreError::NotFound(_))
        ));
    }
}
