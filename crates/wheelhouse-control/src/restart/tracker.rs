//! Status of restart passes running in the background.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ControlError, ControlResult};

use super::RestartSummary;

/// Unique identifier for a restart pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RestartId(String);

impl RestartId {
    /// Wrap an existing id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique id.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RestartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a restart pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RestartStatus {
    /// Registered, not yet started.
    Pending,
    /// Cycling groups.
    Running,
    /// Finished with at least partial success.
    Completed {
        /// Per-group outcome.
        summary: RestartSummary,
    },
    /// Finished without restarting anything.
    Failed {
        /// What went wrong.
        message: String,
    },
}

impl RestartStatus {
    /// Whether the pass has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// A tracked restart pass.
#[derive(Debug, Clone, Serialize)]
pub struct RestartRecord {
    /// Pass id.
    pub id: RestartId,
    /// Current status.
    #[serde(flatten)]
    pub status: RestartStatus,
    /// When the pass was registered.
    pub created_at: DateTime<Utc>,
    /// When the pass finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct TrackerState {
    records: HashMap<RestartId, RestartRecord>,
    finished: VecDeque<RestartId>,
}

/// Keeps the status of recent restart passes.
///
/// Finished passes beyond `history_limit` are evicted oldest first. Passes
/// still pending or running are never evicted.
#[derive(Debug)]
pub struct RestartTracker {
    state: RwLock<TrackerState>,
    history_limit: usize,
}

impl RestartTracker {
    /// Create a tracker keeping at most `history_limit` finished passes.
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            history_limit,
        }
    }

    /// Register a new pass in the pending state.
    pub async fn register(&self) -> RestartId {
        let id = RestartId::generate();
        let record = RestartRecord {
            id: id.clone(),
            status: RestartStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.state.write().await.records.insert(id.clone(), record);
        id
    }

    /// Mark a pass as running.
    pub async fn mark_running(&self, id: &RestartId) {
        if let Some(record) = self.state.write().await.records.get_mut(id) {
            record.status = RestartStatus::Running;
        }
    }

    /// Record the outcome of a pass.
    pub async fn finish(&self, id: &RestartId, outcome: &ControlResult<RestartSummary>) {
        let status = match outcome {
            Ok(summary) => RestartStatus::Completed {
                summary: summary.clone(),
            },
            Err(ControlError::RestartFailed(message)) => RestartStatus::Failed {
                message: message.clone(),
            },
            Err(e) => RestartStatus::Failed {
                message: e.public_message(),
            },
        };

        let mut state = self.state.write().await;
        let Some(record) = state.records.get_mut(id) else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }
        record.status = status;
        record.finished_at = Some(Utc::now());

        state.finished.push_back(id.clone());
        while state.finished.len() > self.history_limit {
            if let Some(oldest) = state.finished.pop_front() {
                state.records.remove(&oldest);
            }
        }
    }

    /// Look up a pass.
    pub async fn get(&self, id: &RestartId) -> Option<RestartRecord> {
        self.state.read().await.records.get(id).cloned()
    }
}

impl Default for RestartTracker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle() {
        let tracker = RestartTracker::default();
        let id = tracker.register().await;
        assert_eq!(
            tracker.get(&id).await.unwrap().status,
            RestartStatus::Pending
        );

        tracker.mark_running(&id).await;
        assert_eq!(
            tracker.get(&id).await.unwrap().status,
            RestartStatus::Running
        );

        let summary = RestartSummary {
            restarted: vec!["statefulset/worker".to_owned()],
            ..RestartSummary::default()
        };
        tracker.finish(&id, &Ok(summary.clone())).await;

        let record = tracker.get(&id).await.unwrap();
        assert_eq!(record.status, RestartStatus::Completed { summary });
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn failure_messages_are_sanitised() {
        let tracker = RestartTracker::default();
        let id = tracker.register().await;
        tracker
            .finish(&id, &Err(ControlError::upstream("10.0.0.1 refused")))
            .await;

        let record = tracker.get(&id).await.unwrap();
        assert_eq!(
            record.status,
            RestartStatus::Failed {
                message: "Internal server error".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn evicts_oldest_finished() {
        let tracker = RestartTracker::new(2);
        let running = tracker.register().await;
        tracker.mark_running(&running).await;

        let mut finished = Vec::new();
        for _ in 0..3 {
            let id = tracker.register().await;
            tracker.finish(&id, &Ok(RestartSummary::default())).await;
            finished.push(id);
        }

        assert!(tracker.get(&finished[0]).await.is_none());
        assert!(tracker.get(&finished[1]).await.is_some());
        assert!(tracker.get(&finished[2]).await.is_some());
        assert!(tracker.get(&running).await.is_some());
    }

    #[test]
    fn status_serialises_with_state_tag() {
        let json = serde_json::to_value(RestartStatus::Failed {
            message: "boom".to_owned(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"state": "failed", "message": "boom"}));
    }
}
