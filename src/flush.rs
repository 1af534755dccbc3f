//! Supervised administrative flush.
//!
//! Emptying the metadata repository is destructive and irreversible. The
//! triggering request must not block on it, but the operation cannot be a
//! blind fire-and-forget either: the supervisor runs it as a background task
//! with a pollable status so an operator can confirm the outcome. Once
//! started a flush is not cancellable.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

use crate::db::MetadataRepository;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlushState {
    Idle,
    Running {
        started: DateTime<Utc>,
    },
    Completed {
        finished: DateTime<Utc>,
        deleted: u64,
    },
    Failed {
        finished: DateTime<Utc>,
        error: String,
    },
}

#[derive(Clone, Default)]
pub struct FlushSupervisor {
    state: Arc<RwLock<FlushState>>,
}

impl Default for FlushState {
    fn default() -> Self {
        FlushState::Idle
    }
}

impl FlushSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> FlushState {
        self.state.read().clone()
    }

    /// Start a flush in the background. Credentials must already have been
    /// verified by the caller. Rejected if a flush is currently running.
    pub fn trigger(&self, repo: Arc<dyn MetadataRepository>) -> Result<FlushState> {
        {
            let mut guard = self.state.write();
            if matches!(*guard, FlushState::Running { .. }) {
                return Err(AppError::FlushInProgress);
            }
            *guard = FlushState::Running {
                started: Utc::now(),
            };
        }

        let state = self.state.clone();
        tokio::spawn(async move {
            match repo.flush_all().await {
                Ok(deleted) => {
                    tracing::warn!(deleted, "metadata repository flushed");
                    *state.write() = FlushState::Completed {
                        finished: Utc::now(),
                        deleted,
                    };
                }
                Err(e) => {
                    tracing::error!(error = %e, "metadata flush failed");
                    *state.write() = FlushState::Failed {
                        finished: Utc::now(),
                        error: e.to_string(),
                    };
                }
            }
        });

        Ok(self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteRepository;
    use crate::record::FileRecord;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn repo_with_records(n: u8) -> (Arc<SqliteRepository>, TempDir) {
        let dir = TempDir::new().unwrap();
        let repo =
            SqliteRepository::open(&dir.path().join("test.db"), "admin".into(), "pw".into())
                .await
                .unwrap();
        for i in 0..n {
            repo.create_if_absent(&FileRecord::new(format!("{:02x}", i).repeat(32), 1))
                .await
                .unwrap();
        }
        (Arc::new(repo), dir)
    }

    #[tokio::test]
    async fn test_flush_runs_to_completion_with_pollable_status() {
        let (repo, _dir) = repo_with_records(3).await;
        let supervisor = FlushSupervisor::new();

        supervisor.trigger(repo.clone()).unwrap();

        // Poll until the background task settles.
        for _ in 0..50 {
            if matches!(supervisor.status(), FlushState::Completed { .. }) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        match supervisor.status() {
            FlushState::Completed { deleted, .. } => assert_eq!(deleted, 3),
            other => panic!("expected completed flush, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_trigger_while_running_is_rejected() {
        let supervisor = FlushSupervisor::new();
        *supervisor.state.write() = FlushState::Running {
            started: Utc::now(),
        };

        let (repo, _dir) = repo_with_records(0).await;
        let err = supervisor.trigger(repo).unwrap_err();
        assert!(matches!(err, AppError::FlushInProgress));
    }
}
