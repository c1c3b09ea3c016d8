//! Ordered teardown of long-lived tasks.
//!
//! Every task is registered under a [`ShutdownStage`] and watches that
//! stage's cancellation token. Stages are cancelled one at a time and each
//! one is joined before the next starts, so the server-role listener and the
//! delivery worker are gone before the client listener stops.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Teardown group, in cancellation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStage {
    /// Server-role listener, delivery worker, refresh task
    ServerRole,
    /// Client-role listener
    ClientRole,
}

impl ShutdownStage {
    /// Every stage in cancellation order
    pub const ORDER: [ShutdownStage; 2] = [ShutdownStage::ServerRole, ShutdownStage::ClientRole];

    fn index(self) -> usize {
        match self {
            ShutdownStage::ServerRole => 0,
            ShutdownStage::ClientRole => 1,
        }
    }
}

struct TrackedTask {
    name: String,
    handle: JoinHandle<()>,
}

/// Cancellation tokens and join handles grouped by stage
pub struct ShutdownCoordinator {
    tokens: [CancellationToken; 2],
    tasks: Mutex<[Vec<TrackedTask>; 2]>,
    grace: Duration,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("grace", &self.grace)
            .field("cancelled", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl ShutdownCoordinator {
    /// Coordinator waiting at most `grace` for each task to exit
    pub fn new(grace: Duration) -> Self {
        Self {
            tokens: [CancellationToken::new(), CancellationToken::new()],
            tasks: Mutex::new([Vec::new(), Vec::new()]),
            grace,
        }
    }

    /// Token the tasks of `stage` must watch
    pub fn token(&self, stage: ShutdownStage) -> CancellationToken {
        self.tokens[stage.index()].clone()
    }

    /// Returns true once teardown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.tokens[0].is_cancelled()
    }

    /// Track a spawned task so shutdown waits for it
    pub fn track(&self, stage: ShutdownStage, name: impl Into<String>, handle: JoinHandle<()>) {
        let name = name.into();
        log::debug!("Tracking task '{}' in stage {:?}", name, stage);
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)[stage.index()]
            .push(TrackedTask { name, handle });
    }

    /// Spawn `future` and track it under `stage`
    pub fn spawn<F>(&self, stage: ShutdownStage, name: impl Into<String>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.track(stage, name, tokio::spawn(future));
    }

    /// Cancel and join every stage in order
    ///
    /// Returns false if any task had to be aborted after the grace period.
    pub async fn shutdown(&self) -> bool {
        let mut clean = true;

        for stage in ShutdownStage::ORDER {
            log::info!("Stopping {:?} tasks", stage);
            self.tokens[stage.index()].cancel();

            let tasks = std::mem::take(
                &mut self.tasks.lock().unwrap_or_else(PoisonError::into_inner)[stage.index()],
            );
            for mut task in tasks {
                match tokio::time::timeout(self.grace, &mut task.handle).await {
                    Ok(Ok(())) => log::debug!("Task '{}' stopped", task.name),
                    Ok(Err(e)) => log::error!("Task '{}' failed: {}", task.name, e),
                    Err(_) => {
                        log::error!(
                            "Task '{}' did not stop within {:?}, aborting",
                            task.name,
                            self.grace
                        );
                        task.handle.abort();
                        clean = false;
                    }
                }
            }
        }

        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_stages_stop_in_order() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Register the client stage first; it must still stop last
        for (stage, name) in [
            (ShutdownStage::ClientRole, "client listener"),
            (ShutdownStage::ServerRole, "server listener"),
            (ShutdownStage::ServerRole, "delivery"),
        ] {
            let token = coordinator.token(stage);
            let order = Arc::clone(&order);
            coordinator.spawn(stage, name, async move {
                token.cancelled().await;
                order.lock().unwrap().push(name);
            });
        }

        assert!(coordinator.shutdown().await);
        let order = order.lock().unwrap().clone();
        assert_eq!(order.last(), Some(&"client listener"));
        assert_eq!(order.len(), 3);
    }

    #[tokio::test]
    async fn test_client_stage_outlives_server_stage() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let client = coordinator.token(ShutdownStage::ClientRole);
        let seen = Arc::new(Mutex::new(None));

        let observed = Arc::clone(&seen);
        let server = coordinator.token(ShutdownStage::ServerRole);
        coordinator.spawn(ShutdownStage::ServerRole, "server listener", async move {
            server.cancelled().await;
            *observed.lock().unwrap() = Some(client.is_cancelled());
        });

        coordinator.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        coordinator.spawn(ShutdownStage::ServerRole, "stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        assert!(!coordinator.shutdown().await);
        assert!(coordinator.is_shutting_down());
    }
}
