//! Supervised background tasks.
//!
//! Long-running work kicked off from a chat command (an interactive login
//! wait, for example) runs here instead of blocking the handler. Tasks are
//! named, capped in number, optionally time-limited, and queryable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{errors::Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    NotFound,
    Running { elapsed: Duration },
    Completed,
    Failed(String),
    TimedOut,
}

#[derive(Clone, Debug)]
enum Outcome {
    Completed,
    Failed(String),
    TimedOut,
}

struct TaskEntry {
    started_at: Instant,
    handle: JoinHandle<()>,
    // Written once by the task itself when it finishes.
    outcome: Arc<StdMutex<Option<Outcome>>>,
}

impl TaskEntry {
    fn outcome(&self) -> Option<Outcome> {
        self.outcome.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct BackgroundTasks {
    max_tasks: usize,
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl BackgroundTasks {
    pub fn new(max_tasks: usize) -> Arc<Self> {
        Arc::new(Self {
            max_tasks,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns a named task. The name must be free and the cap not reached;
    /// the cap only counts live tasks, finished ones are evicted to make
    /// room.
    pub async fn spawn<F>(&self, name: &str, timeout: Option<Duration>, fut: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if let Some(existing) = tasks.get(name) {
            if existing.outcome().is_none() {
                return Err(Error::Transient(format!("task {name} already running")));
            }
            tasks.remove(name);
        }
        if tasks.len() >= self.max_tasks {
            tasks.retain(|_, entry| entry.outcome().is_none());
        }
        if tasks.len() >= self.max_tasks {
            return Err(Error::Transient("background task limit reached".to_string()));
        }

        let outcome: Arc<StdMutex<Option<Outcome>>> = Arc::new(StdMutex::new(None));
        let slot = Arc::clone(&outcome);
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(Ok(())) => Outcome::Completed,
                    Ok(Err(err)) => Outcome::Failed(err.to_string()),
                    Err(_) => Outcome::TimedOut,
                },
                None => match fut.await {
                    Ok(()) => Outcome::Completed,
                    Err(err) => Outcome::Failed(err.to_string()),
                },
            };
            match &result {
                Outcome::Completed => debug!(task = %task_name, "background task completed"),
                Outcome::Failed(err) => {
                    warn!(task = %task_name, error = %err, "background task failed")
                }
                Outcome::TimedOut => warn!(task = %task_name, "background task timed out"),
            }
            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
        });
        tasks.insert(
            name.to_string(),
            TaskEntry {
                started_at: Instant::now(),
                handle,
                outcome,
            },
        );
        Ok(())
    }

    pub async fn status(&self, name: &str) -> TaskStatus {
        let tasks = self.tasks.lock().await;
        match tasks.get(name) {
            None => TaskStatus::NotFound,
            Some(entry) => match entry.outcome() {
                None => TaskStatus::Running {
                    elapsed: entry.started_at.elapsed(),
                },
                Some(Outcome::Completed) => TaskStatus::Completed,
                Some(Outcome::Failed(err)) => TaskStatus::Failed(err),
                Some(Outcome::TimedOut) => TaskStatus::TimedOut,
            },
        }
    }

    pub async fn cancel(&self, name: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        match tasks.remove(name) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for (name, entry) in tasks.drain() {
            if entry.outcome().is_none() {
                debug!(task = %name, "aborting background task");
                entry.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_task_reports_completed() {
        let tasks = BackgroundTasks::new(4);
        tasks.spawn("ok", None, async { Ok(()) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tasks.status("ok").await, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn failed_task_reports_the_error() {
        let tasks = BackgroundTasks::new(4);
        tasks
            .spawn("bad", None, async {
                Err(Error::Transient("boom".to_string()))
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        match tasks.status("bad").await {
            TaskStatus::Failed(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn long_task_reports_running_then_times_out() {
        let tasks = BackgroundTasks::new(4);
        tasks
            .spawn("slow", Some(Duration::from_millis(30)), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap();
        assert!(matches!(
            tasks.status("slow").await,
            TaskStatus::Running { .. }
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(tasks.status("slow").await, TaskStatus::TimedOut);
    }

    #[tokio::test]
    async fn duplicate_names_and_cap_are_rejected() {
        let tasks = BackgroundTasks::new(1);
        tasks
            .spawn("one", None, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap();
        assert!(tasks.spawn("one", None, async { Ok(()) }).await.is_err());
        assert!(tasks.spawn("two", None, async { Ok(()) }).await.is_err());
        assert!(tasks.cancel("one").await);
        tasks.spawn("two", None, async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn finished_tasks_make_room_for_new_ones() {
        let tasks = BackgroundTasks::new(1);
        tasks.spawn("first", None, async { Ok(()) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tasks.spawn("second", None, async { Ok(()) }).await.unwrap();
        assert_eq!(tasks.status("first").await, TaskStatus::NotFound);
    }

    #[tokio::test]
    async fn stop_all_aborts_running_tasks() {
        let tasks = BackgroundTasks::new(4);
        tasks
            .spawn("forever", None, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap();
        tasks.stop_all().await;
        assert_eq!(tasks.status("forever").await, TaskStatus::NotFound);
    }
}
