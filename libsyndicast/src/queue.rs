//! Publish task queue
//!
//! One pending task per content item: enqueueing an item that is already
//! queued moves its run time instead of adding a duplicate.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTask {
    pub content_id: String,
    pub run_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue `content_id` for immediate publishing
    async fn enqueue(&self, content_id: &str) -> Result<()> {
        self.enqueue_delayed(content_id, Duration::ZERO).await
    }

    /// Queue `content_id` to run once `delay` has passed
    async fn enqueue_delayed(&self, content_id: &str, delay: Duration) -> Result<()>;

    /// Remove and return up to `limit` tasks due at `now`, earliest first
    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PublishTask>>;

    /// Every queued task, earliest first
    async fn pending(&self) -> Result<Vec<PublishTask>>;
}

pub(crate) fn run_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// In-process task queue
#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
    tasks: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue_delayed(&self, content_id: &str, delay: Duration) -> Result<()> {
        let at = run_at(Utc::now(), delay);
        self.tasks.lock().await.insert(content_id.to_string(), at);
        Ok(())
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PublishTask>> {
        let mut tasks = self.tasks.lock().await;
        let mut due: Vec<PublishTask> = tasks
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, at)| PublishTask {
                content_id: id.clone(),
                run_at: *at,
            })
            .collect();
        due.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.content_id.cmp(&b.content_id)));
        due.truncate(limit);

        for task in &due {
            tasks.remove(&task.content_id);
        }
        Ok(due)
    }

    async fn pending(&self) -> Result<Vec<PublishTask>> {
        let tasks = self.tasks.lock().await;
        let mut all: Vec<PublishTask> = tasks
            .iter()
            .map(|(id, at)| PublishTask {
                content_id: id.clone(),
                run_at: *at,
            })
            .collect();
        all.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.content_id.cmp(&b.content_id)));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_is_due_immediately() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue("post-1").await.unwrap();

        let due = queue.take_due(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].content_id, "post-1");
        assert!(queue.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delayed_task_not_due_yet() {
        let queue = MemoryTaskQueue::new();
        queue
            .enqueue_delayed("post-1", Duration::from_secs(120))
            .await
            .unwrap();

        assert!(queue.take_due(Utc::now(), 10).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(121);
        assert_eq!(queue.take_due(later, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_replaces_run_time() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue("post-1").await.unwrap();
        queue
            .enqueue_delayed("post-1", Duration::from_secs(600))
            .await
            .unwrap();

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].run_at > Utc::now() + chrono::Duration::seconds(500));
    }

    #[tokio::test]
    async fn test_take_due_respects_limit_and_order() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue("b").await.unwrap();
        queue.enqueue("a").await.unwrap();
        queue.enqueue("c").await.unwrap();

        let now = Utc::now() + chrono::Duration::seconds(1);
        let first = queue.take_due(now, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(queue.pending().await.unwrap().len(), 1);
    }
}
