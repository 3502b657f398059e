// Sequential task queue: one worker, one item in flight. Items can be queued
// at the back (normal order) or at the front (newest-first backfill). A failed
// item is logged and dropped; retry policy, if any, lives in the processor.

use crate::metrics;
use futures::future::BoxFuture;
use log::{debug, error};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub struct TaskQueue<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    worker_started: AtomicBool,
}

impl<T: Send + 'static> TaskQueue<T> {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            worker_started: AtomicBool::new(false),
        })
    }

    /// Appends an item; processed after everything already queued.
    pub fn push_back(&self, item: T) {
        let len = {
            let mut items = self.items.lock().expect("task queue poisoned");
            items.push_back(item);
            items.len()
        };
        metrics::set_task_queue_size(self.name, len as f64);
        self.notify.notify_one();
    }

    /// Inserts an item at the front; processed before everything already
    /// queued. Used to sync from newest to oldest during backfill.
    pub fn push_front(&self, item: T) {
        let len = {
            let mut items = self.items.lock().expect("task queue poisoned");
            items.push_front(item);
            items.len()
        };
        metrics::set_task_queue_size(self.name, len as f64);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("task queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop_front(&self) -> Option<T> {
        let (item, len) = {
            let mut items = self.items.lock().expect("task queue poisoned");
            let item = items.pop_front();
            (item, items.len())
        };
        metrics::set_task_queue_size(self.name, len as f64);
        item
    }

    /// Spawns the single consumer. At most one item is in flight; the worker
    /// awaits each processor invocation to completion (success or failure)
    /// before pulling the next item. Calling this twice is a no-op.
    pub fn start_worker<F>(self: &Arc<Self>, processor: F) -> JoinHandle<()>
    where
        F: Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        if self.worker_started.swap(true, Ordering::SeqCst) {
            debug!("[TaskQueue:{}] Worker already running", self.name);
            return tokio::spawn(async {});
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match queue.pop_front() {
                    Some(item) => {
                        if let Err(e) = processor(item).await {
                            // Dropped on purpose: the clock re-enqueues unknown
                            // timestamps on the next tick.
                            error!("[TaskQueue:{}] Task failed: {:#}", queue.name, e);
                        }
                    }
                    None => queue.notify.notified().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_processes_in_order_one_at_a_time() {
        let queue: Arc<TaskQueue<u64>> = TaskQueue::new("test");
        queue.push_back(1);
        queue.push_back(2);
        queue.push_back(3);

        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.start_worker(move |item| {
            let tx = tx.clone();
            Box::pin(async move {
                // A small sleep makes interleaving visible if the worker ever
                // ran two items concurrently.
                tokio::time::sleep(Duration::from_millis(10)).await;
                tx.send(item).ok();
                Ok(())
            })
        });

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_push_front_jumps_the_line() {
        let queue: Arc<TaskQueue<u64>> = TaskQueue::new("test");
        queue.push_back(100);
        queue.push_front(200);

        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.start_worker(move |item| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send(item).ok();
                Ok(())
            })
        });

        assert_eq!(rx.recv().await.unwrap(), 200);
        assert_eq!(rx.recv().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_failure_drops_item_and_continues() {
        let queue: Arc<TaskQueue<u64>> = TaskQueue::new("test");
        queue.push_back(1);
        queue.push_back(2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.start_worker(move |item| {
            let tx = tx.clone();
            Box::pin(async move {
                if item == 1 {
                    anyhow::bail!("boom");
                }
                tx.send(item).ok();
                Ok(())
            })
        });

        // Item 1 failed and was dropped; item 2 still comes through.
        assert_eq!(rx.recv().await.unwrap(), 2);
        assert!(queue.is_empty());
    }
}
