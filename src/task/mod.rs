//! Per-operation progress log with replay and live broadcast.
//!
//! Each install workflow owns one [`Task`]: an append-only buffer of log
//! lines plus a bounded broadcast channel. Subscribers replay the buffer
//! first and then switch to live delivery, so even late attachers see the
//! full history in original order.
//!
//! Delivery contract: at-least-once via the buffer, best-effort via the live
//! channel. A slow subscriber never blocks the worker; a lagged broadcast
//! receiver simply skips, and the skipped lines remain in the buffer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::error::ModuleError;

/// Live channel capacity per task.
const BROADCAST_CAPACITY: usize = 256;

/// Tasks are garbage collected this long after creation, finished or not.
const TASK_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Ok,
    Warn,
    Error,
}

/// One streamed event. The terminal event has `done = true` and, only on
/// failure, `error = true` with text starting with `ERROR:`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLine {
    pub text: String,
    pub level: LogLevel,
    pub done: bool,
    pub error: bool,
}

/// Buffered/broadcast payload. `seq` lets a subscriber that replayed the
/// buffer drop live duplicates without any gap or reordering.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub seq: u64,
    pub line: TaskLine,
}

struct TaskInner {
    buf: Vec<TaskEvent>,
    next_seq: u64,
    done: bool,
}

pub struct Task {
    pub id: String,
    inner: Mutex<TaskInner>,
    tx: broadcast::Sender<TaskEvent>,
}

impl Task {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            inner: Mutex::new(TaskInner {
                buf: Vec::new(),
                next_seq: 0,
                done: false,
            }),
            tx,
        }
    }

    /// Append a progress line. Ignored once the task is finished.
    pub async fn log(&self, level: LogLevel, text: impl Into<String>) {
        let line = TaskLine {
            text: text.into(),
            level,
            done: false,
            error: false,
        };
        let mut inner = self.inner.lock().await;
        if inner.done {
            return;
        }
        let event = TaskEvent {
            seq: inner.next_seq,
            line,
        };
        inner.next_seq += 1;
        inner.buf.push(event.clone());
        // Sent under the lock: live delivery order always matches buffer
        // order. broadcast::send never blocks, and no receivers (or lagging
        // ones) are fine.
        let _ = self.tx.send(event);
    }

    pub async fn info(&self, text: impl Into<String>) {
        self.log(LogLevel::Info, text).await;
    }

    pub async fn ok(&self, text: impl Into<String>) {
        self.log(LogLevel::Ok, text).await;
    }

    pub async fn warn(&self, text: impl Into<String>) {
        self.log(LogLevel::Warn, text).await;
    }

    /// Finish the task, appending the terminal line to the buffer so that
    /// subscribers attaching after completion replay exactly what live
    /// subscribers saw. Idempotent.
    pub async fn finish(&self, err: Option<&ModuleError>) {
        let line = match err {
            Some(e) => TaskLine {
                text: format!("ERROR: {}", e),
                level: LogLevel::Error,
                done: true,
                error: true,
            },
            None => TaskLine {
                text: String::new(),
                level: LogLevel::Info,
                done: true,
                error: false,
            },
        };
        let mut inner = self.inner.lock().await;
        if inner.done {
            return;
        }
        inner.done = true;
        let event = TaskEvent {
            seq: inner.next_seq,
            line,
        };
        inner.next_seq += 1;
        inner.buf.push(event.clone());
        let _ = self.tx.send(event);
    }

    /// Subscribe to live events. Call before [`snapshot`](Self::snapshot)
    /// to guarantee gap-free replay-then-live consumption.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Copy of the buffered history plus the completion flag.
    pub async fn snapshot(&self) -> (Vec<TaskEvent>, bool) {
        let inner = self.inner.lock().await;
        (inner.buf.clone(), inner.done)
    }

    pub async fn is_done(&self) -> bool {
        self.inner.lock().await.done
    }
}

/// Process-wide task registry with a time-boxed lifetime per entry.
pub struct TaskStore {
    ttl: Duration,
    tasks: Mutex<HashMap<String, Arc<Task>>>,
}

impl TaskStore {
    pub fn new() -> Arc<Self> {
        Self::with_ttl(TASK_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Create and register a task. A background timer removes it after the
    /// TTL regardless of completion.
    pub async fn create(self: &Arc<Self>) -> Arc<Task> {
        let task = Arc::new(Task::new());
        self.tasks
            .lock()
            .await
            .insert(task.id.clone(), task.clone());

        let store = Arc::downgrade(self);
        let id = task.id.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(store) = store.upgrade() {
                store.tasks.lock().await.remove(&id);
            }
        });
        task
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks.lock().await.get(id).cloned()
    }
}
