//! Durable FIFO queues of task ids
//!
//! Each push or pop is a single SQL statement, so scheduler and worker
//! processes sharing the database never need a lock of their own.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::QueueName;

/// Named durable FIFO lists holding opaque task ids
pub trait DurableQueue: Send + Sync {
    /// Append a task id to the tail of a queue
    fn enqueue(&self, queue: QueueName, task_id: Uuid) -> Result<()>;

    /// Pop the head of a queue
    fn dequeue_head(&self, queue: QueueName) -> Result<Option<Uuid>>;

    /// Push a task id that could not be served yet back to the tail
    fn requeue_tail(&self, queue: QueueName, task_id: Uuid) -> Result<()> {
        self.enqueue(queue, task_id)
    }

    /// Remove every entry of a task id from all queues
    fn remove_everywhere(&self, task_id: Uuid) -> Result<usize>;

    /// Number of entries in a queue
    fn len(&self, queue: QueueName) -> Result<usize>;
}

/// Queue store backed by the metadata database
pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueue {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

impl DurableQueue for SqliteQueue {
    fn enqueue(&self, queue: QueueName, task_id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO queue_entries (queue, task_id) VALUES (?1, ?2)",
            params![queue.as_str(), task_id.to_string()],
        )
        .map_err(|e| Error::Queue(format!("Failed to push to {}: {}", queue, e)))?;
        Ok(())
    }

    fn dequeue_head(&self, queue: QueueName) -> Result<Option<Uuid>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "DELETE FROM queue_entries
                 WHERE seq = (SELECT MIN(seq) FROM queue_entries WHERE queue = ?1)
                 RETURNING task_id",
                params![queue.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Queue(format!("Failed to pop from {}: {}", queue, e)))?;

        raw.map(|raw| {
            Uuid::parse_str(&raw)
                .map_err(|e| Error::Queue(format!("Corrupt entry '{}' in {}: {}", raw, queue, e)))
        })
        .transpose()
    }

    fn remove_everywhere(&self, task_id: Uuid) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM queue_entries WHERE task_id = ?1",
            params![task_id.to_string()],
        )
        .map_err(|e| Error::Queue(format!("Failed to remove {}: {}", task_id, e)))
    }

    fn len(&self, queue: QueueName) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM queue_entries WHERE queue = ?1",
                params![queue.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| Error::Queue(format!("Failed to count {}: {}", queue, e)))?;
        Ok(count as usize)
    }
}
