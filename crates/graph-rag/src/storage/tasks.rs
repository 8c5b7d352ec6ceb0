//! Task records and their append-only status log

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::database::{parsed_column, uuid_column, MetadataDb};
use crate::error::{Error, Result};
use crate::types::{Task, TaskStatus, TaskStatusReport, TaskType};

const TASK_COLUMNS: &str = "id, operation_id, task_type, status, retry, payload, created_at, updated_at";

impl MetadataDb {
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let payload = task.payload.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.lock();
        conn.execute(
            &format!("INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)", TASK_COLUMNS),
            params![
                task.id.to_string(),
                task.operation_id.to_string(),
                task.task_type.as_str(),
                task.status.as_str(),
                task.retry,
                payload,
                task.created_at,
                task.updated_at,
            ],
        )
        .map_err(|e| Error::storage(format!("Failed to insert task: {}", e)))?;
        Ok(())
    }

    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id.to_string()],
            row_to_task,
        )
        .optional()
        .map_err(|e| Error::storage(format!("Failed to get task: {}", e)))
    }

    /// Fetch a task or fail with `NotFound`
    pub fn require_task(&self, id: Uuid) -> Result<Task> {
        self.get_task(id)?.ok_or_else(|| Error::not_found("task", id))
    }

    pub fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), status.as_str(), Utc::now()],
        )
        .map_err(|e| Error::storage(format!("Failed to update task status: {}", e)))?;
        Ok(())
    }

    /// Move a task back to `pending` with a new retry count
    pub fn set_task_retry(&self, id: Uuid, retry: u32) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tasks SET status = 'pending', retry = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), retry, Utc::now()],
        )
        .map_err(|e| Error::storage(format!("Failed to update task retry: {}", e)))?;
        Ok(())
    }

    /// Tasks in a given status, oldest first
    pub fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at",
                TASK_COLUMNS
            ))
            .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;
        let tasks = stmt
            .query_map(params![status.as_str()], row_to_task)
            .map_err(|e| Error::storage(format!("Failed to list tasks: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(format!("Failed to read task: {}", e)))?;
        Ok(tasks)
    }

    /// Non-terminal tasks operating on a document or knowledge base
    pub fn active_tasks_for(&self, operation_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE operation_id = ?1 AND status IN ('pending', 'running')
                 ORDER BY created_at",
                TASK_COLUMNS
            ))
            .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;
        let tasks = stmt
            .query_map(params![operation_id.to_string()], row_to_task)
            .map_err(|e| Error::storage(format!("Failed to list tasks: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(format!("Failed to read task: {}", e)))?;
        Ok(tasks)
    }

    pub fn add_status_report(&self, report: &TaskStatusReport) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO task_status_reports (task_id, message, current_stage, stage_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                report.task_id.to_string(),
                report.message,
                report.current_stage,
                report.stage_count,
                report.created_at,
            ],
        )
        .map_err(|e| Error::storage(format!("Failed to add status report: {}", e)))?;
        Ok(())
    }

    /// Status log of a task in insertion order
    pub fn status_reports(&self, task_id: Uuid) -> Result<Vec<TaskStatusReport>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT task_id, message, current_stage, stage_count, created_at
                 FROM task_status_reports WHERE task_id = ?1 ORDER BY seq",
            )
            .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;
        let reports = stmt
            .query_map(params![task_id.to_string()], |row| {
                Ok(TaskStatusReport {
                    task_id: uuid_column(row, 0)?,
                    message: row.get(1)?,
                    current_stage: row.get(2)?,
                    stage_count: row.get(3)?,
                    created_at: row.get::<_, DateTime<Utc>>(4)?,
                })
            })
            .map_err(|e| Error::storage(format!("Failed to list status reports: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(format!("Failed to read status report: {}", e)))?;
        Ok(reports)
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let payload: Option<String> = row.get(5)?;
    let payload = payload
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(Task {
        id: uuid_column(row, 0)?,
        operation_id: uuid_column(row, 1)?,
        task_type: parsed_column(row, 2, TaskType::parse)?,
        status: parsed_column(row, 3, TaskStatus::parse)?,
        retry: row.get(4)?,
        payload,
        created_at: row.get::<_, DateTime<Utc>>(6)?,
        updated_at: row.get::<_, DateTime<Utc>>(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_lifecycle() {
        let db = MetadataDb::in_memory().unwrap();
        let task = Task::new(Uuid::new_v4(), TaskType::ImportKb)
            .with_payload(serde_json::json!({ "blob_id": "abc" }));
        db.insert_task(&task).unwrap();

        let loaded = db.require_task(task.id).unwrap();
        assert_eq!(loaded.task_type, TaskType::ImportKb);
        assert_eq!(loaded.payload, task.payload);

        db.set_task_status(task.id, TaskStatus::Running).unwrap();
        assert_eq!(db.tasks_with_status(TaskStatus::Running).unwrap().len(), 1);

        db.set_task_retry(task.id, 2).unwrap();
        let loaded = db.require_task(task.id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.retry, 2);
        assert_eq!(db.active_tasks_for(task.operation_id).unwrap().len(), 1);

        db.set_task_status(task.id, TaskStatus::Canceled).unwrap();
        assert!(db.active_tasks_for(task.operation_id).unwrap().is_empty());
    }

    #[test]
    fn test_reports_in_insertion_order() {
        let db = MetadataDb::in_memory().unwrap();
        let task_id = Uuid::new_v4();
        for (stage, message) in ["open", "parse", "chunk"].iter().enumerate() {
            db.add_status_report(&TaskStatusReport::new(task_id, *message, stage as u32 + 1, 6))
                .unwrap();
        }

        let reports = db.status_reports(task_id).unwrap();
        let messages: Vec<_> = reports.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["open", "parse", "chunk"]);
        assert_eq!(reports[2].current_stage, 3);
        assert!(db.status_reports(Uuid::new_v4()).unwrap().is_empty());
    }
}
