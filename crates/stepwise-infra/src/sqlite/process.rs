//! SQLite process repository implementation.
//!
//! Implements `ProcessRepository` from `stepwise-core` using sqlx with split
//! read/write pools. Timestamps are stored as fixed-width RFC 3339 strings at
//! microsecond precision so they sort lexicographically.
//!
//! Join tasks carry their node name in `join_key`; the
//! `UNIQUE (process_id, join_key)` constraint plus `ON CONFLICT DO NOTHING`
//! makes join get-or-create a single idempotent insert. Status updates are
//! guarded with `AND status = 'scheduled'`.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::{QueryBuilder, Row, Sqlite};
use stepwise_core::repository::ProcessRepository;
use stepwise_types::error::RepositoryError;
use stepwise_types::process::ProcessInstance;
use stepwise_types::task::{StatusFilter, Task, TaskField, TaskLink, TaskStatus};
use uuid::Uuid;

use super::pool::DatabasePool;

const TASK_COLUMNS: &str = "id, process_id, node_name, status, created_at, modified_at, \
     completed, completed_at, completed_by, error_type, error_message, stacktrace";

/// SQLite-backed implementation of `ProcessRepository`.
#[derive(Clone)]
pub struct SqliteProcessRepository {
    pool: DatabasePool,
}

impl SqliteProcessRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn insert_links(
        &self,
        conn: &mut sqlx::SqliteConnection,
        process_id: &Uuid,
        parents: &[Uuid],
        child_id: &Uuid,
    ) -> Result<(), RepositoryError> {
        for parent in parents {
            sqlx::query(
                "INSERT OR IGNORE INTO task_links (process_id, parent_id, child_id) VALUES (?, ?, ?)",
            )
            .bind(process_id.to_string())
            .bind(parent.to_string())
            .bind(child_id.to_string())
            .execute(&mut *conn)
            .await
            .map_err(query_error)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ProcessRow {
    id: String,
    definition: String,
    created_at: String,
    modified_at: String,
}

impl ProcessRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition: row.try_get("definition")?,
            created_at: row.try_get("created_at")?,
            modified_at: row.try_get("modified_at")?,
        })
    }

    fn into_process(self) -> Result<ProcessInstance, RepositoryError> {
        Ok(ProcessInstance {
            id: parse_uuid(&self.id)?,
            definition: self.definition,
            created_at: parse_datetime(&self.created_at)?,
            modified_at: parse_datetime(&self.modified_at)?,
        })
    }
}

struct TaskRow {
    id: String,
    process_id: String,
    node_name: String,
    status: String,
    created_at: String,
    modified_at: String,
    completed: bool,
    completed_at: Option<String>,
    completed_by: Option<String>,
    error_type: Option<String>,
    error_message: Option<String>,
    stacktrace: Option<String>,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            process_id: row.try_get("process_id")?,
            node_name: row.try_get("node_name")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            modified_at: row.try_get("modified_at")?,
            completed: row.try_get("completed")?,
            completed_at: row.try_get("completed_at")?,
            completed_by: row.try_get("completed_by")?,
            error_type: row.try_get("error_type")?,
            error_message: row.try_get("error_message")?,
            stacktrace: row.try_get("stacktrace")?,
        })
    }

    fn into_task(self) -> Result<Task, RepositoryError> {
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| RepositoryError::Query(format!("invalid task status: {}", self.status)))?;

        Ok(Task {
            id: parse_uuid(&self.id)?,
            process_id: parse_uuid(&self.process_id)?,
            node_name: self.node_name,
            status,
            created_at: parse_datetime(&self.created_at)?,
            modified_at: parse_datetime(&self.modified_at)?,
            completed: self.completed,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            completed_by: self.completed_by,
            error_type: self.error_type,
            error_message: self.error_message,
            stacktrace: self.stacktrace,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn tasks_from_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Task>, RepositoryError> {
    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        let r = TaskRow::from_row(row).map_err(query_error)?;
        tasks.push(r.into_task()?);
    }
    Ok(tasks)
}

/// Append the status predicate for `filter`.
fn push_status_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: StatusFilter) {
    match filter {
        StatusFilter::NotSucceeded => {
            qb.push(" AND status != 'succeeded'");
        }
        StatusFilter::Scheduled => {
            qb.push(" AND status = 'scheduled'");
        }
        StatusFilter::Succeeded => {
            qb.push(" AND status = 'succeeded'");
        }
        StatusFilter::Failed => {
            qb.push(" AND status = 'failed'");
        }
        StatusFilter::Canceled => {
            qb.push(" AND status = 'canceled'");
        }
    }
}

fn insert_task_query<'q>(
    task: &'q Task,
    join_key: Option<&'q str>,
    on_conflict: &'static str,
) -> QueryBuilder<'q, Sqlite> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO tasks ({TASK_COLUMNS}, join_key) VALUES ("));
    let mut values = qb.separated(", ");
    values
        .push_bind(task.id.to_string())
        .push_bind(task.process_id.to_string())
        .push_bind(task.node_name.as_str())
        .push_bind(task.status.as_str())
        .push_bind(format_datetime(&task.created_at))
        .push_bind(format_datetime(&task.modified_at))
        .push_bind(task.completed)
        .push_bind(task.completed_at.as_ref().map(format_datetime))
        .push_bind(task.completed_by.as_deref())
        .push_bind(task.error_type.as_deref())
        .push_bind(task.error_message.as_deref())
        .push_bind(task.stacktrace.as_deref())
        .push_bind(join_key);
    qb.push(")");
    qb.push(on_conflict);
    qb
}

// ---------------------------------------------------------------------------
// ProcessRepository impl
// ---------------------------------------------------------------------------

impl ProcessRepository for SqliteProcessRepository {
    async fn create_process(&self, process: &ProcessInstance) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO processes (id, definition, created_at, modified_at) VALUES (?, ?, ?, ?)",
        )
        .bind(process.id.to_string())
        .bind(&process.definition)
        .bind(format_datetime(&process.created_at))
        .bind(format_datetime(&process.modified_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_process(&self, id: &Uuid) -> Result<Option<ProcessInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM processes WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ProcessRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_process()?))
            }
            None => Ok(None),
        }
    }

    async fn list_processes(
        &self,
        definition: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ProcessInstance>, RepositoryError> {
        let rows = match definition {
            Some(name) => {
                sqlx::query(
                    "SELECT * FROM processes WHERE definition = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(name)
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM processes ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        let mut processes = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ProcessRow::from_row(row).map_err(query_error)?;
            processes.push(r.into_process()?);
        }
        Ok(processes)
    }

    async fn touch_process(&self, id: &Uuid, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE processes SET modified_at = MAX(modified_at, ?) WHERE id = ?")
                .bind(format_datetime(&at))
                .bind(id.to_string())
                .execute(&self.pool.writer)
                .await
                .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn create_task(&self, task: &Task, parents: &[Uuid]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        insert_task_query(task, None, "")
            .build()
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        self.insert_links(&mut tx, &task.process_id, parents, &task.id)
            .await?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get_or_create_task(
        &self,
        task: &Task,
        parent: Option<&Uuid>,
    ) -> Result<(Task, bool), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let inserted = insert_task_query(
            task,
            Some(task.node_name.as_str()),
            " ON CONFLICT (process_id, join_key) DO NOTHING",
        )
        .build()
        .execute(&mut *tx)
        .await
        .map_err(query_error)?
        .rows_affected()
            == 1;

        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE process_id = ? AND join_key = ?"
        ))
        .bind(task.process_id.to_string())
        .bind(&task.node_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error)?;
        let survivor = TaskRow::from_row(&row).map_err(query_error)?.into_task()?;

        if let Some(parent) = parent {
            self.insert_links(&mut tx, &survivor.process_id, &[*parent], &survivor.id)
                .await?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok((survivor, inserted))
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = TaskRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_task()?))
            }
            None => Ok(None),
        }
    }

    async fn update_task(
        &self,
        task: &Task,
        fields: &[TaskField],
    ) -> Result<DateTime<Utc>, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let current: Option<(String, String)> =
            sqlx::query_as("SELECT status, modified_at FROM tasks WHERE id = ?")
                .bind(task.id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_error)?;
        let Some((status, stored_at)) = current else {
            return Err(RepositoryError::NotFound);
        };
        let guarded = fields.contains(&TaskField::Status);
        if guarded && status != TaskStatus::Scheduled.as_str() {
            return Err(RepositoryError::Conflict(format!(
                "task {} is already {status}",
                task.id
            )));
        }
        let modified_at = task
            .modified_at
            .max(parse_datetime(&stored_at)? + Duration::microseconds(1));

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET modified_at = ");
        qb.push_bind(format_datetime(&modified_at));
        for field in fields {
            qb.push(", ").push(field.column()).push(" = ");
            match field {
                TaskField::Status => qb.push_bind(task.status.as_str()),
                TaskField::Completed => qb.push_bind(task.completed),
                TaskField::CompletedAt => qb.push_bind(task.completed_at.as_ref().map(format_datetime)),
                TaskField::CompletedBy => qb.push_bind(task.completed_by.as_deref()),
                TaskField::ErrorType => qb.push_bind(task.error_type.as_deref()),
                TaskField::ErrorMessage => qb.push_bind(task.error_message.as_deref()),
                TaskField::Stacktrace => qb.push_bind(task.stacktrace.as_deref()),
            };
        }
        qb.push(" WHERE id = ").push_bind(task.id.to_string());
        if guarded {
            qb.push(" AND status = 'scheduled'");
        }

        let result = qb.build().execute(&mut *tx).await.map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "task {} changed during update",
                task.id
            )));
        }

        tx.commit().await.map_err(query_error)?;
        Ok(modified_at)
    }

    async fn list_tasks(
        &self,
        process_id: &Uuid,
        filter: Option<StatusFilter>,
    ) -> Result<Vec<Task>, RepositoryError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE process_id = "
        ));
        qb.push_bind(process_id.to_string());
        if let Some(filter) = filter {
            push_status_filter(&mut qb, filter);
        }
        qb.push(" ORDER BY created_at ASC, id ASC");

        let rows = qb
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        tasks_from_rows(&rows)
    }

    async fn find_tasks(
        &self,
        process_id: &Uuid,
        node_name: &str,
    ) -> Result<Vec<Task>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE process_id = ? AND node_name = ? \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(process_id.to_string())
        .bind(node_name)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        tasks_from_rows(&rows)
    }

    async fn latest_task(&self, process_id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE process_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(process_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = TaskRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_task()?))
            }
            None => Ok(None),
        }
    }

    async fn cancel_scheduled_tasks(
        &self,
        process_id: &Uuid,
        completed_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Vec<Task>, RepositoryError> {
        let at = format_datetime(&at);
        let rows = sqlx::query(&format!(
            "UPDATE tasks SET status = 'canceled', completed = 1, completed_at = ?, \
             completed_by = ?, modified_at = MAX(modified_at, ?) \
             WHERE process_id = ? AND status = 'scheduled' \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(&at)
        .bind(completed_by)
        .bind(&at)
        .bind(process_id.to_string())
        .fetch_all(&self.pool.writer)
        .await
        .map_err(query_error)?;

        let mut canceled = tasks_from_rows(&rows)?;
        canceled.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(canceled)
    }

    async fn list_task_links(&self, process_id: &Uuid) -> Result<Vec<TaskLink>, RepositoryError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT parent_id, child_id FROM task_links WHERE process_id = ? ORDER BY rowid ASC",
        )
        .bind(process_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|(parent, child)| {
                Ok(TaskLink {
                    parent_id: parse_uuid(parent)?,
                    child_id: parse_uuid(child)?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
