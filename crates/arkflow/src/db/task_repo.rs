//! Task repository: row-level access to the `processing_tasks` table.
//!
//! Functions take a `&Connection` so callers can compose several of them
//! inside one `Database::with_conn` critical section.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

const ACTIVE_STATUSES: &str = "('pending', 'processing')";

/// A raw task row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    pub id: String,
    pub material_id: String,
    pub user_id: String,
    pub processing_type: String,
    pub status: String,
    pub content: Option<String>,
    pub metadata: String,
    pub error_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            material_id: row.get("material_id")?,
            user_id: row.get("user_id")?,
            processing_type: row.get("processing_type")?,
            status: row.get("status")?,
            content: row.get("content")?,
            metadata: row.get("metadata")?,
            error_reason: row.get("error_reason")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Inserts a new task row.
pub fn insert(conn: &Connection, task: &TaskRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO processing_tasks (id, material_id, user_id, processing_type, status,
         content, metadata, error_reason, created_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            task.id,
            task.material_id,
            task.user_id,
            task.processing_type,
            task.status,
            task.content,
            task.metadata,
            task.error_reason,
            task.created_at,
            task.updated_at,
            task.completed_at,
        ],
    )?;
    Ok(())
}

/// Writes every mutable column of `task`, but only if the stored status is
/// still `expected_status`. Returns the number of rows written (0 or 1).
pub fn update_if_status(
    conn: &Connection,
    task: &TaskRow,
    expected_status: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_tasks SET status = ?2, content = ?3, metadata = ?4,
         error_reason = ?5, updated_at = ?6, completed_at = ?7
         WHERE id = ?1 AND status = ?8",
        params![
            task.id,
            task.status,
            task.content,
            task.metadata,
            task.error_reason,
            task.updated_at,
            task.completed_at,
            expected_status,
        ],
    )?;
    Ok(changed)
}

/// Finds a task by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<TaskRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM processing_tasks WHERE id = ?1",
            params![id],
            TaskRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Finds the pending or processing task for a (material, type) pair.
pub fn find_active(
    conn: &Connection,
    material_id: &str,
    processing_type: &str,
) -> Result<Option<TaskRow>, DatabaseError> {
    let sql = format!(
        "SELECT * FROM processing_tasks
         WHERE material_id = ?1 AND processing_type = ?2 AND status IN {}
         ORDER BY created_at DESC, rowid DESC LIMIT 1",
        ACTIVE_STATUSES
    );
    let row = conn
        .query_row(&sql, params![material_id, processing_type], TaskRow::from_row)
        .optional()?;
    Ok(row)
}

/// Finds the most recent task for a (material, type) pair, optionally
/// restricted to one status.
pub fn find_latest(
    conn: &Connection,
    material_id: &str,
    processing_type: &str,
    status: Option<&str>,
) -> Result<Option<TaskRow>, DatabaseError> {
    let row = match status {
        Some(status) => conn
            .query_row(
                "SELECT * FROM processing_tasks
                 WHERE material_id = ?1 AND processing_type = ?2 AND status = ?3
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![material_id, processing_type, status],
                TaskRow::from_row,
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT * FROM processing_tasks
                 WHERE material_id = ?1 AND processing_type = ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![material_id, processing_type],
                TaskRow::from_row,
            )
            .optional()?,
    };
    Ok(row)
}

/// Lists tasks of a material newest first, returning (rows, total_count).
pub fn list_by_material(
    conn: &Connection,
    material_id: &str,
    limit: u64,
    offset: u64,
) -> Result<(Vec<TaskRow>, u64), DatabaseError> {
    let total: u64 = conn.query_row(
        "SELECT COUNT(*) FROM processing_tasks WHERE material_id = ?1",
        params![material_id],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT * FROM processing_tasks WHERE material_id = ?1
         ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
    )?;
    let rows: Vec<TaskRow> = stmt
        .query_map(
            params![material_id, limit as i64, offset as i64],
            TaskRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rows, total))
}

/// Finds pending or processing tasks last touched before `updated_before`.
pub fn find_stale(
    conn: &Connection,
    updated_before: &str,
) -> Result<Vec<TaskRow>, DatabaseError> {
    let sql = format!(
        "SELECT * FROM processing_tasks
         WHERE status IN {} AND updated_at < ?1
         ORDER BY updated_at ASC",
        ACTIVE_STATUSES
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![updated_before], TaskRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Counts tasks with the given status.
pub fn count_by_status(conn: &Connection, status: &str) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM processing_tasks WHERE status = ?1",
        params![status],
        |r| r.get(0),
    )?;
    Ok(count)
}
