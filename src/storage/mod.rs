//! SQLite storage layer -- schema, queries, migrations.
//!
//! Task/environment/interface documents are owned by the surrounding
//! CRUD system; this layer reads them and owns the result documents the
//! engine writes. Nested structures persist as JSON text columns.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::model::{Environment, Interface, RunResult, Task};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

// ---- environments ----

pub fn upsert_environment(pool: &Pool, env: &Environment) -> Result<()> {
    let conn = pool.get()?;
    // At most one default per project.
    if env.is_default {
        conn.execute(
            "UPDATE environments SET is_default = 0 WHERE project_id = ?1 AND id != ?2",
            params![env.project_id.to_string(), env.id.to_string()],
        )?;
    }
    conn.execute(
        "INSERT OR REPLACE INTO environments
             (id, project_id, name, base_url, variables_json, headers_json, is_default)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            env.id.to_string(),
            env.project_id.to_string(),
            env.name,
            env.base_url,
            serde_json::to_string(&env.variables)?,
            serde_json::to_string(&env.headers)?,
            env.is_default as i64,
        ],
    )?;
    Ok(())
}

pub fn get_environment(pool: &Pool, id: Uuid) -> Result<Option<Environment>> {
    let conn = pool.get()?;
    let row = conn
        .query_row(
            "SELECT id, project_id, name, base_url, variables_json, headers_json, is_default
             FROM environments WHERE id = ?1",
            params![id.to_string()],
            environment_columns,
        )
        .optional()?;
    row.map(environment_from_columns).transpose()
}

/// The project's default environment, used when a task names none.
pub fn default_environment(pool: &Pool, project_id: Uuid) -> Result<Option<Environment>> {
    let conn = pool.get()?;
    let row = conn
        .query_row(
            "SELECT id, project_id, name, base_url, variables_json, headers_json, is_default
             FROM environments WHERE project_id = ?1 AND is_default = 1",
            params![project_id.to_string()],
            environment_columns,
        )
        .optional()?;
    row.map(environment_from_columns).transpose()
}

type EnvironmentColumns = (String, String, String, String, String, String, i64);

fn environment_columns(row: &Row<'_>) -> rusqlite::Result<EnvironmentColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn environment_from_columns(cols: EnvironmentColumns) -> Result<Environment> {
    let (id, project_id, name, base_url, variables_json, headers_json, is_default) = cols;
    Ok(Environment {
        id: parse_uuid(&id)?,
        project_id: parse_uuid(&project_id)?,
        name,
        base_url,
        variables: serde_json::from_str(&variables_json)?,
        headers: serde_json::from_str(&headers_json)?,
        is_default: is_default != 0,
    })
}

// ---- interfaces ----

pub fn upsert_interface(pool: &Pool, interface: &Interface) -> Result<()> {
    let conn = pool.get()?;
    let default_body_json = interface
        .default_body
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO interfaces (id, project_id, name, method, path, default_body_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            interface.id.to_string(),
            interface.project_id.to_string(),
            interface.name,
            interface.method,
            interface.path,
            default_body_json,
        ],
    )?;
    Ok(())
}

pub fn get_interface(pool: &Pool, id: Uuid) -> Result<Option<Interface>> {
    let conn = pool.get()?;
    let row: Option<(String, String, String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, project_id, name, method, path, default_body_json
             FROM interfaces WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;

    row.map(|(id, project_id, name, method, path, default_body_json)| {
        Ok(Interface {
            id: parse_uuid(&id)?,
            project_id: parse_uuid(&project_id)?,
            name,
            method,
            path,
            default_body: default_body_json
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
        })
    })
    .transpose()
}

// ---- tasks ----

pub fn upsert_task(pool: &Pool, task: &Task) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO tasks
             (id, project_id, name, environment_id, cases_json, schedule_json,
              notifications_json, enabled, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))",
        params![
            task.id.to_string(),
            task.project_id.to_string(),
            task.name,
            task.environment_id.map(|id| id.to_string()),
            serde_json::to_string(&task.cases)?,
            serde_json::to_string(&task.schedule)?,
            serde_json::to_string(&task.notifications)?,
            task.enabled as i64,
        ],
    )?;
    Ok(())
}

pub fn get_task(pool: &Pool, id: Uuid) -> Result<Option<Task>> {
    let conn = pool.get()?;
    let row = conn
        .query_row(
            "SELECT id, project_id, name, environment_id, cases_json, schedule_json,
                    notifications_json, enabled
             FROM tasks WHERE id = ?1",
            params![id.to_string()],
            task_columns,
        )
        .optional()?;
    row.map(task_from_columns).transpose()
}

/// Enabled tasks whose schedule is switched on. Cron validity is the
/// scheduler's concern, not a storage filter.
pub fn list_scheduled_tasks(pool: &Pool) -> Result<Vec<Task>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, project_id, name, environment_id, cases_json, schedule_json,
                notifications_json, enabled
         FROM tasks WHERE enabled = 1",
    )?;
    let rows = stmt.query_map([], task_columns)?;

    let mut tasks = Vec::new();
    for row in rows {
        let task = task_from_columns(row?)?;
        if task.schedule.enabled {
            tasks.push(task);
        }
    }
    Ok(tasks)
}

type TaskColumns = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    i64,
);

fn task_columns(row: &Row<'_>) -> rusqlite::Result<TaskColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn task_from_columns(cols: TaskColumns) -> Result<Task> {
    let (id, project_id, name, environment_id, cases_json, schedule_json, notifications_json, enabled) =
        cols;
    Ok(Task {
        id: parse_uuid(&id)?,
        project_id: parse_uuid(&project_id)?,
        name,
        environment_id: environment_id.map(|s| parse_uuid(&s)).transpose()?,
        cases: serde_json::from_str(&cases_json)?,
        schedule: serde_json::from_str(&schedule_json)?,
        notifications: serde_json::from_str(&notifications_json)?,
        enabled: enabled != 0,
    })
}

// ---- results ----

/// Persist a full result snapshot. Called after creation and after every
/// case, so the stored row is always a valid crash checkpoint.
pub fn save_result(pool: &Pool, result: &RunResult) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO results
             (id, task_id, environment_id, status, summary_json, cases_json,
              started_at, completed_at, duration_ms, triggered_by, triggered_by_user)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            result.id.to_string(),
            result.task_id.to_string(),
            result.environment_id.to_string(),
            result.status.to_string(),
            serde_json::to_string(&result.summary)?,
            serde_json::to_string(&result.cases)?,
            result.started_at.to_rfc3339(),
            result.completed_at.map(|t| t.to_rfc3339()),
            result.duration_ms.map(|d| d as i64),
            result.triggered_by.to_string(),
            result.triggered_by_user,
        ],
    )?;
    Ok(())
}

pub fn get_result(pool: &Pool, id: Uuid) -> Result<Option<RunResult>> {
    let conn = pool.get()?;
    let row = conn
        .query_row(
            "SELECT id, task_id, environment_id, status, summary_json, cases_json,
                    started_at, completed_at, duration_ms, triggered_by, triggered_by_user
             FROM results WHERE id = ?1",
            params![id.to_string()],
            result_columns,
        )
        .optional()?;
    row.map(result_from_columns).transpose()
}

/// Results for a task, newest first, with 1-based pagination.
/// Returns the page plus the total row count.
pub fn list_results(
    pool: &Pool,
    task_id: Uuid,
    page: u32,
    per_page: u32,
) -> Result<(Vec<RunResult>, u64)> {
    let per_page = per_page.clamp(1, 100);
    let offset = (page.max(1) - 1) as i64 * per_page as i64;

    let conn = pool.get()?;
    let total: u64 = conn.query_row(
        "SELECT COUNT(*) FROM results WHERE task_id = ?1",
        params![task_id.to_string()],
        |row| row.get::<_, i64>(0),
    )? as u64;

    let mut stmt = conn.prepare(
        "SELECT id, task_id, environment_id, status, summary_json, cases_json,
                started_at, completed_at, duration_ms, triggered_by, triggered_by_user
         FROM results WHERE task_id = ?1
         ORDER BY started_at DESC
         LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt.query_map(
        params![task_id.to_string(), per_page as i64, offset],
        result_columns,
    )?;

    let mut results = Vec::new();
    for row in rows {
        results.push(result_from_columns(row?)?);
    }
    Ok((results, total))
}

type ResultColumns = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    String,
    Option<String>,
);

fn result_columns(row: &Row<'_>) -> rusqlite::Result<ResultColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn result_from_columns(cols: ResultColumns) -> Result<RunResult> {
    let (
        id,
        task_id,
        environment_id,
        status,
        summary_json,
        cases_json,
        started_at,
        completed_at,
        duration_ms,
        triggered_by,
        triggered_by_user,
    ) = cols;
    Ok(RunResult {
        id: parse_uuid(&id)?,
        task_id: parse_uuid(&task_id)?,
        environment_id: parse_uuid(&environment_id)?,
        status: serde_json::from_value(serde_json::Value::String(status))?,
        summary: serde_json::from_str(&summary_json)?,
        cases: serde_json::from_str(&cases_json)?,
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.map(|t| parse_timestamp(&t)).transpose()?,
        duration_ms: duration_ms.map(|d| d as u64),
        triggered_by: serde_json::from_value(serde_json::Value::String(triggered_by))?,
        triggered_by_user,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid uuid in database: {}", s))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp in database: {}", s))?
        .with_timezone(&Utc))
}
